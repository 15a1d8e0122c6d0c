//! Purpose: HTTP collaborator contract for feeds and result windows.
//! Exports: `Session`, `Response`, `SessionConfig`, `UreqSession`.
//! Role: The only place that touches the wire; everything above works on `Response`.
//! Invariants: Sessions are shared read-only; this layer never mutates auth state.
//! Invariants: Non-2xx responses are returned as `Response`s and rejected by `error_for_status`.
#![allow(clippy::result_large_err)]

use crate::core::error::{Error, ErrorKind};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::io::{Cursor, Read};
use std::time::Duration;
use url::Url;

pub type ApiResult<T> = Result<T, Error>;

/// Ordered query parameters, already rendered to strings.
pub type Params = [(String, String)];

pub trait Session: Send + Sync {
    fn get(&self, url: &Url, params: &Params) -> ApiResult<Response>;

    fn post(&self, url: &Url, params: &Params, body: &Value) -> ApiResult<Response>;
}

pub struct Response {
    status: u16,
    body: Box<dyn Read + Send>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct CouchError {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

impl Response {
    pub fn new(status: u16, body: impl Read + Send + 'static) -> Self {
        Self {
            status,
            body: Box::new(body),
        }
    }

    pub fn from_bytes(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status, Cursor::new(body.into()))
    }

    pub fn from_json(status: u16, body: &Value) -> Self {
        Self::from_bytes(status, body.to_string())
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns a non-2xx response into a transport error carrying the server's reason.
    pub fn error_for_status(self) -> ApiResult<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let status = self.status;
        let body = self.into_string().unwrap_or_default();
        let mut message = format!("remote error status {status}");
        if let Ok(couch) = serde_json::from_str::<CouchError>(&body) {
            for part in [couch.error, couch.reason].into_iter().flatten() {
                message.push(' ');
                message.push_str(&part);
            }
        }
        Err(Error::new(ErrorKind::Transport)
            .with_message(message)
            .with_status(status))
    }

    pub fn into_reader(self) -> Box<dyn Read + Send> {
        self.body
    }

    pub fn into_string(self) -> ApiResult<String> {
        let mut reader = self.body;
        let mut body = String::new();
        reader.read_to_string(&mut body).map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("failed to read response body")
                .with_source(err)
        })?;
        Ok(body)
    }

    pub fn into_json<R: DeserializeOwned>(self) -> ApiResult<R> {
        let body = self.into_string()?;
        serde_json::from_str(&body).map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("invalid response json")
                .with_source(err)
        })
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub base_url: Url,
    pub connect_timeout: Option<Duration>,
    /// Bounds how long a single read may block; continuous feeds see it as an idle timeout.
    pub read_timeout: Option<Duration>,
    pub user_agent: String,
    pub authorization: Option<String>,
}

impl SessionConfig {
    pub fn new(base_url: impl AsRef<str>) -> ApiResult<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url.as_ref())?,
            connect_timeout: Some(Duration::from_secs(30)),
            read_timeout: None,
            user_agent: format!("couchfeed/{}", env!("CARGO_PKG_VERSION")),
            authorization: None,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Opaque `Authorization` header value, sent verbatim on every request.
    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }
}

#[derive(Clone)]
pub struct UreqSession {
    base_url: Url,
    authorization: Option<String>,
    agent: ureq::Agent,
}

impl UreqSession {
    pub fn new(config: SessionConfig) -> Self {
        let mut builder = ureq::AgentBuilder::new().user_agent(&config.user_agent);
        if let Some(timeout) = config.connect_timeout {
            builder = builder.timeout_connect(timeout);
        }
        if let Some(timeout) = config.read_timeout {
            builder = builder.timeout_read(timeout);
        }
        Self {
            base_url: config.base_url,
            authorization: config.authorization,
            agent: builder.build(),
        }
    }

    pub fn connect(base_url: impl AsRef<str>) -> ApiResult<Self> {
        Ok(Self::new(SessionConfig::new(base_url)?))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves path segments against the base url, e.g. `["mydb", "_changes"]`.
    pub fn url(&self, segments: &[&str]) -> ApiResult<Url> {
        build_url(&self.base_url, segments)
    }

    fn request(&self, method: &str, url: &Url, params: &Params) -> ureq::Request {
        let mut request = self
            .agent
            .request(method, url.as_str())
            .set("Accept", "application/json");
        for (name, value) in params {
            request = request.query(name, value);
        }
        if let Some(value) = &self.authorization {
            request = request.set("Authorization", value);
        }
        request
    }
}

impl Session for UreqSession {
    fn get(&self, url: &Url, params: &Params) -> ApiResult<Response> {
        tracing::debug!(url = %url, params = params.len(), "GET");
        finish(self.request("GET", url, params).call())
    }

    fn post(&self, url: &Url, params: &Params, body: &Value) -> ApiResult<Response> {
        tracing::debug!(url = %url, params = params.len(), "POST");
        let payload = serde_json::to_string(body).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode request json")
                .with_source(err)
        })?;
        finish(
            self.request("POST", url, params)
                .set("Content-Type", "application/json")
                .send_string(&payload),
        )
    }
}

fn finish(result: Result<ureq::Response, ureq::Error>) -> ApiResult<Response> {
    match result {
        Ok(resp) => Ok(Response::new(resp.status(), resp.into_reader())),
        Err(ureq::Error::Status(code, resp)) => Ok(Response::new(code, resp.into_reader())),
        Err(ureq::Error::Transport(err)) => {
            let kind = if transport_timed_out(&err) {
                ErrorKind::Timeout
            } else {
                ErrorKind::Transport
            };
            Err(Error::new(kind)
                .with_message("request failed")
                .with_source(err))
        }
    }
}

fn transport_timed_out(err: &ureq::Transport) -> bool {
    std::error::Error::source(err)
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .is_some_and(|io| {
            matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            )
        })
}

pub fn normalize_base_url(raw: &str) -> ApiResult<Url> {
    let mut url = Url::parse(raw).map_err(|err| {
        Error::new(ErrorKind::Argument)
            .with_message("invalid base url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Argument)
            .with_message("base url must use http or https scheme"));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

pub fn build_url(base_url: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| Error::new(ErrorKind::Argument).with_message("base url cannot be a base"))?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::{Response, build_url, normalize_base_url};
    use crate::core::error::ErrorKind;
    use serde_json::{Value, json};

    #[test]
    fn normalize_base_url_keeps_path_prefix() {
        let url = normalize_base_url("http://localhost:5984/couch?x=1").expect("url");
        assert_eq!(url.as_str(), "http://localhost:5984/couch/");
    }

    #[test]
    fn normalize_base_url_rejects_other_schemes() {
        let err = normalize_base_url("ftp://localhost").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Argument);
    }

    #[test]
    fn build_url_appends_escaped_segments() {
        let base = normalize_base_url("http://localhost:5984/").expect("url");
        let url = build_url(&base, &["my/db", "_changes"]).expect("url");
        assert_eq!(url.as_str(), "http://localhost:5984/my%2Fdb/_changes");
    }

    #[test]
    fn error_for_status_folds_couch_reason() {
        let response = Response::from_json(
            404,
            &json!({"error": "not_found", "reason": "Database does not exist."}),
        );
        let err = response.error_for_status().expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.status(), Some(404));
        assert_eq!(
            err.message(),
            Some("remote error status 404 not_found Database does not exist.")
        );
    }

    #[test]
    fn successful_response_reads_json() {
        let response = Response::from_json(200, &json!({"rows": []}));
        let value: Value = response.error_for_status().expect("ok").into_json().expect("json");
        assert_eq!(value, json!({"rows": []}));
    }

    #[test]
    fn invalid_json_is_a_transport_error() {
        let err = Response::from_bytes(200, "{nope")
            .into_json::<Value>()
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
