//! Purpose: Continuous consumption that survives server-side connection ends.
//! Exports: `InfiniteFeed`.
//! Role: Chains continuous `Feed`s, resuming each from the previous one's cursor.
//! Invariants: Ends only on stop or a non-timeout error; a clean end of stream reconnects.
//! Invariants: Resumption is at-least-once; rows around a reconnect may repeat.
#![allow(clippy::result_large_err)]

use super::feed::{Feed, FeedMode, FeedOptions, FeedRow, Seq, StopHandle};
use super::resource::Resource;
use super::session::{ApiResult, Session};
use crate::core::error::{Error, ErrorKind};
use serde_json::Value;
use std::sync::Arc;

pub struct InfiniteFeed {
    session: Arc<dyn Session>,
    resource: Resource,
    options: FeedOptions,
    stop: StopHandle,
    current: Option<Feed>,
    cursor: Option<Seq>,
    reconnects: u64,
    started: bool,
    finished: bool,
}

impl InfiniteFeed {
    pub fn new(session: Arc<dyn Session>, resource: Resource, options: FeedOptions) -> Self {
        Self {
            session,
            resource,
            options,
            stop: StopHandle::new(),
            current: None,
            cursor: None,
            reconnects: 0,
            started: false,
            finished: false,
        }
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Number of times a finished connection was replaced.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Cursor the next connection would resume from.
    pub fn cursor(&self) -> Option<&Seq> {
        self.cursor.as_ref()
    }

    /// Last cursor seen; `None` after a stop.
    pub fn last_seq(&self) -> Option<&Seq> {
        if self.stop.is_stopped() {
            return None;
        }
        self.cursor.as_ref()
    }

    pub fn next_row(&mut self) -> ApiResult<Option<FeedRow>> {
        let result = self.advance();
        if result.is_err() {
            self.finished = true;
            self.current = None;
        }
        result
    }

    fn advance(&mut self) -> ApiResult<Option<FeedRow>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if self.stop.is_stopped() {
                self.finished = true;
                self.current = None;
                return Ok(None);
            }
            if !self.started {
                self.check()?;
                self.cursor = Some(
                    self.options
                        .get("since")
                        .filter(|since| !since.is_null())
                        .map(|since| Seq::new(since.clone()))
                        .unwrap_or_else(Seq::now),
                );
                self.started = true;
            }
            if self.current.is_none() {
                self.current = Some(self.open());
            }
            let Some(feed) = self.current.as_mut() else {
                continue;
            };
            match feed.next_row() {
                Ok(Some(row)) => {
                    if let Some(seq) = row.change().and_then(|event| event.seq()) {
                        self.cursor = Some(seq.clone());
                    }
                    return Ok(Some(row));
                }
                Ok(None) if self.stop.is_stopped() => {
                    self.finished = true;
                    self.current = None;
                    return Ok(None);
                }
                Ok(None) => self.reconnect(),
                Err(err) if err.kind() == ErrorKind::Timeout => {
                    tracing::debug!(error = %err, "continuous feed timed out");
                    self.reconnect();
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn check(&self) -> ApiResult<()> {
        if !self.resource.supports_infinite() {
            return Err(Error::new(ErrorKind::Protocol)
                .with_message("infinite _db_updates feed not supported for CouchDB")
                .with_hint("Use a bounded feed with longpoll against CouchDB servers."));
        }
        self.options.validate(self.resource.schema())?;
        match self.options.get("feed") {
            None | Some(Value::Null) => Ok(()),
            Some(mode) if mode.as_str() == Some(FeedMode::Continuous.as_str()) => Ok(()),
            Some(_) => Err(Error::new(ErrorKind::Protocol)
                .with_message("infinite feed mode must be continuous")
                .with_option("feed")),
        }
    }

    fn open(&self) -> Feed {
        let mut options = self.options.clone();
        options.insert("feed", Value::from(FeedMode::Continuous.as_str()));
        if let Some(cursor) = &self.cursor {
            options.insert("since", cursor.as_value().clone());
        }
        Feed::new(self.session.clone(), self.resource.clone(), options)
            .with_stop_handle(self.stop.clone())
    }

    fn reconnect(&mut self) {
        if let Some(seq) = self.current.take().and_then(|feed| feed.last_seq().cloned()) {
            self.cursor = Some(seq);
        }
        self.reconnects += 1;
        tracing::info!(
            url = %self.resource.url(),
            since = %self.cursor.as_ref().map(Seq::to_param).unwrap_or_default(),
            reconnects = self.reconnects,
            "reconnecting continuous feed"
        );
    }
}

impl Iterator for InfiniteFeed {
    type Item = ApiResult<FeedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::InfiniteFeed;
    use crate::api::feed::{FeedMode, FeedOptions, Seq};
    use crate::api::resource::Resource;
    use crate::api::session::{ApiResult, Params, Response, Session};
    use crate::core::error::{Error, ErrorKind};
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::Arc;
    use url::Url;

    /// Plays back one reply per request; an exhausted script is an error.
    struct Script {
        replies: Mutex<VecDeque<ApiResult<Response>>>,
        calls: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl Script {
        fn new(replies: Vec<ApiResult<Response>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn since_params(&self) -> Vec<String> {
            self.calls
                .lock()
                .expect("calls")
                .iter()
                .filter_map(|params| {
                    params
                        .iter()
                        .find(|(name, _)| name == "since")
                        .map(|(_, value)| value.clone())
                })
                .collect()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().expect("calls").len()
        }
    }

    impl Session for Script {
        fn get(&self, _url: &Url, params: &Params) -> ApiResult<Response> {
            self.calls.lock().expect("calls").push(params.to_vec());
            self.replies
                .lock()
                .expect("replies")
                .pop_front()
                .unwrap_or_else(|| Err(Error::new(ErrorKind::Transport).with_message("script exhausted")))
        }

        fn post(&self, url: &Url, params: &Params, _body: &Value) -> ApiResult<Response> {
            self.get(url, params)
        }
    }

    fn ok(body: &'static str) -> ApiResult<Response> {
        Ok(Response::from_bytes(200, body))
    }

    fn db() -> Resource {
        Resource::database("http://localhost:5984/db").expect("resource")
    }

    #[test]
    fn reconnects_from_last_seq() {
        let script = Script::new(vec![
            ok("{\"seq\":\"1-a\",\"id\":\"a\"}\n{\"seq\":\"2-b\",\"id\":\"b\"}\n"),
            ok("{\"seq\":\"3-c\",\"id\":\"c\"}\n"),
        ]);
        let mut feed = InfiniteFeed::new(script.clone(), db(), FeedOptions::new());
        let ids: Vec<String> = feed
            .by_ref()
            .take(3)
            .map(|row| {
                let row = row.expect("row");
                row.change().and_then(|event| event.id()).unwrap_or_default().to_string()
            })
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(feed.reconnects(), 1);
        assert_eq!(script.since_params(), vec!["now", "2-b"]);
        assert_eq!(feed.last_seq(), Some(&Seq::from("3-c")));
    }

    #[test]
    fn timeouts_reconnect_and_other_errors_end() {
        let script = Script::new(vec![
            Err(Error::new(ErrorKind::Timeout).with_message("idle")),
            ok("{\"seq\":5,\"id\":\"x\"}\n"),
        ]);
        let options = FeedOptions::new().since(Seq::from(4));
        let mut feed = InfiniteFeed::new(script.clone(), db(), options);
        let row = feed.next_row().expect("row").expect("some");
        assert_eq!(row.change().and_then(|event| event.id()), Some("x"));
        let err = feed.next_row().expect_err("exhausted");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(feed.next_row().expect("finished").is_none());
        assert_eq!(script.since_params(), vec!["4", "4", "5"]);
    }

    #[test]
    fn couch_server_is_a_protocol_error() {
        let script = Script::new(Vec::new());
        let resource = Resource::couch_server("http://localhost:5984").expect("resource");
        let err = InfiniteFeed::new(script.clone(), resource, FeedOptions::new())
            .next_row()
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(script.call_count(), 0);
    }

    #[test]
    fn explicit_non_continuous_mode_is_a_protocol_error() {
        let script = Script::new(Vec::new());
        let options = FeedOptions::new().feed(FeedMode::Longpoll);
        let err = InfiniteFeed::new(script.clone(), db(), options)
            .next_row()
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(script.call_count(), 0);
    }

    #[test]
    fn stop_ends_without_request() {
        let script = Script::new(vec![ok("{\"seq\":1,\"id\":\"a\"}\n")]);
        let mut feed = InfiniteFeed::new(script.clone(), db(), FeedOptions::new());
        feed.stop_handle().stop();
        assert!(feed.next_row().expect("stopped").is_none());
        assert!(feed.last_seq().is_none());
        assert_eq!(script.call_count(), 0);
    }
}
