//! Purpose: In-memory CouchDB stand-in shared by the fixture test suites.
//! Exports: `FixtureSession`, `Recorded`, `doc_id`, `DB_URL`, `SERVER_URL`.
//! Role: Serves `_changes`, `_all_docs` and `_find` from one change log and records requests.
//! Invariants: Change `n` (0-based) has id `docNNN` and integer seq `n + 1`.
//! Invariants: `since=N` resumes after seq `N`, i.e. at change index `N`.
#![allow(dead_code)]

use couchfeed::api::{ApiResult, Params, Response, Session};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use url::Url;

pub const SERVER_URL: &str = "http://fixture.test:5984";
pub const DB_URL: &str = "http://fixture.test:5984/animals";

pub fn doc_id(n: usize) -> String {
    format!("doc{n:03}")
}

#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: &'static str,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl Recorded {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Default)]
struct State {
    ids: Vec<String>,
    requests: Vec<Recorded>,
}

pub struct FixtureSession {
    state: Mutex<State>,
    drop_after: Option<usize>,
    grow_per_connection: usize,
    heartbeat_after_each_row: bool,
    strict_limits: bool,
}

impl FixtureSession {
    pub fn with_docs(count: usize) -> Self {
        Self {
            state: Mutex::new(State {
                ids: (0..count).map(doc_id).collect(),
                requests: Vec::new(),
            }),
            drop_after: None,
            grow_per_connection: 0,
            heartbeat_after_each_row: false,
            strict_limits: false,
        }
    }

    /// Continuous responses end abruptly after this many rows, without a `last_seq` line.
    pub fn drop_after(mut self, rows: usize) -> Self {
        self.drop_after = Some(rows);
        self
    }

    /// Appends this many changes whenever a continuous connection opens.
    pub fn grow_per_connection(mut self, rows: usize) -> Self {
        self.grow_per_connection = rows;
        self
    }

    /// Continuous responses carry an empty line after every row.
    pub fn heartbeats(mut self) -> Self {
        self.heartbeat_after_each_row = true;
        self
    }

    /// Negative limits are rejected with 400 instead of answered with nothing.
    pub fn strict_limits(mut self) -> Self {
        self.strict_limits = true;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().expect("state").requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().expect("state").requests.len()
    }

    fn record(&self, method: &'static str, url: &Url, params: &Params, body: Option<&Value>) {
        self.state.lock().expect("state").requests.push(Recorded {
            method,
            path: url.path().to_string(),
            params: params.to_vec(),
            body: body.cloned(),
        });
    }

    fn changes(&self, params: &[(String, String)]) -> Response {
        let param = |name: &str| {
            params
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };
        let mut state = self.state.lock().expect("state");
        let feed = param("feed").unwrap_or("normal");
        let since = match param("since") {
            None => 0,
            Some("now") => state.ids.len(),
            Some(value) => value.parse::<usize>().unwrap_or(0),
        };
        if feed == "continuous" {
            let start = state.ids.len();
            let grow = self.grow_per_connection;
            state.ids.extend((start..start + grow).map(doc_id));
        }
        let total = state.ids.len();
        let limit = param("limit")
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(usize::MAX);
        let include_docs = param("include_docs") == Some("true");
        let rows: Vec<Value> = (since.min(total)..total)
            .take(limit)
            .map(|n| {
                let mut row = json!({
                    "seq": n + 1,
                    "id": state.ids[n],
                    "changes": [{"rev": "1-a"}],
                });
                if include_docs {
                    row["doc"] = json!({"_id": state.ids[n], "_rev": "1-a"});
                }
                row
            })
            .collect();
        let last_seq = rows
            .last()
            .and_then(|row| row["seq"].as_u64())
            .unwrap_or(since as u64);

        if feed != "continuous" {
            let pending = total as u64 - last_seq.min(total as u64);
            let body = json!({"results": rows, "last_seq": last_seq, "pending": pending});
            return Response::from_json(200, &body);
        }

        let mut body = String::new();
        let mut dropped = false;
        for (served, row) in rows.iter().enumerate() {
            body.push_str(&row.to_string());
            body.push('\n');
            if self.heartbeat_after_each_row {
                body.push('\n');
            }
            if self.drop_after == Some(served + 1) {
                dropped = true;
                break;
            }
        }
        if !dropped {
            body.push_str(&json!({"last_seq": last_seq, "pending": 0}).to_string());
            body.push('\n');
        }
        Response::from_bytes(200, body)
    }

    fn all_docs(&self, params: &[(String, String)], keys: Option<&Value>) -> Response {
        let json_param = |name: &str| {
            params
                .iter()
                .find(|(key, _)| key == name)
                .and_then(|(_, value)| serde_json::from_str::<Value>(value).ok())
        };
        let state = self.state.lock().expect("state");
        let limit = json_param("limit").and_then(|value| value.as_i64());
        if let Some(limit) = limit.filter(|limit| *limit < 0) {
            if self.strict_limits {
                return bad_limit(limit);
            }
            return Response::from_json(200, &json!({"total_rows": state.ids.len(), "rows": []}));
        }
        let skip = json_param("skip").and_then(|value| value.as_u64()).unwrap_or(0) as usize;
        let startkey = json_param("startkey");
        let key = json_param("key");
        let wanted: Option<Vec<Value>> = keys.and_then(Value::as_array).cloned();
        let rows: Vec<Value> = state
            .ids
            .iter()
            .filter(|id| match &startkey {
                Some(Value::String(start)) => id.as_str() >= start.as_str(),
                _ => true,
            })
            .filter(|id| match &key {
                Some(key) => key.as_str() == Some(id.as_str()),
                None => true,
            })
            .filter(|id| match &wanted {
                Some(wanted) => wanted.iter().any(|key| key.as_str() == Some(id.as_str())),
                None => true,
            })
            .skip(skip)
            .take(limit.map_or(usize::MAX, |limit| limit as usize))
            .map(|id| json!({"id": id, "key": id, "value": {"rev": "1-a"}}))
            .collect();
        Response::from_json(200, &json!({"total_rows": state.ids.len(), "rows": rows}))
    }

    fn find(&self, body: &Value) -> Response {
        let state = self.state.lock().expect("state");
        let limit = body.get("limit").and_then(Value::as_i64);
        if let Some(limit) = limit.filter(|limit| *limit < 0) {
            if self.strict_limits {
                return bad_limit(limit);
            }
            return Response::from_json(200, &json!({"docs": []}));
        }
        let skip = body.get("skip").and_then(Value::as_u64).unwrap_or(0) as usize;
        let docs: Vec<Value> = state
            .ids
            .iter()
            .enumerate()
            .skip(skip)
            .take(limit.map_or(25, |limit| limit as usize))
            .map(|(n, id)| json!({"_id": id, "_rev": "1-a", "n": n}))
            .collect();
        Response::from_json(200, &json!({"docs": docs}))
    }
}

fn bad_limit(limit: i64) -> Response {
    Response::from_json(
        400,
        &json!({
            "error": "query_parse_error",
            "reason": format!("Invalid value for positive integer: \"{limit}\""),
        }),
    )
}

fn not_found() -> Response {
    Response::from_json(404, &json!({"error": "not_found", "reason": "missing"}))
}

impl Session for FixtureSession {
    fn get(&self, url: &Url, params: &Params) -> ApiResult<Response> {
        self.record("GET", url, params, None);
        let path = url.path();
        if path.ends_with("/_changes") {
            return Ok(self.changes(params));
        }
        if path.ends_with("/_all_docs") {
            return Ok(self.all_docs(params, None));
        }
        Ok(not_found())
    }

    fn post(&self, url: &Url, params: &Params, body: &Value) -> ApiResult<Response> {
        self.record("POST", url, params, Some(body));
        let path = url.path();
        if path.ends_with("/_all_docs") {
            return Ok(self.all_docs(params, body.get("keys")));
        }
        if path.ends_with("/_find") {
            return Ok(self.find(body));
        }
        Ok(not_found())
    }
}
