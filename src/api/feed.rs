//! Purpose: Consume a changes-style endpoint as a lazy sequence of rows.
//! Exports: `Feed`, `FeedOptions`, `FeedMode`, `Style`, `FeedRow`, `ChangeEvent`, `Seq`, `StopHandle`.
//! Role: One feed = one logical consumption (normal, longpoll or continuous).
//! Invariants: Options are validated before any request; validation failures issue no I/O.
//! Invariants: Rows are yielded in server order with no buffering beyond one body (normal) or one line (continuous).
//! Invariants: After an early stop, `last_seq` is undefined and no further rows are yielded.
#![allow(clippy::result_large_err)]

use super::resource::Resource;
use super::session::{ApiResult, Session};
use crate::core::error::{Error, ErrorKind};
use crate::core::lines::{DEFAULT_CHUNK_SIZE, LineDecoder, Unit};
use crate::core::options::{self, OptionSpec};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Opaque server cursor; strings on CouchDB 2+, integers on older servers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq(Value);

impl Seq {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    /// The server's "start from the current end of the log" marker.
    pub fn now() -> Self {
        Self(Value::from("now"))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn to_param(&self) -> String {
        match &self.0 {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_param())
    }
}

impl From<&str> for Seq {
    fn from(value: &str) -> Self {
        Self(Value::from(value))
    }
}

impl From<String> for Seq {
    fn from(value: String) -> Self {
        Self(Value::from(value))
    }
}

impl From<u64> for Seq {
    fn from(value: u64) -> Self {
        Self(Value::from(value))
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FeedMode {
    #[default]
    Normal,
    Longpoll,
    Continuous,
}

impl FeedMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedMode::Normal => "normal",
            FeedMode::Longpoll => "longpoll",
            FeedMode::Continuous => "continuous",
        }
    }
}

impl FromStr for FeedMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "normal" => Ok(FeedMode::Normal),
            "longpoll" => Ok(FeedMode::Longpoll),
            "continuous" => Ok(FeedMode::Continuous),
            other => Err(Error::new(ErrorKind::Argument)
                .with_message(format!("invalid value ({other}) for feed option"))
                .with_option("feed")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Style {
    MainOnly,
    AllDocs,
}

impl Style {
    pub fn as_str(self) -> &'static str {
        match self {
            Style::MainOnly => "main_only",
            Style::AllDocs => "all_docs",
        }
    }
}

/// Feed options by server name. Typed setters cover the documented options;
/// `set` accepts anything and defers to validation at consumption start.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeedOptions {
    values: BTreeMap<String, Value>,
    filter_params: BTreeMap<String, String>,
    chunk_size: Option<usize>,
}

impl FeedOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn feed(self, mode: FeedMode) -> Self {
        self.set("feed", mode.as_str())
    }

    pub fn since(self, seq: impl Into<Seq>) -> Self {
        let seq = seq.into();
        self.set("since", seq.0)
    }

    pub fn limit(self, limit: u64) -> Self {
        self.set("limit", limit)
    }

    /// Heartbeat interval in milliseconds.
    pub fn heartbeat(self, millis: u64) -> Self {
        self.set("heartbeat", millis)
    }

    /// Server-side timeout in milliseconds; bounds how long one connection stays open.
    pub fn timeout(self, millis: u64) -> Self {
        self.set("timeout", millis)
    }

    pub fn include_docs(self, include: bool) -> Self {
        self.set("include_docs", include)
    }

    pub fn conflicts(self, conflicts: bool) -> Self {
        self.set("conflicts", conflicts)
    }

    pub fn descending(self, descending: bool) -> Self {
        self.set("descending", descending)
    }

    pub fn style(self, style: Style) -> Self {
        self.set("style", style.as_str())
    }

    pub fn filter(self, filter: impl Into<String>) -> Self {
        self.set("filter", filter.into())
    }

    pub fn view(self, view: impl Into<String>) -> Self {
        self.set("view", view.into())
    }

    pub fn doc_ids<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<Value> = ids.into_iter().map(|id| Value::from(id.into())).collect();
        self.set("doc_ids", ids)
    }

    pub fn seq_interval(self, interval: u64) -> Self {
        self.set("seq_interval", interval)
    }

    /// Extra query parameter for a custom filter function; requires `filter`.
    pub fn filter_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter_params.insert(name.into(), value.into());
        self
    }

    /// Read buffer capacity of the line decoder. Never sent to the server.
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = Some(bytes);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub(crate) fn insert(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    pub(crate) fn insert_default(&mut self, name: &str, value: Value) {
        self.values.entry(name.to_string()).or_insert(value);
    }

    pub(crate) fn validate(&self, schema: &[OptionSpec]) -> ApiResult<()> {
        for (name, value) in &self.values {
            options::validate(schema, name, value)?;
        }
        if !self.filter_params.is_empty() && self.values.get("filter").is_none_or(Value::is_null) {
            let name = self.filter_params.keys().next().cloned().unwrap_or_default();
            return Err(Error::new(ErrorKind::Argument)
                .with_message(format!("invalid argument {name}"))
                .with_hint("Custom filter parameters require the filter option.")
                .with_option(name));
        }
        if self.chunk_size == Some(0) {
            return Err(Error::new(ErrorKind::Argument)
                .with_message("argument chunk_size must be > 0; found 0")
                .with_option("chunk_size"));
        }
        Ok(())
    }

    pub(crate) fn mode(&self) -> ApiResult<FeedMode> {
        match self.values.get("feed").and_then(Value::as_str) {
            Some(mode) => mode.parse(),
            None => Ok(FeedMode::Normal),
        }
    }

    fn heartbeat_enabled(&self) -> bool {
        match self.values.get("heartbeat") {
            Some(Value::Bool(enabled)) => *enabled,
            Some(Value::Number(number)) => number.as_u64().is_some_and(|millis| millis > 0),
            _ => false,
        }
    }

    pub(crate) fn to_params(&self) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self
            .values
            .iter()
            .filter(|(name, value)| !(name.as_str() == "heartbeat" && **value == Value::Bool(false)))
            .filter_map(|(name, value)| options::feed_param(value).map(|text| (name.clone(), text)))
            .collect();
        params.extend(
            self.filter_params
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        params
    }
}

/// One row of a changes-style response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seq: Option<Seq>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    db_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    changes: Vec<Value>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    doc: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    deleted: bool,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl ChangeEvent {
    pub fn seq(&self) -> Option<&Seq> {
        self.seq.as_ref()
    }

    /// Document id for `_changes` rows.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Database name for `_db_updates` rows.
    pub fn db_name(&self) -> Option<&str> {
        self.db_name.as_deref()
    }

    pub fn changes(&self) -> &[Value] {
        &self.changes
    }

    /// Revisions listed under `changes`.
    pub fn revs(&self) -> Vec<&str> {
        self.changes
            .iter()
            .filter_map(|change| change.get("rev").and_then(Value::as_str))
            .collect()
    }

    /// Update type for `_db_updates` rows (`created`, `updated`, `deleted`).
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn doc(&self) -> Option<&Value> {
        self.doc.as_ref()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn extra(&self, field: &str) -> Option<&Value> {
        self.extra.get(field)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FeedRow {
    Change(Box<ChangeEvent>),
    /// Keep-alive from the server while no changes are pending.
    Heartbeat,
    /// Undecoded line in raw mode.
    Raw(Bytes),
}

impl FeedRow {
    pub fn change(&self) -> Option<&ChangeEvent> {
        match self {
            FeedRow::Change(event) => Some(&**event),
            _ => None,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, FeedRow::Heartbeat)
    }
}

/// Cooperative cancellation flag, shareable across threads.
#[derive(Clone, Debug, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// The raw flag, for wiring into signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }
}

#[derive(Deserialize)]
struct ChangesBody {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    last_seq: Option<Seq>,
    #[serde(default)]
    pending: Option<u64>,
}

enum State {
    Idle,
    Draining {
        rows: std::vec::IntoIter<Value>,
        last_seq: Option<Seq>,
    },
    Streaming {
        lines: LineDecoder,
        heartbeats: bool,
    },
    Done,
    Stopped,
}

pub struct Feed {
    session: Arc<dyn Session>,
    resource: Resource,
    options: FeedOptions,
    raw: bool,
    stop: StopHandle,
    state: State,
    last_seq: Option<Seq>,
    pending: Option<u64>,
}

impl Feed {
    pub fn new(session: Arc<dyn Session>, resource: Resource, options: FeedOptions) -> Self {
        Self {
            session,
            resource,
            options,
            raw: false,
            stop: StopHandle::new(),
            state: State::Idle,
            last_seq: None,
            pending: None,
        }
    }

    /// Yield undecoded lines instead of change events.
    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    pub(crate) fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn options(&self) -> &FeedOptions {
        &self.options
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Last cursor seen; `None` before any row and after an early stop.
    pub fn last_seq(&self) -> Option<&Seq> {
        if self.stop.is_stopped() && !matches!(self.state, State::Done) {
            return None;
        }
        self.last_seq.as_ref()
    }

    /// `pending` count reported by a normal or longpoll response.
    pub fn pending(&self) -> Option<u64> {
        self.pending
    }

    pub fn next_row(&mut self) -> ApiResult<Option<FeedRow>> {
        match self.advance() {
            Ok(row) => Ok(row),
            Err(err) => {
                tracing::warn!(url = %self.resource.url(), error = %err, "feed failed");
                self.state = State::Done;
                Err(err)
            }
        }
    }

    fn advance(&mut self) -> ApiResult<Option<FeedRow>> {
        loop {
            if matches!(self.state, State::Done | State::Stopped) {
                return Ok(None);
            }
            if self.stop.is_stopped() {
                self.halt();
                return Ok(None);
            }
            match &mut self.state {
                State::Idle => self.start()?,
                State::Draining { rows, last_seq } => match rows.next() {
                    Some(row) => {
                        let event = decode_event(row)?;
                        if let Some(seq) = event.seq() {
                            self.last_seq = Some(seq.clone());
                        }
                        return Ok(Some(FeedRow::Change(Box::new(event))));
                    }
                    None => {
                        if let Some(seq) = last_seq.take() {
                            self.last_seq = Some(seq);
                        }
                        self.state = State::Done;
                    }
                },
                State::Streaming { lines, heartbeats } => {
                    let heartbeats = *heartbeats;
                    let unit = lines.next_unit()?;
                    if self.stop.is_stopped() {
                        self.halt();
                        return Ok(None);
                    }
                    match unit {
                        None => self.state = State::Done,
                        Some(Unit::Heartbeat) => {
                            if heartbeats {
                                return Ok(Some(FeedRow::Heartbeat));
                            }
                        }
                        Some(Unit::Payload(line)) if self.raw => {
                            return Ok(Some(FeedRow::Raw(Bytes::from(line))));
                        }
                        Some(Unit::Payload(line)) => {
                            if let Some(row) = self.decode_line(&line)? {
                                return Ok(Some(row));
                            }
                        }
                    }
                }
                State::Done | State::Stopped => return Ok(None),
            }
        }
    }

    fn start(&mut self) -> ApiResult<()> {
        self.options.validate(self.resource.schema())?;
        for (name, value) in self.resource.defaults() {
            self.options.insert_default(name, value);
        }
        let mode = self.options.mode()?;
        let params = self.options.to_params();
        tracing::debug!(url = %self.resource.url(), mode = mode.as_str(), "starting feed");
        let response = self
            .session
            .get(self.resource.url(), &params)?
            .error_for_status()?;
        if self.raw || mode == FeedMode::Continuous {
            let chunk_size = self.options.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
            self.state = State::Streaming {
                lines: LineDecoder::with_chunk_size(response.into_reader(), chunk_size),
                heartbeats: mode != FeedMode::Normal && self.options.heartbeat_enabled(),
            };
        } else {
            let body: ChangesBody = response.into_json()?;
            self.pending = body.pending;
            self.state = State::Draining {
                rows: body.results.into_iter(),
                last_seq: body.last_seq,
            };
        }
        Ok(())
    }

    fn decode_line(&mut self, line: &[u8]) -> ApiResult<Option<FeedRow>> {
        let value: Value = serde_json::from_slice(line).map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message(format!(
                    "bad JSON line: {}",
                    String::from_utf8_lossy(line)
                ))
                .with_source(err)
        })?;
        if value.get("seq").is_none() {
            if let Some(last_seq) = value.get("last_seq") {
                self.last_seq = Some(Seq(last_seq.clone()));
                if let Some(pending) = value.get("pending").and_then(Value::as_u64) {
                    self.pending = Some(pending);
                }
                return Ok(None);
            }
        }
        let event = decode_event(value)?;
        if let Some(seq) = event.seq() {
            self.last_seq = Some(seq.clone());
        }
        Ok(Some(FeedRow::Change(Box::new(event))))
    }

    fn halt(&mut self) {
        self.state = State::Stopped;
        self.last_seq = None;
    }
}

impl Iterator for Feed {
    type Item = ApiResult<FeedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

fn decode_event(value: Value) -> ApiResult<ChangeEvent> {
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        let reason = value.get("reason").and_then(Value::as_str).unwrap_or_default();
        return Err(Error::new(ErrorKind::Transport)
            .with_message(format!("feed error row: {error} {reason}").trim_end().to_string()));
    }
    serde_json::from_value(value).map_err(|err| {
        Error::new(ErrorKind::Transport)
            .with_message("invalid change row")
            .with_source(err)
    })
}
