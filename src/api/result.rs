//! Purpose: Random access and paging over view and `_all_docs` rows.
//! Exports: `ViewResult`, `ResultOptions`, `RowSource`, `View`, `ViewRow`, `ResultByKey`, `Lookup`, `ViewRows`.
//! Role: Translates index, slice and key lookups into single remote fetches.
//! Invariants: The baseline options are validated once and never change.
//! Invariants: Paging owns `skip`/`limit`; a baseline carrying either cannot be iterated.
#![allow(clippy::result_large_err)]

use super::session::{ApiResult, Session, build_url, normalize_base_url};
use crate::core::error::{Error, ErrorKind};
use crate::core::options::{self, VIEW_OPTIONS};
use crate::core::window::{Plan, Window, range_ends};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::ops::{Range, RangeBounds, RangeFrom, RangeFull, RangeTo};
use std::sync::Arc;
use url::Url;

pub const DEFAULT_PAGE_SIZE: u64 = 100;

const KEY_OPTIONS: &[&str] = &["key", "keys", "startkey", "endkey"];
const WINDOW_OPTIONS: &[&str] = &["skip", "limit"];
/// `keys` travels in a POST body that key continuation cannot page through.
const ITERATION_EXCLUSIVE: &[&str] = &["keys", "skip", "limit"];

/// View request options plus the client-side `page_size`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultOptions {
    values: BTreeMap<String, Value>,
    page_size: Option<u64>,
}

impl ResultOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn key(self, key: impl Into<Value>) -> Self {
        self.set("key", key)
    }

    pub fn keys<I, K>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Value>,
    {
        let keys: Vec<Value> = keys.into_iter().map(Into::into).collect();
        self.set("keys", keys)
    }

    pub fn startkey(self, key: impl Into<Value>) -> Self {
        self.set("startkey", key)
    }

    pub fn endkey(self, key: impl Into<Value>) -> Self {
        self.set("endkey", key)
    }

    pub fn startkey_docid(self, id: impl Into<String>) -> Self {
        self.set("startkey_docid", id.into())
    }

    pub fn endkey_docid(self, id: impl Into<String>) -> Self {
        self.set("endkey_docid", id.into())
    }

    pub fn skip(self, skip: u64) -> Self {
        self.set("skip", skip)
    }

    pub fn limit(self, limit: u64) -> Self {
        self.set("limit", limit)
    }

    pub fn descending(self, descending: bool) -> Self {
        self.set("descending", descending)
    }

    pub fn include_docs(self, include: bool) -> Self {
        self.set("include_docs", include)
    }

    pub fn inclusive_end(self, inclusive: bool) -> Self {
        self.set("inclusive_end", inclusive)
    }

    pub fn reduce(self, reduce: bool) -> Self {
        self.set("reduce", reduce)
    }

    pub fn group(self, group: bool) -> Self {
        self.set("group", group)
    }

    pub fn group_level(self, level: u64) -> Self {
        self.set("group_level", level)
    }

    pub fn stable(self, stable: bool) -> Self {
        self.set("stable", stable)
    }

    pub fn stale(self, stale: impl Into<String>) -> Self {
        self.set("stale", stale.into())
    }

    pub fn update(self, update: impl Into<String>) -> Self {
        self.set("update", update.into())
    }

    /// Rows per fetch while iterating; never sent to the server.
    pub fn page_size(mut self, page_size: u64) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).filter(|value| !value.is_null())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn page_size_or_default(&self) -> u64 {
        self.page_size.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    /// Query parameters for a view GET; `keys` travels in a POST body instead.
    pub fn params(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .filter(|(name, _)| name.as_str() != "keys")
            .filter_map(|(name, value)| {
                options::view_param(name, value).map(|text| (name.clone(), text))
            })
            .collect()
    }

    fn insert(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    fn validate(&self) -> ApiResult<()> {
        for (name, value) in &self.values {
            options::validate(VIEW_OPTIONS, name, value)?;
        }
        if self.page_size == Some(0) {
            return Err(Error::new(ErrorKind::Argument)
                .with_message("argument page_size must be > 0; found 0")
                .with_option("page_size"));
        }
        Ok(())
    }

    fn first_present(&self, names: &[&str]) -> Option<&'static str> {
        [KEY_OPTIONS, WINDOW_OPTIONS]
            .concat()
            .into_iter()
            .filter(|name| names.contains(name))
            .find(|name| self.contains(name))
    }
}

/// Performs one view request and returns the `{rows: [...]}` body.
pub trait RowSource: Send + Sync {
    fn rows(&self, options: &ResultOptions) -> ApiResult<Value>;
}

impl<F> RowSource for F
where
    F: Fn(&ResultOptions) -> ApiResult<Value> + Send + Sync,
{
    fn rows(&self, options: &ResultOptions) -> ApiResult<Value> {
        self(options)
    }
}

/// A design-document view or `_all_docs` on one database.
pub struct View {
    session: Arc<dyn Session>,
    url: Url,
}

impl View {
    pub fn all_docs(session: Arc<dyn Session>, database_url: &str) -> ApiResult<Self> {
        let base = normalize_base_url(database_url)?;
        Ok(Self {
            session,
            url: build_url(&base, &["_all_docs"])?,
        })
    }

    /// `ddoc` may be given with or without its `_design/` prefix.
    pub fn design(
        session: Arc<dyn Session>,
        database_url: &str,
        ddoc: &str,
        view: &str,
    ) -> ApiResult<Self> {
        let base = normalize_base_url(database_url)?;
        let ddoc = ddoc.strip_prefix("_design/").unwrap_or(ddoc);
        Ok(Self {
            session,
            url: build_url(&base, &["_design", ddoc, "_view", view])?,
        })
    }

    pub fn from_url(session: Arc<dyn Session>, url: Url) -> Self {
        Self { session, url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl RowSource for View {
    fn rows(&self, options: &ResultOptions) -> ApiResult<Value> {
        let params = options.params();
        tracing::debug!(url = %self.url, "fetching view rows");
        let response = match options.get("keys") {
            Some(keys) => self
                .session
                .post(&self.url, &params, &json!({ "keys": keys }))?,
            None => self.session.get(&self.url, &params)?,
        };
        response.error_for_status()?.into_json()
    }
}

/// One view row. Reduce rows carry no `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    key: Value,
    #[serde(default)]
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    doc: Option<Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl ViewRow {
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn key(&self) -> &Value {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn doc(&self) -> Option<&Value> {
        self.doc.as_ref()
    }

    pub fn extra(&self, field: &str) -> Option<&Value> {
        self.extra.get(field)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Forces key semantics for a value that would otherwise read as an ordinal.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultByKey(Value);

impl ResultByKey {
    pub fn new(key: impl Into<Value>) -> Self {
        Self(key.into())
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// How a `ViewResult` is addressed: integers are ordinal, everything else is a key.
#[derive(Clone, Debug, PartialEq)]
pub enum Lookup {
    Index(i64),
    Slice(Option<i64>, Option<i64>),
    Key(Value),
    KeySlice(Option<Value>, Option<Value>),
}

impl From<i64> for Lookup {
    fn from(index: i64) -> Self {
        Lookup::Index(index)
    }
}

impl From<i32> for Lookup {
    fn from(index: i32) -> Self {
        Lookup::Index(i64::from(index))
    }
}

impl From<&str> for Lookup {
    fn from(key: &str) -> Self {
        Lookup::Key(Value::from(key))
    }
}

impl From<String> for Lookup {
    fn from(key: String) -> Self {
        Lookup::Key(Value::from(key))
    }
}

impl From<Vec<Value>> for Lookup {
    fn from(key: Vec<Value>) -> Self {
        Lookup::Key(Value::Array(key))
    }
}

impl From<ResultByKey> for Lookup {
    fn from(key: ResultByKey) -> Self {
        Lookup::Key(key.0)
    }
}

impl From<Range<i64>> for Lookup {
    fn from(range: Range<i64>) -> Self {
        let (start, stop) = range_ends(&range);
        Lookup::Slice(start, stop)
    }
}

impl From<RangeFrom<i64>> for Lookup {
    fn from(range: RangeFrom<i64>) -> Self {
        let (start, stop) = range_ends(&range);
        Lookup::Slice(start, stop)
    }
}

impl From<RangeTo<i64>> for Lookup {
    fn from(range: RangeTo<i64>) -> Self {
        let (start, stop) = range_ends(&range);
        Lookup::Slice(start, stop)
    }
}

impl From<RangeFull> for Lookup {
    fn from(_: RangeFull) -> Self {
        Lookup::Slice(None, None)
    }
}

pub struct ViewResult {
    source: Box<dyn RowSource>,
    options: ResultOptions,
    window: Window,
}

impl ViewResult {
    pub fn new(source: impl RowSource + 'static, options: ResultOptions) -> ApiResult<Self> {
        options.validate()?;
        let window = Window::new(
            options.get("skip").and_then(Value::as_u64).unwrap_or(0),
            options.get("limit").and_then(Value::as_u64),
        );
        Ok(Self {
            source: Box::new(source),
            options,
            window,
        })
    }

    pub fn options(&self) -> &ResultOptions {
        &self.options
    }

    pub fn lookup(&self, at: impl Into<Lookup>) -> ApiResult<Vec<ViewRow>> {
        match at.into() {
            Lookup::Index(index) => self.get(index),
            Lookup::Slice(start, stop) => self.slice_ends(start, stop),
            Lookup::Key(key) => self.get_key(ResultByKey(key)),
            Lookup::KeySlice(start, stop) => self.key_slice(start, stop),
        }
    }

    /// Row at ordinal `index` within the baseline window; empty past its end.
    pub fn get(&self, index: i64) -> ApiResult<Vec<ViewRow>> {
        self.reject(KEY_OPTIONS, "index access")?;
        let plan = self.window.index(index)?;
        self.run(plan)
    }

    pub fn slice(&self, range: impl RangeBounds<i64>) -> ApiResult<Vec<ViewRow>> {
        let (start, stop) = range_ends(&range);
        self.slice_ends(start, stop)
    }

    /// Every row matching the baseline in one request; the baseline may not carry a window.
    pub fn all(&self) -> ApiResult<Vec<ViewRow>> {
        self.slice_ends(None, None)
    }

    fn slice_ends(&self, start: Option<i64>, stop: Option<i64>) -> ApiResult<Vec<ViewRow>> {
        if start.is_none() && stop.is_none() {
            self.reject(WINDOW_OPTIONS, "full-range slicing")?;
            return self.fetch(ResultOptions::default());
        }
        self.reject(KEY_OPTIONS, "index slicing")?;
        let plan = self.window.slice(start, stop)?;
        self.run(plan)
    }

    pub fn get_key(&self, key: impl Into<ResultByKey>) -> ApiResult<Vec<ViewRow>> {
        self.reject_key_access()?;
        let mut overrides = ResultOptions::default();
        overrides.insert("key", key.into().0);
        self.fetch(overrides)
    }

    /// Rows from `start` to `stop` by key; both bounds must share a JSON type.
    pub fn key_slice(&self, start: Option<Value>, stop: Option<Value>) -> ApiResult<Vec<ViewRow>> {
        self.reject_key_access()?;
        if let (Some(start), Some(stop)) = (&start, &stop) {
            if std::mem::discriminant(start) != std::mem::discriminant(stop) {
                return Err(Error::new(ErrorKind::Argument)
                    .with_message("key slice bounds must be of the same type")
                    .with_hint(format!("Got {start} and {stop}.")));
            }
        }
        let mut overrides = ResultOptions::default();
        if let Some(start) = start {
            overrides.insert("startkey", start);
        }
        if let Some(stop) = stop {
            overrides.insert("endkey", stop);
        }
        self.fetch(overrides)
    }

    /// Pages through the view with key continuation.
    pub fn iter(&self) -> ApiResult<ViewRows<'_>> {
        self.reject(ITERATION_EXCLUSIVE, "iteration")?;
        Ok(ViewRows {
            result: self,
            page_size: self.options.page_size_or_default(),
            page: Vec::new().into_iter(),
            last: None,
            done: false,
        })
    }

    fn reject(&self, names: &[&str], what: &str) -> ApiResult<()> {
        match self.options.first_present(names) {
            Some(name) => Err(Error::new(ErrorKind::Argument)
                .with_message(format!("{what} is not allowed when {name} is set"))
                .with_option(name)),
            None => Ok(()),
        }
    }

    fn reject_key_access(&self) -> ApiResult<()> {
        self.reject(&[KEY_OPTIONS, WINDOW_OPTIONS].concat(), "key access")
    }

    fn run(&self, plan: Plan) -> ApiResult<Vec<ViewRow>> {
        match plan {
            Plan::Empty => Ok(Vec::new()),
            Plan::Fetch { skip, limit } => {
                let mut overrides = ResultOptions::default();
                if skip > 0 {
                    overrides.insert("skip", Value::from(skip));
                }
                if let Some(limit) = limit {
                    overrides.insert("limit", Value::from(limit));
                }
                self.fetch(overrides)
            }
        }
    }

    fn fetch(&self, overrides: ResultOptions) -> ApiResult<Vec<ViewRow>> {
        let mut options = self.options.clone();
        options.values.extend(overrides.values);
        self.request(&options)
    }

    fn request(&self, options: &ResultOptions) -> ApiResult<Vec<ViewRow>> {
        parse_rows(self.source.rows(options)?)
    }
}

/// Lazy row iterator returned by `ViewResult::iter`.
pub struct ViewRows<'a> {
    result: &'a ViewResult,
    page_size: u64,
    page: std::vec::IntoIter<ViewRow>,
    last: Option<(Value, Option<String>)>,
    done: bool,
}

impl ViewRows<'_> {
    fn fetch_page(&mut self) -> ApiResult<()> {
        let mut options = self.result.options.clone();
        options.insert("limit", Value::from(self.page_size));
        if let Some((key, id)) = self.last.take() {
            options.insert("startkey", key);
            match id {
                Some(id) => options.insert("startkey_docid", Value::from(id)),
                // Reduce rows have no id; a baseline docid belongs to a different key.
                None => {
                    options.values.remove("startkey_docid");
                }
            }
            options.insert("skip", Value::from(1));
        }
        let rows = self.result.request(&options)?;
        if (rows.len() as u64) < self.page_size {
            self.done = true;
        }
        self.last = rows
            .last()
            .map(|row| (row.key.clone(), row.id.clone()));
        self.page = rows.into_iter();
        Ok(())
    }
}

impl Iterator for ViewRows<'_> {
    type Item = ApiResult<ViewRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.page.next() {
                return Some(Ok(row));
            }
            if self.done {
                return None;
            }
            if let Err(err) = self.fetch_page() {
                self.done = true;
                return Some(Err(err));
            }
        }
    }
}

impl From<Value> for ResultByKey {
    fn from(key: Value) -> Self {
        Self(key)
    }
}

impl From<&str> for ResultByKey {
    fn from(key: &str) -> Self {
        Self(Value::from(key))
    }
}

fn parse_rows(body: Value) -> ApiResult<Vec<ViewRow>> {
    let Value::Object(mut body) = body else {
        return Err(Error::new(ErrorKind::Transport).with_message("view response is not an object"));
    };
    let Some(Value::Array(rows)) = body.remove("rows") else {
        return Err(Error::new(ErrorKind::Transport).with_message("view response has no rows"));
    };
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row).map_err(|err| {
                Error::new(ErrorKind::Transport)
                    .with_message("invalid view row")
                    .with_source(err)
            })
        })
        .collect()
}
