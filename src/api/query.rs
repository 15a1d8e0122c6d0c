//! Purpose: Random access and paging over `_find` selector queries.
//! Exports: `Query`, `QueryOptions`, `QueryResult`, `FindSource`, `Document`, `QueryRows`.
//! Role: Same addressing contract as `ViewResult`, minus key access.
//! Invariants: Result-level `skip`/`limit` win over the query's own values.
//! Invariants: A request without a non-empty selector fails before any I/O.
#![allow(clippy::result_large_err)]

use super::result::DEFAULT_PAGE_SIZE;
use super::session::{ApiResult, Session, build_url, normalize_base_url};
use crate::core::error::{Error, ErrorKind};
use crate::core::options::{self, QUERY_OPTIONS};
use crate::core::window::{Plan, Window, offset, range_ends};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ops::RangeBounds;
use std::sync::Arc;
use url::Url;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOptions {
    values: BTreeMap<String, Value>,
    page_size: Option<u64>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn selector(self, selector: Value) -> Self {
        self.set("selector", selector)
    }

    pub fn fields<I, S>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<Value> = fields.into_iter().map(|f| Value::from(f.into())).collect();
        self.set("fields", fields)
    }

    pub fn sort(self, sort: Value) -> Self {
        self.set("sort", sort)
    }

    pub fn skip(self, skip: u64) -> Self {
        self.set("skip", skip)
    }

    pub fn limit(self, limit: u64) -> Self {
        self.set("limit", limit)
    }

    pub fn r(self, r: u64) -> Self {
        self.set("r", r)
    }

    pub fn bookmark(self, bookmark: impl Into<String>) -> Self {
        self.set("bookmark", bookmark.into())
    }

    pub fn use_index(self, index: impl Into<Value>) -> Self {
        self.set("use_index", index)
    }

    pub fn execution_stats(self, enabled: bool) -> Self {
        self.set("execution_stats", enabled)
    }

    pub fn conflicts(self, conflicts: bool) -> Self {
        self.set("conflicts", conflicts)
    }

    /// Documents per fetch while iterating; never sent to the server.
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

    /// `self` overlaid with `overrides`; the override wins on every name.
    pub fn merged(&self, overrides: &QueryOptions) -> QueryOptions {
        let mut merged = self.clone();
        for (name, value) in &overrides.values {
            merged.values.insert(name.clone(), value.clone());
        }
        merged.page_size = overrides.page_size.or(self.page_size);
        merged
    }

    /// The `_find` request body.
    pub fn body(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        )
    }

    fn insert(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    fn validate(&self) -> ApiResult<()> {
        for (name, value) in &self.values {
            options::validate(QUERY_OPTIONS, name, value)?;
        }
        if self.page_size == Some(0) {
            return Err(Error::new(ErrorKind::Argument)
                .with_message("argument page_size must be > 0; found 0")
                .with_option("page_size"));
        }
        Ok(())
    }
}

/// Performs one `_find` request with `overrides` applied; returns the `{docs: [...]}` body.
pub trait FindSource: Send + Sync {
    fn find(&self, overrides: &QueryOptions) -> ApiResult<Value>;

    /// Options the source carries on its own, consulted for inherited `skip`/`limit`.
    fn query_options(&self) -> QueryOptions {
        QueryOptions::default()
    }
}

impl<F> FindSource for F
where
    F: Fn(&QueryOptions) -> ApiResult<Value> + Send + Sync,
{
    fn find(&self, overrides: &QueryOptions) -> ApiResult<Value> {
        self(overrides)
    }
}

/// A selector query against one database's `_find` endpoint.
pub struct Query {
    session: Arc<dyn Session>,
    url: Url,
    options: QueryOptions,
}

impl Query {
    pub fn new(
        session: Arc<dyn Session>,
        database_url: &str,
        options: QueryOptions,
    ) -> ApiResult<Self> {
        options.validate()?;
        let base = normalize_base_url(database_url)?;
        Ok(Self {
            session,
            url: build_url(&base, &["_find"])?,
            options,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Runs the query as configured.
    pub fn run(&self) -> ApiResult<Vec<Document>> {
        parse_docs(self.find(&QueryOptions::default())?)
    }
}

impl FindSource for Query {
    fn find(&self, overrides: &QueryOptions) -> ApiResult<Value> {
        let merged = self.options.merged(overrides);
        for (name, value) in &merged.values {
            match name.as_str() {
                // Window arithmetic may forward an inverted slice as a negative limit.
                "skip" | "limit" => {
                    options::check_type(QUERY_OPTIONS, name, value)?;
                }
                _ => options::validate(QUERY_OPTIONS, name, value)?,
            }
        }
        let has_selector = merged
            .get("selector")
            .and_then(Value::as_object)
            .is_some_and(|selector| !selector.is_empty());
        if !has_selector {
            return Err(Error::new(ErrorKind::Argument)
                .with_message("_find query requires a non-empty selector")
                .with_hint("Pass a selector such as {\"_id\": {\"$gt\": null}}.")
                .with_option("selector"));
        }
        tracing::debug!(url = %self.url, "running find query");
        self.session
            .post(&self.url, &[], &merged.body())?
            .error_for_status()?
            .into_json()
    }

    fn query_options(&self) -> QueryOptions {
        self.options.clone()
    }
}

/// One `_find` document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    rev: Option<String>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Document {
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn rev(&self) -> Option<&str> {
        self.rev.as_deref()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub struct QueryResult {
    source: Box<dyn FindSource>,
    options: QueryOptions,
    window: Window,
}

impl QueryResult {
    pub fn new(source: impl FindSource + 'static, options: QueryOptions) -> ApiResult<Self> {
        let mut options = options;
        let inherited = source.query_options();
        for name in ["skip", "limit"] {
            if !options.contains(name) {
                if let Some(value) = inherited.get(name) {
                    options.insert(name, value.clone());
                }
            }
        }
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

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn get(&self, index: i64) -> ApiResult<Vec<Document>> {
        let plan = self.window.index(index)?;
        self.run(plan)
    }

    pub fn slice(&self, range: impl RangeBounds<i64>) -> ApiResult<Vec<Document>> {
        let (start, stop) = range_ends(&range);
        if start.is_none() && stop.is_none() {
            return self.all();
        }
        let plan = self.window.slice(start, stop)?;
        self.run(plan)
    }

    /// The whole baseline window; `skip`/`limit` are forwarded as-is.
    pub fn all(&self) -> ApiResult<Vec<Document>> {
        self.fetch(self.options.clone())
    }

    /// Pages through the query by plain skip increments.
    pub fn iter(&self) -> ApiResult<QueryRows<'_>> {
        if self.options.contains("limit") {
            return Err(Error::new(ErrorKind::Argument)
                .with_message("iteration is not allowed when limit is set")
                .with_option("limit"));
        }
        Ok(QueryRows {
            result: self,
            page_size: self.options.page_size_or_default(),
            pages: 0,
            page: Vec::new().into_iter(),
            done: false,
        })
    }

    fn run(&self, plan: Plan) -> ApiResult<Vec<Document>> {
        match plan {
            Plan::Empty => Ok(Vec::new()),
            Plan::Fetch { skip, limit } => {
                let mut overrides = self.options.clone();
                overrides.insert("skip", Value::from(skip));
                match limit {
                    Some(limit) => overrides.insert("limit", Value::from(limit)),
                    None => {
                        overrides.values.remove("limit");
                    }
                }
                self.fetch(overrides)
            }
        }
    }

    fn fetch(&self, overrides: QueryOptions) -> ApiResult<Vec<Document>> {
        parse_docs(self.source.find(&overrides)?)
    }
}

/// Lazy document iterator returned by `QueryResult::iter`.
pub struct QueryRows<'a> {
    result: &'a QueryResult,
    page_size: u64,
    pages: u64,
    page: std::vec::IntoIter<Document>,
    done: bool,
}

impl QueryRows<'_> {
    fn fetch_page(&mut self) -> ApiResult<()> {
        let consumed = self.pages.checked_mul(self.page_size).ok_or_else(|| {
            Error::new(ErrorKind::Argument)
                .with_message("query paging ran past the addressable range")
                .with_option("page_size")
        })?;
        let mut overrides = self.result.options.clone();
        overrides.insert("skip", Value::from(offset(self.result.window.skip, consumed)?));
        overrides.insert("limit", Value::from(self.page_size));
        let docs = self.result.fetch(overrides)?;
        self.pages += 1;
        if (docs.len() as u64) < self.page_size {
            self.done = true;
        }
        self.page = docs.into_iter();
        Ok(())
    }
}

impl Iterator for QueryRows<'_> {
    type Item = ApiResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(doc) = self.page.next() {
                return Some(Ok(doc));
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

fn parse_docs(body: Value) -> ApiResult<Vec<Document>> {
    let Value::Object(mut body) = body else {
        return Err(Error::new(ErrorKind::Transport).with_message("find response is not an object"));
    };
    let Some(Value::Array(docs)) = body.remove("docs") else {
        return Err(Error::new(ErrorKind::Transport).with_message("find response has no docs"));
    };
    docs.into_iter()
        .map(|doc| {
            serde_json::from_value(doc).map_err(|err| {
                Error::new(ErrorKind::Transport)
                    .with_message("invalid find document")
                    .with_source(err)
            })
        })
        .collect()
}
