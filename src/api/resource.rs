//! Purpose: Describe which changes-style endpoint a feed consumes.
//! Exports: `Resource`, `ResourceKind`.
//! Role: Supplies the endpoint url, option schema and per-kind defaults.
//! Invariants: CouchDB `_db_updates` never supports infinite consumption.
#![allow(clippy::result_large_err)]

use super::session::{ApiResult, build_url, normalize_base_url};
use crate::core::options::{
    CHANGES_OPTIONS, COUCH_DB_UPDATES_OPTIONS, DB_UPDATES_OPTIONS, OptionSpec,
};
use serde_json::{Value, json};
use url::Url;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    /// `<db>/_changes`.
    Database,
    /// `_db_updates` on a CouchDB server.
    CouchServer,
    /// `_db_updates` on a Cloudant server.
    CloudantServer,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Resource {
    kind: ResourceKind,
    url: Url,
}

impl Resource {
    /// Changes feed of the database at `database_url`.
    pub fn database(database_url: &str) -> ApiResult<Self> {
        let base = normalize_base_url(database_url)?;
        Ok(Self {
            kind: ResourceKind::Database,
            url: build_url(&base, &["_changes"])?,
        })
    }

    pub fn couch_server(server_url: &str) -> ApiResult<Self> {
        Self::db_updates(ResourceKind::CouchServer, server_url)
    }

    pub fn cloudant_server(server_url: &str) -> ApiResult<Self> {
        Self::db_updates(ResourceKind::CloudantServer, server_url)
    }

    fn db_updates(kind: ResourceKind, server_url: &str) -> ApiResult<Self> {
        let base = normalize_base_url(server_url)?;
        Ok(Self {
            kind,
            url: build_url(&base, &["_db_updates"])?,
        })
    }

    /// Uses `url` verbatim as the feed endpoint.
    pub fn from_url(kind: ResourceKind, url: Url) -> Self {
        Self { kind, url }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn supports_infinite(&self) -> bool {
        self.kind != ResourceKind::CouchServer
    }

    pub(crate) fn schema(&self) -> &'static [OptionSpec] {
        match self.kind {
            ResourceKind::Database => CHANGES_OPTIONS,
            ResourceKind::CouchServer => COUCH_DB_UPDATES_OPTIONS,
            ResourceKind::CloudantServer => DB_UPDATES_OPTIONS,
        }
    }

    /// Options this kind sends when the caller leaves them unset.
    pub(crate) fn defaults(&self) -> Vec<(&'static str, Value)> {
        match self.kind {
            ResourceKind::CouchServer => {
                vec![("feed", json!("longpoll")), ("heartbeat", json!(true))]
            }
            _ => Vec::new(),
        }
    }
}
