//! Purpose: Define the public Rust API boundary for couchfeed.
//! Exports: Feeds, result windows, sessions and the shared error type.
//! Role: Public, additive-only surface; hides option schemas and window arithmetic.
//! Invariants: Every remote call goes through a `Session`.
//! Invariants: Option validation happens before any request is issued.

mod feed;
mod infinite;
mod query;
mod resource;
mod result;
mod session;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use feed::{ChangeEvent, Feed, FeedMode, FeedOptions, FeedRow, Seq, StopHandle, Style};
pub use infinite::InfiniteFeed;
pub use query::{Document, FindSource, Query, QueryOptions, QueryResult, QueryRows};
pub use resource::{Resource, ResourceKind};
pub use result::{
    DEFAULT_PAGE_SIZE, Lookup, ResultByKey, ResultOptions, RowSource, View, ViewResult, ViewRow,
    ViewRows,
};
pub use session::{
    ApiResult, Params, Response, Session, SessionConfig, UreqSession, build_url,
    normalize_base_url,
};
