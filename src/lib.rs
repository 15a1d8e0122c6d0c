//! Purpose: Client library for CouchDB/Cloudant changes feeds and paged result windows.
//! Exports: `api` (feeds, results, sessions, errors) and `core` (schemas, framing, planning).
//! Role: Library backing the `couchfeed` CLI and its tests.
//! Invariants: All network I/O is blocking and happens on the consumer's thread.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
