//! Purpose: ViewResult and QueryResult windowing against the in-memory fixture.
//! Exports: None (integration test module).
//! Role: Check paging, slicing and option precedence through real `View`/`Query` sources.
//! Invariants: No network; request parameters are asserted from captured requests.

mod common;

use common::{DB_URL, FixtureSession, doc_id};
use couchfeed::api::{
    ErrorKind, Query, QueryOptions, QueryResult, ResultByKey, ResultOptions, View, ViewResult,
};
use serde_json::json;

fn all_docs(session: &std::sync::Arc<FixtureSession>, options: ResultOptions) -> ViewResult {
    let view = View::all_docs(session.clone(), DB_URL).expect("view");
    ViewResult::new(view, options).expect("result")
}

fn everything() -> QueryOptions {
    QueryOptions::new().selector(json!({"_id": {"$gt": null}}))
}

#[test]
fn iteration_pages_through_every_row() {
    let session = FixtureSession::with_docs(25).shared();
    let result = all_docs(&session, ResultOptions::new().page_size(10));
    let ids: Vec<String> = result
        .iter()
        .expect("iter")
        .map(|row| row.expect("row").id().unwrap_or_default().to_string())
        .collect();
    assert_eq!(ids, (0..25).map(doc_id).collect::<Vec<_>>());

    let requests = session.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|request| request.path == "/animals/_all_docs"));
    assert!(requests.iter().all(|request| request.param("limit") == Some("10")));
    assert_eq!(requests[0].param("startkey"), None);
    assert_eq!(requests[1].param("startkey"), Some("\"doc009\""));
    assert_eq!(requests[1].param("startkey_docid"), Some("doc009"));
    assert_eq!(requests[1].param("skip"), Some("1"));
    assert_eq!(requests[2].param("startkey"), Some("\"doc019\""));
}

#[test]
fn exact_multiple_of_page_size_ends_on_an_empty_page() {
    let session = FixtureSession::with_docs(20).shared();
    let result = all_docs(&session, ResultOptions::new().page_size(10));
    let count = result.iter().expect("iter").count();
    assert_eq!(count, 20);
    assert_eq!(session.request_count(), 3);
}

#[test]
fn equal_bounds_are_empty_without_a_request() {
    let session = FixtureSession::with_docs(25).shared();
    let result = all_docs(&session, ResultOptions::new());
    assert!(result.slice(5..5).expect("rows").is_empty());
    assert_eq!(session.request_count(), 0);
}

#[test]
fn negative_index_is_an_argument_error() {
    let session = FixtureSession::with_docs(25).shared();
    let result = all_docs(&session, ResultOptions::new());
    assert_eq!(result.get(-1).expect_err("err").kind(), ErrorKind::Argument);
    assert_eq!(result.slice(-3..2).expect_err("err").kind(), ErrorKind::Argument);
    assert_eq!(session.request_count(), 0);
}

#[test]
fn iterating_with_skip_is_an_argument_error() {
    let session = FixtureSession::with_docs(25).shared();
    let result = all_docs(&session, ResultOptions::new().skip(10));
    let err = result.iter().err().expect("iteration rejected");
    assert_eq!(err.kind(), ErrorKind::Argument);
    assert_eq!(err.option(), Some("skip"));
    assert_eq!(session.request_count(), 0);
}

#[test]
fn index_and_slice_respect_the_baseline_window() {
    let session = FixtureSession::with_docs(25).shared();
    let result = all_docs(&session, ResultOptions::new().skip(10).limit(5));
    let row = result.get(2).expect("rows");
    assert_eq!(row[0].id(), Some("doc012"));
    assert!(result.get(5).expect("past window").is_empty());
    let rows = result.slice(3..9).expect("rows");
    let ids: Vec<&str> = rows.iter().filter_map(|row| row.id()).collect();
    assert_eq!(ids, vec!["doc013", "doc014"]);
    assert_eq!(session.request_count(), 2);
}

#[test]
fn key_lookup_uses_key_parameter() {
    let session = FixtureSession::with_docs(25).shared();
    let result = all_docs(&session, ResultOptions::new());
    let rows = result.get_key(ResultByKey::new("doc005")).expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key(), &json!("doc005"));
    assert_eq!(session.requests()[0].param("key"), Some("\"doc005\""));
}

#[test]
fn key_access_with_baseline_limit_is_an_argument_error() {
    let session = FixtureSession::with_docs(25).shared();
    let result = all_docs(&session, ResultOptions::new().limit(5));
    let err = result.get_key("doc005").expect_err("err");
    assert_eq!(err.kind(), ErrorKind::Argument);
    assert_eq!(session.request_count(), 0);
}

#[test]
fn keys_travel_in_a_post_body() {
    let session = FixtureSession::with_docs(25).shared();
    let result = all_docs(&session, ResultOptions::new().keys(["doc001", "doc004"]));
    let rows = result.all().expect("rows");
    let ids: Vec<&str> = rows.iter().filter_map(|row| row.id()).collect();
    assert_eq!(ids, vec!["doc001", "doc004"]);
    let request = &session.requests()[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.body, Some(json!({"keys": ["doc001", "doc004"]})));
    assert_eq!(request.param("keys"), None);
    assert_eq!(session.request_count(), 1);
}

#[test]
fn keys_baseline_rejects_ordinal_access_and_iteration() {
    let session = FixtureSession::with_docs(25).shared();
    let result = all_docs(&session, ResultOptions::new().keys(["doc001", "doc004"]));
    for err in [
        result.get(1).expect_err("index"),
        result.slice(0..10).expect_err("index slice"),
        result.iter().err().expect("iteration"),
        result.get_key("doc001").expect_err("key"),
    ] {
        assert_eq!(err.kind(), ErrorKind::Argument);
        assert_eq!(err.option(), Some("keys"));
    }
    assert_eq!(session.request_count(), 0);
}

#[test]
fn full_range_with_window_baseline_is_an_argument_error() {
    let session = FixtureSession::with_docs(25).shared();
    let result = all_docs(&session, ResultOptions::new().skip(1).limit(2));
    assert_eq!(result.all().expect_err("all").kind(), ErrorKind::Argument);
    assert_eq!(result.slice(..).expect_err("full slice").option(), Some("skip"));
    assert_eq!(session.request_count(), 0);
}

#[test]
fn startkey_baseline_rejects_index_access() {
    let session = FixtureSession::with_docs(25).shared();
    let result = all_docs(&session, ResultOptions::new().startkey("doc010"));
    let err = result.get(0).expect_err("index");
    assert_eq!(err.option(), Some("startkey"));
    assert_eq!(session.request_count(), 0);
    let rows = result.iter().expect("iter").count();
    assert_eq!(rows, 15);
}

#[test]
fn inverted_slice_is_server_dependent() {
    let strict = FixtureSession::with_docs(25).strict_limits().shared();
    let err = all_docs(&strict, ResultOptions::new())
        .slice(10..5)
        .expect_err("strict server rejects negative limit");
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(err.status(), Some(400));
    assert_eq!(strict.requests()[0].param("limit"), Some("-5"));

    let lenient = FixtureSession::with_docs(25).shared();
    let rows = all_docs(&lenient, ResultOptions::new())
        .slice(10..5)
        .expect("lenient server answers");
    assert!(rows.is_empty());
}

#[test]
fn query_result_window_beats_query_window() {
    let session = FixtureSession::with_docs(300).shared();
    let query = Query::new(session.clone(), DB_URL, everything().skip(10).limit(10)).expect("query");
    let result = QueryResult::new(query, QueryOptions::new().skip(100).limit(100)).expect("result");
    let docs = result.all().expect("docs");
    assert_eq!(docs.len(), 100);
    assert_eq!(docs[0].id(), Some("doc100"));
    let first = result.get(0).expect("docs");
    assert_eq!(first[0].id(), Some("doc100"));

    for request in session.requests() {
        let body = request.body.expect("find body");
        assert_ne!(body["skip"], json!(10));
        assert_ne!(body["limit"], json!(10));
    }
}

#[test]
fn query_iteration_steps_by_page_size() {
    let session = FixtureSession::with_docs(25).shared();
    let query = Query::new(session.clone(), DB_URL, everything()).expect("query");
    let result = QueryResult::new(query, QueryOptions::new().page_size(10)).expect("result");
    let ids: Vec<String> = result
        .iter()
        .expect("iter")
        .map(|doc| doc.expect("doc").id().unwrap_or_default().to_string())
        .collect();
    assert_eq!(ids, (0..25).map(doc_id).collect::<Vec<_>>());
    let skips: Vec<u64> = session
        .requests()
        .iter()
        .filter_map(|request| request.body.as_ref().and_then(|body| body["skip"].as_u64()))
        .collect();
    assert_eq!(skips, vec![0, 10, 20]);
}

#[test]
fn query_inverted_slice_is_server_dependent() {
    let strict = FixtureSession::with_docs(25).strict_limits().shared();
    let query = Query::new(strict.clone(), DB_URL, everything()).expect("query");
    let err = QueryResult::new(query, QueryOptions::new())
        .expect("result")
        .slice(10..5)
        .expect_err("strict");
    assert_eq!(err.status(), Some(400));

    let lenient = FixtureSession::with_docs(25).shared();
    let query = Query::new(lenient, DB_URL, everything()).expect("query");
    let docs = QueryResult::new(query, QueryOptions::new())
        .expect("result")
        .slice(10..5)
        .expect("lenient");
    assert!(docs.is_empty());
}
