// Static option schemas for every endpoint family plus query-parameter translation.
// Validation is a single explicit pass; translation never re-validates bounds.
// JSON null means "unset": it passes validation and is never sent.
use crate::core::error::{Error, ErrorKind};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueKind {
    Bool,
    Int,
    Str,
    List,
    Object,
    /// A view key: number, string, array or object.
    Key,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Bound {
    Unbounded,
    NonNegative,
    Positive,
}

#[derive(Clone, Copy, Debug)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kinds: &'static [ValueKind],
    pub allowed: Option<&'static [&'static str]>,
    pub bound: Bound,
}

const fn spec(name: &'static str, kinds: &'static [ValueKind]) -> OptionSpec {
    OptionSpec {
        name,
        kinds,
        allowed: None,
        bound: Bound::Unbounded,
    }
}

const fn bounded(name: &'static str, kinds: &'static [ValueKind], bound: Bound) -> OptionSpec {
    OptionSpec {
        name,
        kinds,
        allowed: None,
        bound,
    }
}

const fn one_of(name: &'static str, allowed: &'static [&'static str]) -> OptionSpec {
    OptionSpec {
        name,
        kinds: &[ValueKind::Str],
        allowed: Some(allowed),
        bound: Bound::Unbounded,
    }
}

use ValueKind::{Bool, Int, Key, List, Object, Str};

pub const FEED_MODES: &[&str] = &["continuous", "normal", "longpoll"];
pub const COUCH_DB_UPDATES_FEED_MODES: &[&str] = &["continuous", "longpoll"];
pub const STYLES: &[&str] = &["main_only", "all_docs"];

/// `_db_updates` on a CouchDB server.
pub const COUCH_DB_UPDATES_OPTIONS: &[OptionSpec] = &[
    one_of("feed", COUCH_DB_UPDATES_FEED_MODES),
    spec("heartbeat", &[Bool]),
    bounded("timeout", &[Int], Bound::Positive),
];

/// `_db_updates` on a Cloudant server.
pub const DB_UPDATES_OPTIONS: &[OptionSpec] = &[
    spec("descending", &[Bool]),
    one_of("feed", FEED_MODES),
    bounded("heartbeat", &[Int, Bool], Bound::Positive),
    bounded("limit", &[Int], Bound::Positive),
    bounded("since", &[Int, Str], Bound::NonNegative),
    bounded("timeout", &[Int], Bound::Positive),
];

/// `<db>/_changes`.
pub const CHANGES_OPTIONS: &[OptionSpec] = &[
    spec("conflicts", &[Bool]),
    spec("descending", &[Bool]),
    spec("doc_ids", &[List]),
    one_of("feed", FEED_MODES),
    spec("filter", &[Str]),
    bounded("heartbeat", &[Int, Bool], Bound::Positive),
    spec("include_docs", &[Bool]),
    bounded("limit", &[Int], Bound::Positive),
    bounded("seq_interval", &[Int], Bound::Positive),
    bounded("since", &[Int, Str], Bound::NonNegative),
    one_of("style", STYLES),
    bounded("timeout", &[Int], Bound::Positive),
    spec("view", &[Str]),
];

/// View and `_all_docs` requests.
pub const VIEW_OPTIONS: &[OptionSpec] = &[
    spec("descending", &[Bool]),
    spec("endkey", &[Key]),
    spec("endkey_docid", &[Str]),
    spec("group", &[Bool]),
    bounded("group_level", &[Int], Bound::NonNegative),
    spec("include_docs", &[Bool]),
    spec("inclusive_end", &[Bool]),
    spec("key", &[Key]),
    spec("keys", &[List]),
    bounded("limit", &[Int], Bound::NonNegative),
    spec("reduce", &[Bool]),
    bounded("skip", &[Int], Bound::NonNegative),
    spec("stable", &[Bool]),
    one_of("stale", &["ok", "update_after"]),
    spec("startkey", &[Key]),
    spec("startkey_docid", &[Str]),
    one_of("update", &["true", "false", "lazy"]),
];

/// `_find` request bodies.
pub const QUERY_OPTIONS: &[OptionSpec] = &[
    spec("bookmark", &[Str]),
    spec("conflicts", &[Bool]),
    spec("execution_stats", &[Bool]),
    spec("fields", &[List]),
    bounded("limit", &[Int], Bound::NonNegative),
    bounded("r", &[Int], Bound::Positive),
    spec("selector", &[Object]),
    bounded("skip", &[Int], Bound::NonNegative),
    spec("sort", &[List]),
    spec("use_index", &[Str, List]),
];

/// View parameters that are sent verbatim rather than JSON-encoded.
const VIEW_VERBATIM: &[&str] = &["endkey_docid", "startkey_docid", "stale", "update"];

pub fn lookup<'a>(schema: &'a [OptionSpec], name: &str) -> Option<&'a OptionSpec> {
    schema.iter().find(|spec| spec.name == name)
}

/// Full validation: name, type, allowed values and numeric bounds.
pub fn validate(schema: &[OptionSpec], name: &str, value: &Value) -> Result<(), Error> {
    let spec = check_type(schema, name, value)?;
    if value.is_null() {
        return Ok(());
    }
    if let (Some(allowed), Some(text)) = (spec.allowed, value.as_str()) {
        if !allowed.contains(&text) {
            return Err(Error::new(ErrorKind::Argument)
                .with_message(format!(
                    "invalid value ({text}) for {name} option; must be one of {}",
                    allowed.join(", ")
                ))
                .with_option(name));
        }
    }
    if let Some(number) = value.as_i64() {
        let ok = match spec.bound {
            Bound::Unbounded => true,
            Bound::NonNegative => number >= 0,
            Bound::Positive => number > 0,
        };
        if !ok {
            let rule = if spec.bound == Bound::Positive {
                "> 0"
            } else {
                ">= 0"
            };
            return Err(Error::new(ErrorKind::Argument)
                .with_message(format!("argument {name} must be {rule}; found {number}"))
                .with_option(name));
        }
    }
    if name == "keys" {
        if let Some(keys) = value.as_array() {
            if keys.iter().any(|key| !matches_kind(Key, key)) {
                return Err(Error::new(ErrorKind::Argument)
                    .with_message("key list element is not a valid key")
                    .with_option(name));
            }
        }
    }
    Ok(())
}

/// Name and type check only; derived window values may legitimately be out of bounds.
pub fn check_type<'a>(
    schema: &'a [OptionSpec],
    name: &str,
    value: &Value,
) -> Result<&'a OptionSpec, Error> {
    let Some(spec) = lookup(schema, name) else {
        return Err(Error::new(ErrorKind::Argument)
            .with_message(format!("invalid argument {name}"))
            .with_option(name));
    };
    if value.is_null() || spec.kinds.iter().any(|kind| matches_kind(*kind, value)) {
        return Ok(spec);
    }
    Err(Error::new(ErrorKind::Argument)
        .with_message(format!(
            "argument {name} not instance of expected type: {}",
            describe_kinds(spec.kinds)
        ))
        .with_option(name))
}

fn matches_kind(kind: ValueKind, value: &Value) -> bool {
    match kind {
        ValueKind::Bool => value.is_boolean(),
        ValueKind::Int => value.is_i64() || value.is_u64(),
        ValueKind::Str => value.is_string(),
        ValueKind::List => value.is_array(),
        ValueKind::Object => value.is_object(),
        ValueKind::Key => {
            value.is_number() || value.is_string() || value.is_array() || value.is_object()
        }
    }
}

fn describe_kinds(kinds: &[ValueKind]) -> String {
    kinds
        .iter()
        .map(|kind| match kind {
            ValueKind::Bool => "bool",
            ValueKind::Int => "integer",
            ValueKind::Str => "string",
            ValueKind::List => "list",
            ValueKind::Object => "object",
            ValueKind::Key => "key",
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Feed parameters: strings verbatim, scalars rendered, containers as JSON.
pub fn feed_param(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        other => Some(other.to_string()),
    }
}

/// View parameters: keys are JSON-encoded so `"foo"` travels as `%22foo%22`.
pub fn view_param(name: &str, value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) if VIEW_VERBATIM.contains(&name) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CHANGES_OPTIONS, COUCH_DB_UPDATES_OPTIONS, QUERY_OPTIONS, VIEW_OPTIONS, check_type,
        feed_param, validate, view_param,
    };
    use crate::core::error::ErrorKind;
    use serde_json::{Value, json};

    #[test]
    fn unknown_option_is_rejected() {
        let err = validate(CHANGES_OPTIONS, "bogus", &json!(1)).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Argument);
        assert_eq!(err.option(), Some("bogus"));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let err = validate(CHANGES_OPTIONS, "limit", &json!("10")).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Argument);
        let err = validate(CHANGES_OPTIONS, "include_docs", &json!(1)).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Argument);
    }

    #[test]
    fn feed_mode_must_be_known() {
        validate(CHANGES_OPTIONS, "feed", &json!("continuous")).expect("continuous");
        validate(CHANGES_OPTIONS, "feed", &json!("normal")).expect("normal");
        let err = validate(CHANGES_OPTIONS, "feed", &json!("eventsource")).expect_err("err");
        assert!(err.message().unwrap_or_default().contains("one of"));
        let err = validate(COUCH_DB_UPDATES_OPTIONS, "feed", &json!("normal")).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Argument);
    }

    #[test]
    fn style_must_be_known() {
        validate(CHANGES_OPTIONS, "style", &json!("all_docs")).expect("all_docs");
        let err = validate(CHANGES_OPTIONS, "style", &json!("everything")).expect_err("err");
        assert_eq!(err.option(), Some("style"));
    }

    #[test]
    fn positive_options_reject_zero_and_negatives() {
        for name in ["limit", "timeout", "heartbeat"] {
            validate(CHANGES_OPTIONS, name, &json!(5)).expect("positive");
            assert!(validate(CHANGES_OPTIONS, name, &json!(0)).is_err(), "{name} zero");
            assert!(validate(CHANGES_OPTIONS, name, &json!(-1)).is_err(), "{name} negative");
        }
    }

    #[test]
    fn heartbeat_accepts_false_and_null() {
        validate(CHANGES_OPTIONS, "heartbeat", &json!(false)).expect("false");
        validate(CHANGES_OPTIONS, "heartbeat", &Value::Null).expect("null");
    }

    #[test]
    fn view_keys_must_be_key_values() {
        validate(VIEW_OPTIONS, "keys", &json!(["a", 1, ["b", 2]])).expect("keys");
        let err = validate(VIEW_OPTIONS, "keys", &json!(["a", true])).expect_err("err");
        assert_eq!(err.option(), Some("keys"));
    }

    #[test]
    fn view_stale_is_restricted() {
        validate(VIEW_OPTIONS, "stale", &json!("ok")).expect("ok");
        assert!(validate(VIEW_OPTIONS, "stale", &json!("later")).is_err());
    }

    #[test]
    fn check_type_ignores_bounds() {
        check_type(VIEW_OPTIONS, "limit", &json!(-5)).expect("negative limit type-checks");
        assert!(validate(VIEW_OPTIONS, "limit", &json!(-5)).is_err());
    }

    #[test]
    fn query_selector_must_be_object() {
        validate(QUERY_OPTIONS, "selector", &json!({"a": 1})).expect("object");
        assert!(validate(QUERY_OPTIONS, "selector", &json!("a")).is_err());
    }

    #[test]
    fn feed_params_render_scalars() {
        assert_eq!(feed_param(&json!("now")), Some("now".to_string()));
        assert_eq!(feed_param(&json!(true)), Some("true".to_string()));
        assert_eq!(feed_param(&json!(30000)), Some("30000".to_string()));
        assert_eq!(feed_param(&json!(["a", "b"])), Some("[\"a\",\"b\"]".to_string()));
        assert_eq!(feed_param(&Value::Null), None);
    }

    #[test]
    fn view_params_encode_keys_as_json() {
        assert_eq!(view_param("key", &json!("foo")), Some("\"foo\"".to_string()));
        assert_eq!(view_param("startkey", &json!(["a", 1])), Some("[\"a\",1]".to_string()));
        assert_eq!(view_param("startkey_docid", &json!("doc1")), Some("doc1".to_string()));
        assert_eq!(view_param("skip", &json!(10)), Some("10".to_string()));
        assert_eq!(view_param("descending", &json!(false)), Some("false".to_string()));
    }
}
