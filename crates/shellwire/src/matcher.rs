//! Structural comparison of responses with expectation markers.
//!
//! An expectation is plain JSON. Wherever exact equality is too strict, a
//! marker object can take the place of a value:
//!
//! ```
//! use serde_json::json;
//! use shellwire::matcher::{deep_equal, ignore, match_regexp};
//!
//! let expected = json!({
//!     "request_id": ignore(),
//!     "request_state": {"type": "OK", "msg": match_regexp("^Full version")},
//! });
//! let actual = json!({
//!     "request_id": "f3a1",
//!     "request_state": {"type": "OK", "msg": "Full version 1.14"},
//! });
//! assert!(deep_equal(&expected, &actual));
//! ```

use log::warn;
use regex::Regex;
use serde_json::{Value, json};

/// Key that turns an object into a marker.
pub const MARKER_KEY: &str = "$match";

enum Marker<'a> {
    Ignore,
    Regex(&'a str),
    List { list: &'a [Value], full: bool },
}

/// Matches any value, including a missing one inside a list.
pub fn ignore() -> Value {
    json!({ MARKER_KEY: "ignore" })
}

/// Matches a string value that contains a match for `pattern`.
pub fn match_regexp(pattern: &str) -> Value {
    json!({ MARKER_KEY: "regex", "pattern": pattern })
}

/// Matches an array whose leading elements match `list`.
///
/// With `full` the lengths must also be equal.
pub fn match_list(list: Vec<Value>, full: bool) -> Value {
    json!({ MARKER_KEY: "list", "list": list, "full": full })
}

fn extract_marker(value: &Value) -> Option<Marker<'_>> {
    let object = value.as_object()?;
    match object.get(MARKER_KEY)?.as_str()? {
        "ignore" => Some(Marker::Ignore),
        "regex" => Some(Marker::Regex(object.get("pattern")?.as_str()?)),
        "list" => Some(Marker::List {
            list: object.get("list")?.as_array()?,
            full: object.get("full").and_then(Value::as_bool).unwrap_or(true),
        }),
        _ => None,
    }
}

/// Compares two values recursively. Key order is irrelevant.
///
/// Either side may contain markers, but not both at the same position.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (extract_marker(a), extract_marker(b)) {
        (Some(_), Some(_)) => false,
        (Some(marker), None) => matches_marker(&marker, b),
        (None, Some(marker)) => matches_marker(&marker, a),
        (None, None) => match (a, b) {
            (Value::Object(left), Value::Object(right)) => {
                left.len() == right.len()
                    && left
                        .iter()
                        .all(|(key, value)| right.get(key).is_some_and(|other| deep_equal(value, other)))
            }
            (Value::Array(left), Value::Array(right)) => {
                left.len() == right.len() && left.iter().zip(right).all(|(l, r)| deep_equal(l, r))
            }
            (Value::Number(left), Value::Number(right)) => match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => l == r,
                _ => left == right,
            },
            _ => a == b,
        },
    }
}

fn matches_marker(marker: &Marker<'_>, value: &Value) -> bool {
    match marker {
        Marker::Ignore => true,
        Marker::Regex(pattern) => {
            let Some(text) = value.as_str() else {
                return false;
            };
            match Regex::new(pattern) {
                Ok(re) => re.is_match(text),
                Err(err) => {
                    warn!("invalid match pattern {pattern:?}: {err}");
                    false
                }
            }
        }
        Marker::List { list, full } => {
            let Some(items) = value.as_array() else {
                return false;
            };
            if *full && items.len() != list.len() {
                return false;
            }
            list.iter().enumerate().all(|(i, expected)| match items.get(i) {
                Some(actual) => deep_equal(actual, expected),
                None => extract_marker(expected).is_some_and(|m| matches!(m, Marker::Ignore)),
            })
        }
    }
}
