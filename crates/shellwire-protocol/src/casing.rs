//! Key casing between the wire (snake_case) and the application (camelCase).
//!
//! Conversion walks objects and arrays recursively. Keys listed as exceptions
//! are copied verbatim together with their whole value, which is how row data
//! keyed by real column names survives the round trip.

use serde_json::{Map, Value};

/// Target casing for [`convert_keys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCase {
    /// `someField` → `some_field` (outbound).
    Snake,
    /// `some_field` → `someField` (inbound).
    Camel,
}

/// Inserts `_` at every lower→upper boundary and lowercases the upper char.
///
/// Runs of capitals are left alone (`dbURL` → `db_uRL`), matching the
/// backend's own conversion.
pub fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for ch in key.chars() {
        if prev_lower && ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
            continue;
        }
        prev_lower = ch.is_ascii_lowercase();
        out.push(ch);
    }
    out
}

/// Drops every `_` that precedes an ASCII alphanumeric and uppercases that char.
pub fn snake_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut chars = key.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '_' {
            if let Some(next) = chars.peek().copied().filter(char::is_ascii_alphanumeric) {
                out.push(next.to_ascii_uppercase());
                chars.next();
                continue;
            }
        }
        out.push(ch);
    }
    out
}

/// Recursively converts all object keys in `value` to `case`.
pub fn convert_keys<S: AsRef<str>>(value: &Value, case: KeyCase, exceptions: &[S]) -> Value {
    match value {
        Value::Object(map) => Value::Object(convert_map(map, case, exceptions)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| convert_keys(item, case, exceptions))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn convert_map<S: AsRef<str>>(map: &Map<String, Value>, case: KeyCase, exceptions: &[S]) -> Map<String, Value> {
    let mut out = Map::with_capacity(map.len());
    for (key, value) in map {
        if exceptions.iter().any(|e| e.as_ref() == key) {
            out.insert(key.clone(), value.clone());
            continue;
        }
        let converted = match case {
            KeyCase::Snake => camel_to_snake(key),
            KeyCase::Camel => snake_to_camel(key),
        };
        out.insert(converted, convert_keys(value, case, exceptions));
    }
    out
}
