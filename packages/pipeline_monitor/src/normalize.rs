//! Folding of legacy key spellings at the ingestion boundary.
//!
//! The backend delivers some fields under two spellings (`progressPercent`
//! and `ProgressPercent`, `durationMs` and `DurationMs`), and progress under
//! the short names `progress` or `percent`. Everything past this module sees
//! one canonical camelCase shape.

use serde_json::{Map, Value};

/// Counter merge for a field that arrived under two spellings: prefer the
/// non-zero value; if both are non-zero take the larger. Never regresses a
/// counter to zero or to a smaller value.
pub fn merge_counter(current: Option<f64>, incoming: Option<f64>) -> Option<f64> {
    let nonzero = |v: &f64| *v != 0.0 && !v.is_nan();
    match (current.filter(nonzero), incoming.filter(nonzero)) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => current.or(incoming),
    }
}

/// Rewrite PascalCase keys of one object level to camelCase, reconciling
/// collisions with an existing camelCase key. Nested objects are left alone;
/// callers pick which levels are field names rather than data keys.
pub fn canonicalize_fields(map: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(map.len());
    let mut legacy = Vec::new();

    for (key, value) in map {
        match camel_case_twin(&key) {
            Some(canonical) => legacy.push((canonical, value)),
            None => {
                out.insert(key, value);
            }
        }
    }

    for (key, value) in legacy {
        let merged = match out.remove(&key) {
            Some(current) => reconcile_spellings(current, value),
            None => value,
        };
        out.insert(key, merged);
    }
    out
}

/// `ProgressPercent` -> `progressPercent`. Keys that are not PascalCase
/// (already camelCase, or all-caps like `SQL`) have no twin.
fn camel_case_twin(key: &str) -> Option<String> {
    let mut chars = key.chars();
    let first = chars.next()?;
    let second = chars.next()?;
    if !first.is_ascii_uppercase() || !second.is_lowercase() {
        return None;
    }
    let mut twin = String::with_capacity(key.len());
    twin.push(first.to_ascii_lowercase());
    twin.push_str(&key[first.len_utf8()..]);
    Some(twin)
}

fn reconcile_spellings(current: Value, legacy: Value) -> Value {
    match (current.as_f64(), legacy.as_f64()) {
        (Some(a), Some(b)) => {
            // Keep the original Number so integers stay integers.
            if merge_counter(Some(a), Some(b)) == Some(a) {
                current
            } else {
                legacy
            }
        }
        _ if current.is_null() => legacy,
        _ => current,
    }
}

/// Short names some backends use for `progressPercent` on `StepProgress`.
const PERCENT_ALIASES: &[&str] = &["progress", "percent"];

/// Canonicalize a raw push message: the event object itself, its `details`
/// and `result` payloads, and a lowercase-first `type` tag. Percent aliases
/// are folded into `progressPercent`, and a frame keyed only by `sessionId`
/// gets it as its `testId`.
pub fn canonicalize_event(value: Value) -> Value {
    let Value::Object(map) = value else {
        return value;
    };
    let mut map = canonicalize_fields(map);

    for payload in ["details", "result"] {
        if let Some(Value::Object(inner)) = map.remove(payload) {
            map.insert(payload.to_string(), Value::Object(canonicalize_fields(inner)));
        }
    }

    if let Some(Value::String(kind)) = map.get_mut("type") {
        let mut chars = kind.chars();
        if let Some(first) = chars.next() {
            if first.is_ascii_lowercase() {
                *kind = format!("{}{}", first.to_ascii_uppercase(), chars.as_str());
            }
        }
    }

    if map.get("type").and_then(Value::as_str) == Some("StepProgress") {
        for alias in PERCENT_ALIASES {
            if let Some(value) = map.remove(*alias) {
                let merged = match map.remove("progressPercent") {
                    Some(current) => reconcile_spellings(current, value),
                    None => value,
                };
                map.insert("progressPercent".to_string(), merged);
            }
        }
    }

    if !map.contains_key("testId") {
        if let Some(session_id) = map.get("sessionId").filter(|v| v.is_string()).cloned() {
            map.insert("testId".to_string(), session_id);
        }
    }
    Value::Object(map)
}
