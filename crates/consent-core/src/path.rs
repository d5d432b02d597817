//! Property-path resolution over a JSON scope snapshot.
//!
//! Identity descriptors name values like `window.analytics.user.id` or
//! `window.getVisitor().id`. The host hands the engine a JSON snapshot of
//! the relevant globals; this module walks it. Function calls cannot be
//! evaluated against a snapshot, so `name()` reads the property `name`.

use serde_json::Value;

/// Resolves a dotted path against `scope`.
///
/// A leading `window.` segment is optional. Array elements are addressed by
/// numeric segments (`items.0.id`). Returns `None` for missing segments and
/// for `null` leaves.
pub fn resolve_path<'a>(path: &str, scope: &'a Value) -> Option<&'a Value> {
    let path = path.trim();
    let path = path.strip_prefix("window.").unwrap_or(path);
    if path.is_empty() || path == "window" {
        return Some(scope);
    }

    let mut current = scope;
    for raw in path.split('.') {
        let segment = raw.strip_suffix("()").unwrap_or(raw);
        if segment.is_empty() {
            return None;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Resolves a path and renders scalars as identity strings.
///
/// Objects and arrays are not usable identity values.
pub fn resolve_string(path: &str, scope: &Value) -> Option<String> {
    match resolve_path(path, scope)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
