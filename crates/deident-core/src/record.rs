//! Records flowing through the pipeline.

use std::borrow::Cow;

use serde_json::Value;

/// One row: column name → value. Format-agnostic; the reader upstream
/// decides how files map onto it.
pub type Record = serde_json::Map<String, Value>;

/// Render a scalar cell as text. `None` for nulls.
///
/// Arrays and objects render as their JSON text; no identifier validator
/// accepts them, so they classify as confidential.
pub fn cell_text(value: &Value) -> Option<Cow<'_, str>> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(Cow::Borrowed(s.as_str())),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        Value::Bool(b) => Some(Cow::Owned(b.to_string())),
        other => Some(Cow::Owned(other.to_string())),
    }
}
