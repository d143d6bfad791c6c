//! Post-scrub leak check.

use std::collections::HashSet;

use serde_json::Value;

use deident_core::{cell_text, Error, IdentitySchema, Record, Result};
use deident_ingest::classify_cell;

/// Fail if a scrubbed record still exposes an identifier of its original.
///
/// Declared columns must be gone, and no value the scrubber introduced or
/// changed may equal a declared raw value (as written or in canonical form).
/// Undeclared columns carried over unchanged are not compared.
pub fn verify_scrubbed(
    schema: &IdentitySchema,
    table: &str,
    original: &Record,
    scrubbed: &Record,
) -> Result<()> {
    let Some(identity) = schema.table(table) else {
        return Ok(());
    };

    let mut raw_values: HashSet<String> = HashSet::new();
    for rule in identity.rules() {
        if scrubbed.contains_key(&rule.column) {
            return Err(Error::Verification(format!(
                "declared column {}.{} survived scrubbing",
                table, rule.column
            )));
        }
        let Some(value) = original.get(&rule.column) else {
            continue;
        };
        if let Some(text) = cell_text(value) {
            raw_values.insert(text.trim().to_string());
        }
        if let Some((_, canonical)) = classify_cell(rule, value) {
            raw_values.insert(canonical);
        }
    }

    for (column, value) in scrubbed {
        if identity.column(column).is_none() && original.get(column) == Some(value) {
            continue;
        }
        if let Some(text) = scalar_text(value) {
            if raw_values.contains(text.trim()) {
                return Err(Error::Verification(format!(
                    "column {}.{} carries a raw identifier",
                    table, column
                )));
            }
        }
    }
    Ok(())
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
        other => cell_text(other).map(|t| t.into_owned()),
    }
}
