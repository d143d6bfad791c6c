//! Record → witness sets.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::witness::{IdentityWitness, WitnessSet};
use deident_core::{cell_text, ColumnRule, IdentifierType, IdentitySchema, Record};

/// Pulls identifier witnesses out of records according to a schema.
pub struct Extractor<'a> {
    schema: &'a IdentitySchema,
}

impl<'a> Extractor<'a> {
    pub fn new(schema: &'a IdentitySchema) -> Self {
        Self { schema }
    }

    /// One witness set per slot that has at least one non-blank value,
    /// ordered by slot name. Undeclared tables yield nothing.
    pub fn extract(&self, table: &str, record: &Record) -> Vec<WitnessSet> {
        let Some(identity) = self.schema.table(table) else {
            return Vec::new();
        };

        let mut by_slot: BTreeMap<&str, Vec<IdentityWitness>> = BTreeMap::new();
        for rule in identity.rules() {
            let Some(value) = record.get(&rule.column) else {
                continue;
            };
            if let Some((identifier_type, raw_value)) = classify_cell(rule, value) {
                by_slot
                    .entry(rule.slot.as_str())
                    .or_default()
                    .push(IdentityWitness {
                        source_table: table.to_string(),
                        source_column: rule.column.clone(),
                        slot: rule.slot.clone(),
                        identifier_type,
                        raw_value,
                    });
            }
        }

        let sets: Vec<WitnessSet> = by_slot
            .into_iter()
            .map(|(slot, witnesses)| WitnessSet {
                table: table.to_string(),
                slot: slot.to_string(),
                witnesses,
            })
            .collect();
        debug!("Extracted {} witness sets from {}", sets.len(), table);
        sets
    }
}

/// Classify one cell against its column rule. `None` for null or blank.
///
/// Arrays and objects never carry a linking identifier.
pub fn classify_cell(rule: &ColumnRule, value: &Value) -> Option<(IdentifierType, String)> {
    match value {
        Value::Array(_) | Value::Object(_) => {
            Some((IdentifierType::Other, value.to_string()))
        }
        _ => rule.classify(&cell_text(value)?),
    }
}
