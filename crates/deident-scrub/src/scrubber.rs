//! Record scrubbing: identifiers out, research ids in.
//!
//! Runs only after the identity pass has finished, so every linking value it
//! sees must already be in the store. The scrubber never writes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use deident_core::{Error, IdentitySchema, Record, Result};
use deident_ingest::classify_cell;
use deident_store::IdentityStore;

/// Per-record (or aggregated) scrub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubStats {
    /// Identifier values replaced by a research id.
    pub substituted: usize,
    /// Confidential values removed outright.
    pub removed: usize,
    /// Research id columns left null (absent, blank or confidential input).
    pub nulled: usize,
}

impl ScrubStats {
    pub fn merge(&mut self, other: &ScrubStats) {
        self.substituted += other.substituted;
        self.removed += other.removed;
        self.nulled += other.nulled;
    }
}

pub struct Scrubber<'a> {
    schema: &'a IdentitySchema,
    store: &'a dyn IdentityStore,
}

impl<'a> Scrubber<'a> {
    pub fn new(schema: &'a IdentitySchema, store: &'a dyn IdentityStore) -> Self {
        Self { schema, store }
    }

    /// Scrub one record of `table`. Undeclared tables and columns pass through.
    pub fn scrub(&self, table: &str, mut record: Record) -> Result<(Record, ScrubStats)> {
        let mut stats = ScrubStats::default();
        let Some(identity) = self.schema.table(table) else {
            return Ok((record, stats));
        };

        for rule in identity.rules() {
            let value = record.remove(&rule.column).unwrap_or(Value::Null);
            let classified = classify_cell(rule, &value);

            let Some(output_column) = rule.output_column() else {
                if classified.is_some() {
                    stats.removed += 1;
                }
                continue;
            };

            let substitute = match classified {
                Some((t, canonical)) if t.is_linking() => {
                    let id = self.store.lookup(t, &canonical)?.ok_or_else(|| {
                        let err = Error::MissingMapping {
                            table: table.to_string(),
                            column: rule.column.clone(),
                            identifier_type: t,
                        };
                        error!("{}", err);
                        err
                    })?;
                    stats.substituted += 1;
                    Value::String(id.to_string())
                }
                Some(_) => {
                    stats.removed += 1;
                    stats.nulled += 1;
                    Value::Null
                }
                None => {
                    stats.nulled += 1;
                    Value::Null
                }
            };
            record.insert(output_column, substitute);
        }

        Ok((record, stats))
    }
}
