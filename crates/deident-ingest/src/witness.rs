//! Witnesses: one identifier value observed in one cell.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use deident_core::{Error, IdentifierType, Result};

/// A classified identifier value and where it was seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityWitness {
    pub source_table: String,
    pub source_column: String,
    pub slot: String,
    pub identifier_type: IdentifierType,
    /// Canonical form after validation.
    pub raw_value: String,
}

/// Witnesses of one record that describe the same individual.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessSet {
    pub table: String,
    pub slot: String,
    pub witnesses: Vec<IdentityWitness>,
}

impl WitnessSet {
    /// The distinct linking `(type, value)` pairs, ordered by type.
    ///
    /// Confidential witnesses are left out. Fails if no linking pair remains
    /// or if one type carries two different values.
    pub fn linking_pairs(&self) -> Result<Vec<(IdentifierType, String)>> {
        let mut pairs: BTreeMap<IdentifierType, &str> = BTreeMap::new();
        for w in self.witnesses.iter().filter(|w| w.identifier_type.is_linking()) {
            match pairs.get(&w.identifier_type) {
                Some(seen) if *seen != w.raw_value => {
                    return Err(Error::WitnessConflict {
                        identifier_type: w.identifier_type,
                        first: seen.to_string(),
                        second: w.raw_value.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    pairs.insert(w.identifier_type, &w.raw_value);
                }
            }
        }

        if pairs.is_empty() {
            return Err(Error::EmptyWitnessSet {
                table: self.table.clone(),
                slot: self.slot.clone(),
            });
        }
        Ok(pairs
            .into_iter()
            .map(|(t, v)| (t, v.to_string()))
            .collect())
    }

    /// True if at least one witness links to the identity map.
    pub fn has_linking(&self) -> bool {
        self.witnesses.iter().any(|w| w.identifier_type.is_linking())
    }
}
