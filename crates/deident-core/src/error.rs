//! Error types for deident.

use thiserror::Error;

use crate::identifier::{IdentifierType, ResearchId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Schema error: {0}")]
    Schema(String),

    /// A uniqueness constraint rejected a write. Another writer got there first.
    #[error("Uniqueness violation: {0}")]
    UniqueViolation(String),

    /// A slot was filled by a concurrent writer between lookup and update.
    #[error("Slot {identifier_type} of {research_id} was filled concurrently")]
    SlotRace {
        research_id: ResearchId,
        identifier_type: IdentifierType,
    },

    #[error("Witness set has no linking identifiers (table {table}, slot {slot})")]
    EmptyWitnessSet { table: String, slot: String },

    #[error("Witness set carries two {identifier_type} values: {first:?} and {second:?}")]
    WitnessConflict {
        identifier_type: IdentifierType,
        first: String,
        second: String,
    },

    #[error(
        "Slot conflict on {research_id}: {identifier_type} is {existing:?}, witnessed {witnessed:?}"
    )]
    SlotConflict {
        research_id: ResearchId,
        identifier_type: IdentifierType,
        existing: String,
        witnessed: String,
    },

    #[error("Bridging conflict between {} via {}", join_ids(.research_ids), .bridging)]
    BridgingConflict {
        research_ids: Vec<ResearchId>,
        bridging: String,
    },

    #[error("Store retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("No research id for {identifier_type} in {table}.{column}; identity pass incomplete")]
    MissingMapping {
        table: String,
        column: String,
        identifier_type: IdentifierType,
    },

    #[error("Verification failed: {0}")]
    Verification(String),

    /// Work stopped because another shard of the same run failed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Store races the resolver recovers from by retrying the lookup.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::UniqueViolation(_) | Error::SlotRace { .. })
    }
}

fn join_ids(ids: &[ResearchId]) -> String {
    ids.iter().map(ResearchId::as_str).collect::<Vec<_>>().join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
