//! Runtime types: shards and pass reports.

use serde::{Deserialize, Serialize};

use deident_core::Record;
use deident_scrub::ScrubStats;
use deident_store::StabilityReport;

/// A unit of parallel work: an ordered batch of `(table, record)` rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub id: usize,
    pub records: Vec<(String, Record)>,
}

impl Shard {
    pub fn new(id: usize, records: Vec<(String, Record)>) -> Self {
        Self { id, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Identity pass counters for one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityPassReport {
    pub shard_id: usize,
    pub records: usize,
    /// Witness sets sent to the resolver.
    pub witness_sets: usize,
    /// Witness sets with only confidential values; never resolved.
    pub confidential_only: usize,
    pub new_identities: usize,
    pub filled_slots: usize,
    pub retries: u32,
}

/// Scrub pass counters for one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrubPassReport {
    pub shard_id: usize,
    pub records: usize,
    pub stats: ScrubStats,
}

/// Summary of a full two-pass run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub schema_fingerprint: String,
    pub identities_before: i64,
    pub identities_after: i64,
    pub identity: Vec<IdentityPassReport>,
    pub scrub: Vec<ScrubPassReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stability: Option<StabilityReport>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn records(&self) -> usize {
        self.identity.iter().map(|r| r.records).sum()
    }

    pub fn new_identities(&self) -> usize {
        self.identity.iter().map(|r| r.new_identities).sum()
    }

    pub fn filled_slots(&self) -> usize {
        self.identity.iter().map(|r| r.filled_slots).sum()
    }

    pub fn retries(&self) -> u32 {
        self.identity.iter().map(|r| r.retries).sum()
    }

    pub fn scrub_totals(&self) -> ScrubStats {
        let mut total = ScrubStats::default();
        for r in &self.scrub {
            total.merge(&r.stats);
        }
        total
    }
}

/// Scrubbed shards in input order, plus the run report.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub shards: Vec<Shard>,
    pub report: RunReport,
}
