//! Canonical identities and the store port.

use std::collections::BTreeMap;

use deident_core::{IdentifierType, ResearchId, Result};
use serde::{Deserialize, Serialize};

/// All known identifier values of one individual, bound to one research id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalIdentity {
    pub research_id: ResearchId,
    /// Filled slots only; absent types are null.
    pub values: BTreeMap<IdentifierType, String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl CanonicalIdentity {
    /// A new identity created now.
    pub fn new(research_id: ResearchId, values: BTreeMap<IdentifierType, String>) -> Self {
        Self {
            research_id,
            values,
            created_at: now_millis(),
            updated_at: None,
        }
    }

    pub fn get(&self, identifier_type: IdentifierType) -> Option<&str> {
        self.values.get(&identifier_type).map(String::as_str)
    }

    /// True if this identity holds `value` for `identifier_type`.
    pub fn holds(&self, identifier_type: IdentifierType, value: &str) -> bool {
        self.get(identifier_type) == Some(value)
    }
}

/// Persistence port for the identity map.
///
/// Implementations must reject any write that would bind one value of a type
/// to two research ids, or reuse a research id. Those rejections surface as
/// `Error::UniqueViolation`; callers treat them as lost races and retry.
pub trait IdentityStore: Send + Sync {
    /// Every identity holding at least one of the given values.
    fn find_matches(&self, pairs: &[(IdentifierType, String)]) -> Result<Vec<CanonicalIdentity>>;

    /// Insert a new identity.
    fn insert(&self, identity: &CanonicalIdentity) -> Result<()>;

    /// Fill an empty slot of an existing identity.
    ///
    /// `Error::SlotRace` if the slot is no longer empty,
    /// `Error::UniqueViolation` if the value is bound to another identity.
    fn fill_slot(
        &self,
        research_id: &ResearchId,
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<()>;

    /// Point lookup used by the scrubber.
    fn lookup(&self, identifier_type: IdentifierType, value: &str) -> Result<Option<ResearchId>>;

    fn get(&self, research_id: &ResearchId) -> Result<Option<CanonicalIdentity>>;

    /// Every identity, ordered by research id.
    fn all(&self) -> Result<Vec<CanonicalIdentity>>;

    fn count(&self) -> Result<i64>;
}

/// Identity map statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_identities: i64,
    /// Filled slots per identifier type.
    pub filled: BTreeMap<IdentifierType, i64>,
    pub db_path: String,
    pub db_size_mb: f64,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
