//! Resolver types.

use serde::{Deserialize, Serialize};

use deident_core::ResearchId;

/// Outcome of resolving one witness set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub research_id: ResearchId,
    /// A new identity was inserted.
    pub created: bool,
    /// Empty slots filled on an existing identity.
    pub filled: usize,
    /// Store races lost before this attempt succeeded.
    pub retries: u32,
}
