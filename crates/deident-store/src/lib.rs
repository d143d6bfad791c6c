//! deident store — the identity map and its persistence port.
//!
//! `IdentityStore` is the only shared mutable state in the pipeline. Both
//! implementations enforce that a value of one identifier type belongs to at
//! most one research id; resolvers rely on that constraint, not on locking.

pub mod memory;
pub mod schema;
pub mod snapshot;
pub mod sqlite;
pub mod types;

pub use memory::MemoryIdentityStore;
pub use snapshot::{IdentitySnapshot, StabilityReport};
pub use sqlite::SqliteIdentityStore;
pub use types::*;
