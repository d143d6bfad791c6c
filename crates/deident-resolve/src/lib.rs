//! deident resolve — map witness sets onto canonical identities.
//!
//! Resolution is optimistic: look up, then insert or fill, and start over if
//! the store reports that a concurrent resolver won the race.

pub mod resolver;
pub mod types;

pub use resolver::IdentityResolver;
pub use types::*;
