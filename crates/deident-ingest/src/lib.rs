//! deident ingest — classify identifier cells and group them into witness sets.

pub mod extract;
pub mod witness;

pub use extract::{classify_cell, Extractor};
pub use witness::{IdentityWitness, WitnessSet};
