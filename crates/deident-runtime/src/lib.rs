//! deident runtime — the two-pass pipeline.
//!
//! Pass 1 resolves every witness set of every shard against the shared
//! identity store. After a full barrier, Pass 2 scrubs every record using
//! read-only lookups.

pub mod pipeline;
pub mod types;

pub use pipeline::{identity_pass, scrub_pass, split_into_shards, DeidentPipeline};
pub use types::*;
