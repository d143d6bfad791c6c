//! deident core — identifier types, identity schema, errors, configuration.

pub mod config;
pub mod error;
pub mod identifier;
pub mod record;
pub mod schema;

pub use config::{DataPaths, DeidentConfig, PipelineConfig, ResolverConfig};
pub use error::{Error, Result};
pub use identifier::{IdentifierType, ResearchId, Validator, RESEARCH_ID_SUFFIX};
pub use record::{cell_text, Record};
pub use schema::{ColumnRule, IdentitySchema, TableIdentity, DEFAULT_SLOT};
