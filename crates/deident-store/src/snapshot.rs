//! Point-in-time copies of the identity map.
//!
//! A snapshot taken before an identity pass lets the caller confirm that the
//! pass only added information: every published research id still exists and
//! keeps every value it had.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::*;
use deident_core::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub identities: Vec<CanonicalIdentity>,
}

/// Outcome of comparing a snapshot with the live map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityReport {
    /// Identities present in the snapshot.
    pub checked: usize,
    /// Of those, identities that gained at least one slot since.
    pub filled_since: usize,
}

impl IdentitySnapshot {
    pub fn capture(store: &dyn IdentityStore) -> Result<Self> {
        Ok(Self {
            identities: store.all()?,
        })
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Write one identity per line.
    pub fn write_jsonl(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut out = BufWriter::new(File::create(path)?);
        for identity in &self.identities {
            serde_json::to_writer(&mut out, identity)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        info!("Wrote {} identities to {}", self.len(), path.display());
        Ok(())
    }

    pub fn read_jsonl(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut identities = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            identities.push(serde_json::from_str(&line)?);
        }
        Ok(Self { identities })
    }

    /// Check that the live map still honours everything in this snapshot.
    pub fn verify_against(&self, store: &dyn IdentityStore) -> Result<StabilityReport> {
        let mut report = StabilityReport::default();
        for before in &self.identities {
            let after = store.get(&before.research_id)?.ok_or_else(|| {
                Error::Verification(format!("identity {} disappeared", before.research_id))
            })?;
            for (t, value) in &before.values {
                if after.get(*t) != Some(value.as_str()) {
                    return Err(Error::Verification(format!(
                        "{} of identity {} changed",
                        t, before.research_id
                    )));
                }
            }
            report.checked += 1;
            if after.values.len() > before.values.len() {
                report.filled_since += 1;
            }
        }
        Ok(report)
    }
}
