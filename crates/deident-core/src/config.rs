//! Configuration and data directory management.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Paths to all deident data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// Identity store directory (`data/store/`).
    pub store: PathBuf,
    /// Identity map snapshots (`data/snapshots/`).
    pub snapshots: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            store: root.join("store"),
            snapshots: root.join("snapshots"),
            root,
        };
        paths.ensure_dirs()?;
        Ok(paths)
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.store)?;
        std::fs::create_dir_all(&self.snapshots)?;
        Ok(())
    }
}

/// Retry policy for store races during resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Retries after the first attempt before giving up.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles on each further retry.
    pub backoff_base_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 10,
        }
    }
}

/// Two-pass pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Shards processed concurrently within a pass.
    pub max_workers: usize,
    /// Records per shard when the caller lets the pipeline split input.
    pub shard_size: usize,
    /// Check every scrubbed record for surviving raw identifiers.
    pub verify_output: bool,
    /// Check that Pass 1 left every previously published identity intact.
    pub verify_identity_map: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            shard_size: 10_000,
            verify_output: true,
            verify_identity_map: false,
        }
    }
}

/// Top-level deident configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeidentConfig {
    pub data_paths: DataPaths,
    pub resolver: ResolverConfig,
    pub pipeline: PipelineConfig,
}

impl DeidentConfig {
    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let mut resolver = ResolverConfig::default();
        if let Some(n) = env_parse("DEIDENT_MAX_RETRIES") {
            resolver.max_retries = n;
        }
        if let Some(ms) = env_parse("DEIDENT_BACKOFF_MS") {
            resolver.backoff_base_ms = ms;
        }

        let mut pipeline = PipelineConfig::default();
        if let Some(n) = env_parse::<usize>("DEIDENT_WORKERS") {
            pipeline.max_workers = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("DEIDENT_SHARD_SIZE") {
            pipeline.shard_size = n.max(1);
        }
        if let Some(b) = env_parse("DEIDENT_VERIFY_OUTPUT") {
            pipeline.verify_output = b;
        }
        if let Some(b) = env_parse("DEIDENT_VERIFY_IDENTITY_MAP") {
            pipeline.verify_identity_map = b;
        }

        Ok(Self {
            data_paths: DataPaths::new(data_dir)?,
            resolver,
            pipeline,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_paths_created() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path().join("data")).unwrap();
        assert!(paths.store.is_dir());
        assert!(paths.snapshots.is_dir());
    }

    #[test]
    fn test_resolver_defaults() {
        let r = ResolverConfig::default();
        assert_eq!(r.max_retries, 3);
        assert_eq!(r.backoff_base_ms, 10);
    }
}
