//! Runtime configuration for the core.
//!
//! Directories and limits are read from the environment with sane literal
//! defaults, so a caller that sets nothing still gets working behavior.

use std::path::PathBuf;

/// Tunables for the core. Only the scratch directory is environment-aware;
/// the rest default to fixed constants.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for session snapshots, fetch cache, and uploaded parts.
    pub scratch_dir: PathBuf,

    /// Maximum number of rows returned in a `LoadReport` preview.
    pub preview_limit: usize,

    /// Maximum entries held per bucket's sample map in an incremental
    /// session.
    pub incremental_sample_limit: usize,

    /// Maximum entries held in the `only_in_source1` sample.
    pub only_in_source1_sample_limit: usize,

    /// Maximum entries held in the `only_in_source2` sample.
    pub only_in_source2_sample_limit: usize,

    /// Files at or above this size are treated as "large" by adapters that
    /// want to choose a streaming code path over a buffered one. Not
    /// enforced by the core itself, which always streams.
    pub large_file_threshold_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::var("CPT_COMPARE_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("cpt-compare")),
            preview_limit: 10_000,
            incremental_sample_limit: 2_000,
            only_in_source1_sample_limit: 100,
            only_in_source2_sample_limit: 50,
            large_file_threshold_bytes: 300 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Session snapshot path for a given session id.
    pub fn session_snapshot_path(&self, session_id: &str) -> PathBuf {
        self.scratch_dir.join("sessions").join(format!("{session_id}.json"))
    }

    /// Cache path for a fetched URL, addressed by its SHA-256 hex digest.
    pub fn fetch_cache_path(&self, digest_hex: &str) -> PathBuf {
        self.scratch_dir.join("fetch-cache").join(digest_hex)
    }
}
