//! Configuration for chunksync
//!
//! One `Config` value is built at startup and passed by reference into the
//! core components. There is no module-level mutable state.

use crate::digest::DigestKind;
use crate::engine::Strategy;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Format version shared by the persisted store record and the delta
/// stream header. Bumped together; see DESIGN.md for the history.
pub const FORMAT_VERSION: u64 = 1;

/// Default chunk size in bytes (8 KiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 8192;

/// Smallest chunk size the CLI accepts; the library itself only rejects zero
pub const MIN_CLI_CHUNK_SIZE: u64 = 512;

/// Default number of hashing workers (0 = auto-detect CPU count)
pub const DEFAULT_JOBS: usize = 0;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chunk size in bytes used for hashing, comparison and patching
    pub chunk_size: u64,

    /// Digest algorithm for chunk hashes
    pub digest: DigestKind,

    /// Number of hashing workers (0 = auto-detect CPU count)
    pub jobs: usize,

    /// Execution strategy for hashing runs
    pub strategy: Strategy,

    /// Root directory for derived hash-store paths
    pub cache_root: PathBuf,

    /// Upper bound on mismatched chunks emitted per comparison run
    /// (bounds work-per-run for large files with many changes)
    pub chunk_limit: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            digest: DigestKind::default(),
            jobs: DEFAULT_JOBS,
            strategy: Strategy::default(),
            cache_root: Self::default_cache_root(),
            chunk_limit: None,
        }
    }
}

impl Config {
    /// Load configuration from the default config file, falling back to
    /// defaults when none exists
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| Error::io("reading config", e))?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("chunksync").join("config.toml"))
            .ok_or_else(|| Error::config("could not determine config directory"))
    }

    /// Default root for derived hash-store paths
    pub fn default_cache_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("chunksync")
            .join("hashes")
    }

    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::config("chunk size must be nonzero"));
        }
        Ok(())
    }

    /// Get the effective number of workers (resolves 0 to CPU count)
    pub fn effective_jobs(&self) -> usize {
        if self.jobs == 0 {
            num_cpus::get()
        } else {
            self.jobs
        }
    }

    /// Parse a size string like "8192", "64K", "4M" into bytes
    pub fn parse_size(s: &str) -> Result<u64> {
        let s = s.trim().to_uppercase();
        if s.is_empty() {
            return Ok(0);
        }

        let (num_part, suffix) = if s.ends_with("KB") || s.ends_with("KIB") {
            (s.trim_end_matches(|c: char| c.is_alphabetic()), 1024u64)
        } else if s.ends_with("MB") || s.ends_with("MIB") {
            (
                s.trim_end_matches(|c: char| c.is_alphabetic()),
                1024u64 * 1024,
            )
        } else if s.ends_with('K') {
            (&s[..s.len() - 1], 1024u64)
        } else if s.ends_with('M') {
            (&s[..s.len() - 1], 1024u64 * 1024)
        } else if s.ends_with('G') {
            (&s[..s.len() - 1], 1024u64 * 1024 * 1024)
        } else {
            (s.as_str(), 1u64)
        };

        let num: u64 = num_part
            .parse()
            .map_err(|_| Error::config(format!("invalid size value: {}", s)))?;

        Ok(num * suffix)
    }
}
