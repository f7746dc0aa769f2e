//! CLI argument parsing for chunksync

use crate::config::{Config, DEFAULT_CHUNK_SIZE, MIN_CLI_CHUNK_SIZE};
use crate::digest::DigestKind;
use crate::engine::Strategy;
use crate::error::{Error, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// chunksync - chunk-based incremental file synchronizer
#[derive(Parser, Debug)]
#[command(name = "chunksync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output logs as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build or refresh the chunk-hash index of a file
    Hash(HashArgs),

    /// Compare a file against a reference index, optionally writing a delta
    Verify(VerifyArgs),

    /// Patch a file with a delta stream
    Patch(PatchArgs),

    /// Dump a hash store as JSON
    Show(ShowArgs),
}

/// Options shared by every operation on an input file
#[derive(Parser, Debug)]
pub struct CommonArgs {
    /// File to operate on
    pub file: PathBuf,

    /// Chunk size in bytes (accepts suffixes like 64K, 4M)
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE.to_string())]
    pub chunk_size: String,

    /// Digest algorithm (sha256, blake3)
    #[arg(long, default_value = "sha256")]
    pub digest: String,

    /// Explicit hash-store path (default: derived under the cache root)
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Cache root for derived hash-store paths
    #[arg(long)]
    pub cache_root: Option<PathBuf>,

    /// Show a progress bar
    #[arg(short = 'P', long)]
    pub progress: bool,
}

/// Arguments for the hash command
#[derive(Parser, Debug)]
pub struct HashArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Recompute every chunk instead of resuming from the index
    #[arg(long)]
    pub force_refresh: bool,

    /// Hashing strategy (direct, read-hash, hash-only)
    #[arg(long, default_value = "read-hash")]
    pub strategy: String,

    /// Number of hashing workers [default: auto]
    #[arg(short = 'j', long, default_value = "0")]
    pub jobs: usize,
}

/// Arguments for the verify command
#[derive(Parser, Debug)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Reference hash store to compare against
    #[arg(long)]
    pub against: PathBuf,

    /// Write mismatched chunks as a delta to this file ("-" for stdout)
    #[arg(long)]
    pub delta: Option<PathBuf>,

    /// Stop after this many mismatched chunks
    #[arg(long)]
    pub chunk_limit: Option<u64>,
}

/// Arguments for the patch command
#[derive(Parser, Debug)]
pub struct PatchArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Delta file to apply ("-" for stdin)
    #[arg(long)]
    pub delta: PathBuf,
}

/// Arguments for the show command
#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Hash store file to dump
    pub store: PathBuf,
}

impl CommonArgs {
    /// Build the runtime configuration from these flags
    pub fn to_config(&self) -> Result<Config> {
        let mut config = Config::load()?;
        config.chunk_size = Config::parse_size(&self.chunk_size)?;
        if config.chunk_size < MIN_CLI_CHUNK_SIZE {
            return Err(Error::config(format!(
                "chunk size {} is below the minimum of {}",
                config.chunk_size, MIN_CLI_CHUNK_SIZE
            )));
        }
        config.digest = self.digest.parse::<DigestKind>()?;
        if let Some(cache_root) = &self.cache_root {
            config.cache_root = cache_root.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

impl HashArgs {
    pub fn to_config(&self) -> Result<Config> {
        let mut config = self.common.to_config()?;
        config.strategy = self.strategy.parse::<Strategy>()?;
        config.jobs = self.jobs;
        Ok(config)
    }
}

impl VerifyArgs {
    pub fn to_config(&self) -> Result<Config> {
        let mut config = self.common.to_config()?;
        config.chunk_limit = self.chunk_limit;
        Ok(config)
    }
}
