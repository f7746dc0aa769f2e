//! Persistent chunk-hash index
//!
//! A store file carries the chunk index for one input file plus the
//! identity metadata used to decide whether the cached hashes are still
//! trustworthy. A record that fails any identity check is discarded
//! entirely; persisted caches are advisory, never a source of truth for
//! file content.

use crate::config::FORMAT_VERSION;
use crate::digest::ChunkHash;
use crate::error::{Error, Result};
use crate::stat::FileStat;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error as ThisError;

/// Magic bytes for store files
pub const STORE_MAGIC: &[u8; 6] = b"CSIDX\x01";

/// Container version of the store file framing
pub const STORE_CONTAINER_VERSION: u8 = 1;

/// Mapping from chunk ordinal to content hash
///
/// Dense from 0 to `chunk_count - 1` once a full run completes; holes are
/// chunks still pending (or skipped after a read error).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkIndex {
    chunks: BTreeMap<u64, ChunkHash>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ordinal: u64) -> Option<&ChunkHash> {
        self.chunks.get(&ordinal)
    }

    pub fn contains(&self, ordinal: u64) -> bool {
        self.chunks.contains_key(&ordinal)
    }

    /// Insert a hash, returning true when the stored value actually
    /// changed (new ordinal or different hash)
    pub fn insert(&mut self, ordinal: u64, hash: ChunkHash) -> bool {
        match self.chunks.insert(ordinal, hash) {
            Some(previous) => previous != hash,
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Drop entries at or beyond `count`, returning true when any existed
    pub fn truncate_to(&mut self, count: u64) -> bool {
        let before = self.chunks.len();
        self.chunks.retain(|&ordinal, _| ordinal < count);
        self.chunks.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &ChunkHash)> {
        self.chunks.iter().map(|(k, v)| (*k, v))
    }
}

/// Identity of the input file a store record belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    /// Absolute path of the input file
    pub path: PathBuf,
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
}

impl FileIdentity {
    pub fn new(path: PathBuf, stat: &FileStat) -> Self {
        Self {
            path,
            size: stat.size,
            mtime_secs: stat.mtime_secs,
            mtime_nanos: stat.mtime_nanos,
        }
    }
}

/// Persisted unit: chunk index plus identity metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRecord {
    pub format_version: u64,
    /// Absolute path of the hashed input file
    pub input_path: PathBuf,
    pub chunk_size: u64,
    pub file_size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    pub chunks: ChunkIndex,
}

impl StoreRecord {
    /// Fresh record for an input file with no usable cached hashes
    pub fn new(identity: &FileIdentity, chunk_size: u64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            input_path: identity.path.clone(),
            chunk_size,
            file_size: identity.size,
            mtime_secs: identity.mtime_secs,
            mtime_nanos: identity.mtime_nanos,
            chunks: ChunkIndex::new(),
        }
    }
}

/// Why a persisted record could not be used for this run
///
/// Only `Corrupt` and `Absent` mean nothing decodable exists on disk; the
/// other reasons mean the stored data is stale or belongs to a different
/// file, and it must be discarded rather than partially trusted.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum NotUsable {
    #[error("store format version {found} does not match {expected}")]
    VersionMismatch { expected: u64, found: u64 },

    #[error("store chunk size {found} does not match {expected}")]
    ChunkSizeMismatch { expected: u64, found: u64 },

    #[error("input file size changed from {recorded} to {current}")]
    SizeMismatch { recorded: u64, current: u64 },

    #[error("input file modification time changed")]
    MtimeMismatch,

    #[error("store belongs to {recorded}, not {current}")]
    PathMismatch { recorded: String, current: String },

    #[error("store file is unreadable or corrupt: {0}")]
    Corrupt(String),

    #[error("no store file present")]
    Absent,
}

/// Handle to one on-disk store location
#[derive(Debug, Clone)]
pub struct HashStore {
    path: PathBuf,
}

impl HashStore {
    /// Use an explicit store path
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// Derive the store location for an input file
    ///
    /// The path is `<cache_root>/<h[0..2]>/<h[2..4]>/<h>` where `h` is the
    /// lowercase-hex SHA-512 of the input file's absolute path, sharded to
    /// bound directory fan-out. A legacy `<input>.hash.<chunk_size>`
    /// sidecar, if present, is migrated into the derived location.
    pub fn for_input(cache_root: &Path, input_abs: &Path, chunk_size: u64) -> Result<Self> {
        let digest = Sha512::digest(input_abs.as_os_str().as_encoded_bytes());
        let name = hex::encode(digest);
        let dir = cache_root.join(&name[0..2]).join(&name[2..4]);
        std::fs::create_dir_all(&dir).map_err(|e| Error::io("creating store directory", e))?;
        let path = dir.join(&name);

        let legacy = {
            let mut os = input_abs.as_os_str().to_owned();
            os.push(format!(".hash.{}", chunk_size));
            PathBuf::from(os)
        };
        if legacy.is_file() && !path.exists() {
            tracing::info!(from = ?legacy, to = ?path, "migrating legacy hash sidecar");
            std::fs::rename(&legacy, &path)
                .map_err(|e| Error::io("migrating legacy hash sidecar", e))?;
        }

        Ok(Self { path })
    }

    /// Location of this store on disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record, validating it against the running configuration
    ///
    /// `format_version` and `chunk_size` are always checked. When
    /// `identity` is given, the exact identity check additionally requires
    /// file size, mtime and input path to match.
    pub fn load(
        &self,
        expected_chunk_size: u64,
        identity: Option<&FileIdentity>,
    ) -> std::result::Result<StoreRecord, NotUsable> {
        if !self.path.is_file() {
            return Err(NotUsable::Absent);
        }

        let record = self.read_container()?;

        if record.format_version != FORMAT_VERSION {
            return Err(NotUsable::VersionMismatch {
                expected: FORMAT_VERSION,
                found: record.format_version,
            });
        }
        if record.chunk_size != expected_chunk_size {
            return Err(NotUsable::ChunkSizeMismatch {
                expected: expected_chunk_size,
                found: record.chunk_size,
            });
        }

        if let Some(identity) = identity {
            if record.file_size != identity.size {
                return Err(NotUsable::SizeMismatch {
                    recorded: record.file_size,
                    current: identity.size,
                });
            }
            if record.mtime_secs != identity.mtime_secs
                || record.mtime_nanos != identity.mtime_nanos
            {
                return Err(NotUsable::MtimeMismatch);
            }
            if record.input_path != identity.path {
                return Err(NotUsable::PathMismatch {
                    recorded: record.input_path.display().to_string(),
                    current: identity.path.display().to_string(),
                });
            }
        }

        Ok(record)
    }

    /// Persist the record
    ///
    /// Writes to a temporary file in the target directory and renames it
    /// over the destination, so a failed save leaves the previous file
    /// intact.
    pub fn save(&self, record: &StoreRecord) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::config("store path has no parent directory"))?;
        std::fs::create_dir_all(dir).map_err(|e| Error::io("creating store directory", e))?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io("creating temp store", e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            Self::write_container(&mut writer, record)?;
            writer.flush().map_err(|e| Error::io("flushing store", e))?;
        }
        tmp.persist(&self.path)
            .map_err(|e| Error::io("replacing store file", e.error))?;

        tracing::debug!(path = ?self.path, chunks = record.chunks.len(), "saved hash store");
        Ok(())
    }

    /// Render the stored record as JSON for debugging
    ///
    /// Not part of the core contract; backs the `show` subcommand.
    pub fn dump(&self) -> Result<serde_json::Value> {
        let record = self
            .read_container()
            .map_err(|reason| Error::format(reason.to_string()))?;
        serde_json::to_value(&record)
            .map_err(|e| Error::format(format!("rendering store record: {}", e)))
    }

    fn read_container(&self) -> std::result::Result<StoreRecord, NotUsable> {
        let file = File::open(&self.path).map_err(|e| NotUsable::Corrupt(e.to_string()))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 6];
        reader
            .read_exact(&mut magic)
            .map_err(|e| NotUsable::Corrupt(e.to_string()))?;
        if &magic != STORE_MAGIC {
            return Err(NotUsable::Corrupt("bad magic".to_string()));
        }

        let mut version = [0u8; 1];
        reader
            .read_exact(&mut version)
            .map_err(|e| NotUsable::Corrupt(e.to_string()))?;
        if version[0] != STORE_CONTAINER_VERSION {
            return Err(NotUsable::Corrupt(format!(
                "unsupported container version {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        reader
            .read_exact(&mut len_bytes)
            .map_err(|e| NotUsable::Corrupt(e.to_string()))?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut data = vec![0u8; len];
        reader
            .read_exact(&mut data)
            .map_err(|e| NotUsable::Corrupt(e.to_string()))?;

        serde_json::from_slice(&data).map_err(|e| NotUsable::Corrupt(e.to_string()))
    }

    fn write_container<W: Write>(writer: &mut W, record: &StoreRecord) -> Result<()> {
        let json = serde_json::to_vec(record)
            .map_err(|e| Error::format(format!("serializing store record: {}", e)))?;

        writer
            .write_all(STORE_MAGIC)
            .map_err(|e| Error::io("writing store magic", e))?;
        writer
            .write_all(&[STORE_CONTAINER_VERSION])
            .map_err(|e| Error::io("writing container version", e))?;
        writer
            .write_all(&(json.len() as u64).to_le_bytes())
            .map_err(|e| Error::io("writing store length", e))?;
        writer
            .write_all(&json)
            .map_err(|e| Error::io("writing store record", e))?;
        Ok(())
    }
}
