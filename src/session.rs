//! Per-file session: the owner of one input file's reader, index and store
//!
//! A session opens the input, resolves and validates the persisted store,
//! and exposes the three operations (hash, verify, patch) plus the exit
//! flush the host process wires to its shutdown path.

use crate::config::Config;
use crate::delta::{self, ApplyStats, CompareStats, DeltaSink, PatchHeader};
pub use crate::delta::CompareOutcome;
use crate::engine::{HashStats, HashingEngine, Strategy};
use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::reader::ChunkReader;
use crate::stat::FileStat;
use crate::store::{ChunkIndex, FileIdentity, HashStore, NotUsable, StoreRecord};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// How the persisted store was treated when the session opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    /// No store existed yet
    Initial,
    /// Cached hashes were loaded and trusted
    Loaded,
    /// A store existed but failed validation and was discarded
    Discarded(NotUsable),
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadState::Initial => f.write_str("initial"),
            LoadState::Loaded => f.write_str("loaded"),
            LoadState::Discarded(reason) => write!(f, "not-loaded({})", reason),
        }
    }
}

/// Distinguishable outcome of a hashing run, for callers that branch on it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOutcome {
    Unchanged,
    Updated,
}

/// Session bound to one input file
#[derive(Debug)]
pub struct FileSession {
    config: Config,
    input_path: PathBuf,
    reader: Arc<ChunkReader>,
    store: HashStore,
    index: Arc<Mutex<ChunkIndex>>,
    dirty: Arc<AtomicBool>,
    progress: Arc<Progress>,
    load_state: LoadState,
}

impl FileSession {
    /// Open `input` and load (or discard) its persisted store
    ///
    /// With no explicit store path the location is derived from the
    /// input's absolute path under the configured cache root.
    pub fn open(config: &Config, input: &Path, store_path: Option<PathBuf>) -> Result<Self> {
        config.validate()?;

        let input_path = std::fs::canonicalize(input).map_err(|_| {
            Error::config(format!("input file not found: {}", input.display()))
        })?;
        if !input_path.is_file() {
            return Err(Error::config(format!(
                "input is not a regular file: {}",
                input_path.display()
            )));
        }

        let stat = FileStat::capture(&input_path)?;
        let identity = FileIdentity::new(input_path.clone(), &stat);

        let store = match store_path {
            Some(path) => HashStore::at(path),
            None => HashStore::for_input(&config.cache_root, &input_path, config.chunk_size)?,
        };

        let (index, load_state) = match store.load(config.chunk_size, Some(&identity)) {
            Ok(record) => (record.chunks, LoadState::Loaded),
            Err(NotUsable::Absent) => (ChunkIndex::new(), LoadState::Initial),
            Err(reason) => {
                tracing::warn!(store = ?store.path(), %reason, "discarding persisted store");
                (ChunkIndex::new(), LoadState::Discarded(reason))
            }
        };

        tracing::debug!(
            input = ?input_path,
            store = ?store.path(),
            state = %load_state,
            chunks = index.len(),
            "session opened"
        );

        let reader = Arc::new(ChunkReader::open(&input_path, config.chunk_size)?);

        Ok(Self {
            config: config.clone(),
            input_path,
            reader,
            store,
            index: Arc::new(Mutex::new(index)),
            dirty: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(Progress::new()),
            load_state,
        })
    }

    /// How the persisted store was treated at open time
    pub fn load_state(&self) -> &LoadState {
        &self.load_state
    }

    /// Progress counters for an external reporter to sample
    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Where this session persists its index
    pub fn store_path(&self) -> &Path {
        self.store.path()
    }

    /// Number of chunk hashes currently in the index
    pub fn indexed_chunks(&self) -> usize {
        self.index.lock().expect("chunk index lock poisoned").len()
    }

    /// Whether any chunk hash changed during this session
    pub fn changed(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Outcome of the hashing work done so far
    pub fn hash_outcome(&self) -> HashOutcome {
        if self.changed() {
            HashOutcome::Updated
        } else {
            HashOutcome::Unchanged
        }
    }

    /// Hash the input file
    pub fn hash(&self, incremental: bool, strategy: Strategy) -> Result<HashStats> {
        let engine = HashingEngine::new(
            Arc::clone(&self.reader),
            Arc::clone(&self.index),
            self.config.digest,
            Arc::clone(&self.dirty),
            Arc::clone(&self.progress),
            self.config.effective_jobs(),
        );
        engine.hash_file(incremental, strategy)
    }

    /// Header for a delta stream produced by this session
    ///
    /// Captures the source file's stat at call time; the patch consumer
    /// applies it to the target after the last frame.
    pub fn patch_header(&self) -> Result<PatchHeader> {
        let stat = FileStat::capture(&self.input_path)?;
        Ok(PatchHeader::new(self.config.chunk_size, stat))
    }

    /// Compare against a reference store, streaming mismatches to `sink`
    ///
    /// Every chunk is freshly hashed so the comparison is trustworthy: the
    /// in-memory index is emptied first and repaired chunk by chunk during
    /// the walk, in the same pass that feeds the sink.
    pub fn verify(
        &self,
        reference_path: &Path,
        sink: Option<&mut dyn DeltaSink>,
    ) -> Result<CompareStats> {
        let reference = self.load_reference(reference_path)?;

        self.index
            .lock()
            .expect("chunk index lock poisoned")
            .clear();

        delta::compare(
            &self.reader,
            &self.index,
            &self.dirty,
            self.config.digest,
            &reference,
            self.config.chunk_limit,
            sink,
            &self.progress,
        )
    }

    /// Apply a delta stream to this session's file
    pub fn apply(&self, stream: impl Read) -> Result<ApplyStats> {
        delta::apply(
            stream,
            &self.input_path,
            &self.index,
            &self.dirty,
            self.config.digest,
            self.config.chunk_size,
        )
    }

    /// Save the index if anything changed
    ///
    /// The host process calls this on normal exit and from its termination
    /// signal path. Returns whether a save happened.
    pub fn on_exit_flush(&self) -> Result<bool> {
        if !self.changed() {
            tracing::debug!("index unchanged, skipping store save");
            return Ok(false);
        }

        // Identity is captured at save time so the record matches the file
        // as it is now (patching rewrites size and times)
        let stat = FileStat::capture(&self.input_path)?;
        let identity = FileIdentity::new(self.input_path.clone(), &stat);
        let mut record = StoreRecord::new(&identity, self.config.chunk_size);
        record.chunks = self
            .index
            .lock()
            .expect("chunk index lock poisoned")
            .clone();

        self.store.save(&record)?;
        Ok(true)
    }

    fn load_reference(&self, path: &Path) -> Result<ChunkIndex> {
        let store = HashStore::at(path.to_path_buf());
        match store.load(self.config.chunk_size, None) {
            Ok(record) => Ok(record.chunks),
            Err(reason @ NotUsable::ChunkSizeMismatch { .. }) => Err(Error::config(format!(
                "reference {}: {}",
                path.display(),
                reason
            ))),
            Err(reason) => Err(Error::reference(format!(
                "{}: {}",
                path.display(),
                reason
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_in(dir: &Path, chunk_size: u64) -> Config {
        Config {
            chunk_size,
            cache_root: dir.join("cache"),
            jobs: 1,
            ..Config::default()
        }
    }

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(data).unwrap();
        path
    }

    #[test]
    fn test_open_missing_input_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), 512);
        let err = FileSession::open(&config, &dir.path().join("nope"), None).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_hash_then_reload_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), 512);
        let input = write_file(dir.path(), "input.bin", &vec![9u8; 2000]);

        let session = FileSession::open(&config, &input, None).unwrap();
        assert_eq!(*session.load_state(), LoadState::Initial);
        session.hash(true, Strategy::Direct).unwrap();
        assert_eq!(session.hash_outcome(), HashOutcome::Updated);
        assert!(session.on_exit_flush().unwrap());

        let session = FileSession::open(&config, &input, None).unwrap();
        assert_eq!(*session.load_state(), LoadState::Loaded);
        session.hash(true, Strategy::Direct).unwrap();
        assert_eq!(session.hash_outcome(), HashOutcome::Unchanged);
        assert!(!session.on_exit_flush().unwrap());
    }

    #[test]
    fn test_modified_input_discards_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), 512);
        let input = write_file(dir.path(), "input.bin", &vec![1u8; 1024]);

        let session = FileSession::open(&config, &input, None).unwrap();
        session.hash(true, Strategy::Direct).unwrap();
        session.on_exit_flush().unwrap();

        // Grow the file; size (and mtime) no longer match
        std::fs::OpenOptions::new()
            .append(true)
            .open(&input)
            .unwrap()
            .write_all(&[2u8; 512])
            .unwrap();

        let session = FileSession::open(&config, &input, None).unwrap();
        assert!(matches!(session.load_state(), LoadState::Discarded(_)));
        assert_eq!(session.indexed_chunks(), 0);
    }

    #[test]
    fn test_verify_against_missing_reference_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), 512);
        let input = write_file(dir.path(), "input.bin", &vec![1u8; 1024]);

        let session = FileSession::open(&config, &input, None).unwrap();
        let err = session
            .verify(&dir.path().join("absent-store"), None)
            .unwrap_err();
        assert!(matches!(err, Error::Reference { .. }));
    }
}
