//! Chunk-level comparison against a reference index
//!
//! Walks the full chunk range in order, hashing missing chunks on demand,
//! and streams every mismatched chunk's bytes to the active sink.

use super::sink::DeltaSink;
use crate::digest::DigestKind;
use crate::error::Result;
use crate::progress::Progress;
use crate::reader::ChunkReader;
use crate::store::ChunkIndex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Result of one comparison run
#[derive(Debug, Clone, Default)]
pub struct CompareStats {
    pub matched: u64,
    pub mismatched: u64,
    /// Ordinals that differed, ascending
    pub mismatched_ordinals: Vec<u64>,
    /// Whether the run stopped early at the chunk limit
    pub limit_reached: bool,
}

/// Distinguishable outcome of a comparison run, for callers that branch
/// on it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOutcome {
    NoDifferences,
    DifferencesFound,
}

impl CompareStats {
    /// Whether any chunk differed from the reference
    pub fn has_differences(&self) -> bool {
        self.mismatched > 0
    }

    pub fn outcome(&self) -> CompareOutcome {
        if self.has_differences() {
            CompareOutcome::DifferencesFound
        } else {
            CompareOutcome::NoDifferences
        }
    }
}

/// Compare local chunks against `reference`, streaming mismatches
///
/// Ordinals run ascending from 0. A chunk whose local hash is missing is
/// hashed on demand, which also repairs the local index and marks it
/// dirty. A chunk mismatches when its local hash is absent from the
/// reference or differs from the reference's entry. With `chunk_limit`
/// set, the walk stops once that many mismatches have been emitted.
///
/// A chunk read failure here is fatal: the bytes feed either the local
/// hash or the delta payload, and a wrong payload would corrupt the patch
/// target.
#[allow(clippy::too_many_arguments)]
pub fn compare(
    reader: &ChunkReader,
    index: &Mutex<ChunkIndex>,
    dirty: &AtomicBool,
    digest: DigestKind,
    reference: &ChunkIndex,
    chunk_limit: Option<u64>,
    mut sink: Option<&mut dyn DeltaSink>,
    progress: &Progress,
) -> Result<CompareStats> {
    let total = reader.chunk_count();
    progress.set_total_chunks(total);

    let mut stats = CompareStats::default();

    for ordinal in 0..total {
        if let Some(limit) = chunk_limit {
            if stats.mismatched >= limit {
                stats.limit_reached = true;
                tracing::debug!(limit, "chunk limit reached, stopping comparison");
                break;
            }
        }

        // Reuse bytes read for on-demand hashing when the chunk turns out
        // to be a mismatch
        let mut chunk_bytes: Option<Vec<u8>> = None;

        let local = {
            let cached = index
                .lock()
                .expect("chunk index lock poisoned")
                .get(ordinal)
                .copied();
            match cached {
                Some(hash) => hash,
                None => {
                    let bytes = reader.read_chunk(ordinal)?;
                    let hash = digest.compute(&bytes);
                    let changed = index
                        .lock()
                        .expect("chunk index lock poisoned")
                        .insert(ordinal, hash);
                    if changed {
                        dirty.store(true, Ordering::Relaxed);
                    }
                    progress.record_chunk(bytes.len());
                    chunk_bytes = Some(bytes);
                    hash
                }
            }
        };

        if reference.get(ordinal) == Some(&local) {
            stats.matched += 1;
            continue;
        }

        stats.mismatched += 1;
        stats.mismatched_ordinals.push(ordinal);
        tracing::debug!(ordinal, hash = %local, "chunk mismatch");

        if let Some(sink) = sink.as_deref_mut() {
            let bytes = match chunk_bytes {
                Some(bytes) => bytes,
                None => reader.read_chunk(ordinal)?,
            };
            sink.send_chunk(ordinal, &local, &bytes)?;
        }
    }

    if let Some(sink) = sink {
        sink.finish()?;
    }

    tracing::info!(
        matched = stats.matched,
        mismatched = stats.mismatched,
        "comparison finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::sink::FileDeltaSink;
    use crate::delta::PatchHeader;
    use crate::stat::FileStat;
    use std::io::Write;

    fn fixture(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    fn index_of(data: &[u8], chunk_size: usize) -> ChunkIndex {
        let mut index = ChunkIndex::new();
        for (ordinal, chunk) in data.chunks(chunk_size).enumerate() {
            index.insert(ordinal as u64, DigestKind::Sha256.compute(chunk));
        }
        index
    }

    #[test]
    fn test_single_changed_chunk_detected() {
        let file = fixture(b"AAAAZZZZCCCC");
        let reader = ChunkReader::open(file.path(), 4).unwrap();
        let index = Mutex::new(ChunkIndex::new());
        let dirty = AtomicBool::new(false);
        let reference = index_of(b"AAAABBBBCCCC", 4);

        let stats = compare(
            &reader,
            &index,
            &dirty,
            DigestKind::Sha256,
            &reference,
            None,
            None,
            &Progress::new(),
        )
        .unwrap();

        assert_eq!(stats.matched, 2);
        assert_eq!(stats.mismatched, 1);
        assert_eq!(stats.mismatched_ordinals, vec![1]);
        assert!(dirty.load(Ordering::Relaxed));
    }

    #[test]
    fn test_missing_reference_entry_is_mismatch() {
        let file = fixture(b"AAAABBBB");
        let reader = ChunkReader::open(file.path(), 4).unwrap();
        let index = Mutex::new(ChunkIndex::new());
        let dirty = AtomicBool::new(false);

        // Reference only knows chunk 0
        let mut reference = ChunkIndex::new();
        reference.insert(0, DigestKind::Sha256.compute(b"AAAA"));

        let stats = compare(
            &reader,
            &index,
            &dirty,
            DigestKind::Sha256,
            &reference,
            None,
            None,
            &Progress::new(),
        )
        .unwrap();

        assert_eq!(stats.mismatched_ordinals, vec![1]);
    }

    #[test]
    fn test_chunk_limit_stops_early() {
        let file = fixture(b"XXXXYYYYZZZZ");
        let reader = ChunkReader::open(file.path(), 4).unwrap();
        let index = Mutex::new(ChunkIndex::new());
        let dirty = AtomicBool::new(false);
        let reference = index_of(b"AAAABBBBCCCC", 4);

        let stats = compare(
            &reader,
            &index,
            &dirty,
            DigestKind::Sha256,
            &reference,
            Some(2),
            None,
            &Progress::new(),
        )
        .unwrap();

        assert_eq!(stats.mismatched, 2);
        assert!(stats.limit_reached);
    }

    #[test]
    fn test_zero_mismatches_removes_delta_file() {
        let dir = tempfile::tempdir().unwrap();
        let delta_path = dir.path().join("out.delta");

        let file = fixture(b"AAAABBBBCCCC");
        let reader = ChunkReader::open(file.path(), 4).unwrap();
        let index = Mutex::new(ChunkIndex::new());
        let dirty = AtomicBool::new(false);
        let reference = index_of(b"AAAABBBBCCCC", 4);

        let stat = FileStat::capture(file.path()).unwrap();
        let mut sink =
            FileDeltaSink::create(delta_path.clone(), PatchHeader::new(4, stat)).unwrap();

        let stats = compare(
            &reader,
            &index,
            &dirty,
            DigestKind::Sha256,
            &reference,
            None,
            Some(&mut sink),
            &Progress::new(),
        )
        .unwrap();

        assert!(!stats.has_differences());
        assert!(!delta_path.exists());
    }

    #[test]
    fn test_cached_hashes_are_reused() {
        let file = fixture(b"AAAABBBB");
        let reader = ChunkReader::open(file.path(), 4).unwrap();
        let dirty = AtomicBool::new(false);

        // A fully-populated index means no on-demand hashing and no dirtying
        let index = Mutex::new(index_of(b"AAAABBBB", 4));
        let reference = index_of(b"AAAABBBB", 4);

        let stats = compare(
            &reader,
            &index,
            &dirty,
            DigestKind::Sha256,
            &reference,
            None,
            None,
            &Progress::new(),
        )
        .unwrap();

        assert_eq!(stats.matched, 2);
        assert!(!dirty.load(Ordering::Relaxed));
    }
}
