//! Patch application
//!
//! Consumes a framed delta stream against a target file. Every frame's
//! payload is verified against its declared hash before any byte reaches
//! the target; writing unverified bytes risks silent corruption.

use super::wire;
use crate::config::FORMAT_VERSION;
use crate::digest::{DigestKind, HASH_LEN};
use crate::error::{Error, Result};
use crate::store::ChunkIndex;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Result of one patch run
#[derive(Debug, Clone, Default)]
pub struct ApplyStats {
    /// Frames consumed, terminal excluded
    pub frames: u64,
    /// Chunks actually written
    pub written: u64,
    /// Chunks skipped because the target already had the declared hash
    pub skipped: u64,
    pub bytes_written: u64,
}

/// Apply a delta stream to `target_path`
///
/// The header is validated before anything else; a format-version or
/// chunk-size mismatch between producer and consumer never proceeds to
/// writing. Each frame is decompressed, verified, and only then written at
/// its chunk offset. Frames whose hash the target's index already records
/// are skipped, so replaying a stream is a no-op. After the terminal
/// frame the source file's stat is applied: truncate, ownership, times.
pub fn apply<R: Read>(
    mut stream: R,
    target_path: &Path,
    index: &Mutex<ChunkIndex>,
    dirty: &AtomicBool,
    digest: DigestKind,
    expected_chunk_size: u64,
) -> Result<ApplyStats> {
    let header = wire::read_header(&mut stream)?;

    if header.format_version != FORMAT_VERSION {
        return Err(Error::config(format!(
            "delta stream format version {} does not match {}",
            header.format_version, FORMAT_VERSION
        )));
    }
    if header.chunk_size != expected_chunk_size {
        return Err(Error::config(format!(
            "delta stream chunk size {} does not match {}",
            header.chunk_size, expected_chunk_size
        )));
    }
    if header.hash_len != HASH_LEN as u64 {
        return Err(Error::config(format!(
            "delta stream hash length {} does not match {}",
            header.hash_len, HASH_LEN
        )));
    }

    let mut target = OpenOptions::new()
        .read(true)
        .write(true)
        .open(target_path)
        .map_err(|e| Error::io("opening patch target", e))?;

    let mut stats = ApplyStats::default();

    while let Some(frame) = wire::read_frame(&mut stream, header.hash_len)? {
        stats.frames += 1;

        let payload = if frame.compressed {
            wire::decompress_payload(&frame.payload)?
        } else {
            frame.payload
        };

        // Verify before any write for this frame
        let actual = digest.compute(&payload);
        if actual != frame.hash {
            return Err(Error::Integrity {
                ordinal: frame.ordinal,
                expected: frame.hash.to_hex(),
                actual: actual.to_hex(),
            });
        }

        let known = index
            .lock()
            .expect("chunk index lock poisoned")
            .get(frame.ordinal)
            .copied();
        if known == Some(frame.hash) {
            stats.skipped += 1;
            tracing::debug!(ordinal = frame.ordinal, "chunk already current, skipping");
            continue;
        }

        target
            .seek(SeekFrom::Start(frame.ordinal * header.chunk_size))
            .map_err(|e| Error::io(format!("seeking to chunk {}", frame.ordinal), e))?;
        target
            .write_all(&payload)
            .map_err(|e| Error::io(format!("writing chunk {}", frame.ordinal), e))?;

        // The index is updated only after the write returned, so an
        // interruption mid-frame loses the chunk but never poisons the index
        index
            .lock()
            .expect("chunk index lock poisoned")
            .insert(frame.ordinal, frame.hash);
        dirty.store(true, Ordering::Relaxed);

        stats.written += 1;
        stats.bytes_written += payload.len() as u64;
        tracing::debug!(ordinal = frame.ordinal, bytes = payload.len(), "chunk patched");
    }

    header.stat.apply(&target, target_path)?;

    tracing::info!(
        written = stats.written,
        skipped = stats.skipped,
        "patch applied"
    );
    Ok(stats)
}
