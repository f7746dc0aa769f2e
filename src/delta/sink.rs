//! Delta sinks
//!
//! A sink receives mismatched chunks and produces the framed stream,
//! either into a local delta file or onto an outbound byte stream. Both
//! speak the same wire format.

use super::wire;
use super::{DeltaFrame, PatchHeader};
use crate::digest::ChunkHash;
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Destination for mismatched chunks during a comparison run
pub trait DeltaSink {
    /// Frame and emit one mismatched chunk
    fn send_chunk(&mut self, ordinal: u64, hash: &ChunkHash, payload: &[u8]) -> Result<()>;

    /// Terminate the stream; returns true when any chunk was emitted
    fn finish(&mut self) -> Result<bool>;
}

fn build_frame(ordinal: u64, hash: &ChunkHash, payload: &[u8]) -> Result<DeltaFrame> {
    let (compressed, payload) = wire::compress_payload(payload)?;
    Ok(DeltaFrame {
        ordinal,
        hash: *hash,
        compressed,
        payload,
    })
}

/// Sink writing a local delta file
///
/// The file is created up front; the header goes out with the first frame.
/// A run that produced no mismatches deletes the file on finish instead of
/// leaving an empty, invalid artifact.
pub struct FileDeltaSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    header: PatchHeader,
    frames: u64,
}

impl FileDeltaSink {
    pub fn create(path: PathBuf, header: PatchHeader) -> Result<Self> {
        let file = File::create(&path).map_err(|e| Error::io("creating delta file", e))?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            header,
            frames: 0,
        })
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| Error::format("delta sink already finished"))
    }
}

impl DeltaSink for FileDeltaSink {
    fn send_chunk(&mut self, ordinal: u64, hash: &ChunkHash, payload: &[u8]) -> Result<()> {
        let frame = build_frame(ordinal, hash, payload)?;
        let first = self.frames == 0;
        let header = self.header.clone();
        let writer = self.writer()?;
        if first {
            wire::write_header(writer, &header)?;
        }
        wire::write_frame(writer, &frame)?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<bool> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(self.frames > 0);
        };

        if self.frames == 0 {
            drop(writer);
            std::fs::remove_file(&self.path)
                .map_err(|e| Error::io("removing empty delta file", e))?;
            tracing::debug!(path = ?self.path, "no mismatches, removed speculative delta file");
            return Ok(false);
        }

        wire::write_terminal(&mut writer)?;
        writer
            .flush()
            .map_err(|e| Error::io("flushing delta file", e))?;
        tracing::debug!(path = ?self.path, frames = self.frames, "delta file complete");
        Ok(true)
    }
}

impl Drop for FileDeltaSink {
    fn drop(&mut self) {
        // An unfinished sink left a speculative file behind; callers that
        // errored out mid-run still get the cleanup.
        if self.writer.take().is_some() && self.frames == 0 {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Sink writing frames onto an outbound byte stream
///
/// Clonable so concurrent producers can share one stream. The header
/// section is guarded by the writer mutex: exactly one sender emits it,
/// and a concurrent send blocks until the in-progress header write
/// completes.
pub struct StreamDeltaSink<W: Write> {
    inner: Arc<Mutex<StreamInner<W>>>,
    header: PatchHeader,
}

struct StreamInner<W: Write> {
    writer: W,
    header_sent: bool,
    frames: u64,
}

impl<W: Write> StreamDeltaSink<W> {
    pub fn new(writer: W, header: PatchHeader) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StreamInner {
                writer,
                header_sent: false,
                frames: 0,
            })),
            header,
        }
    }

    /// Recover the underlying writer
    ///
    /// Panics when clones of this sink are still alive.
    pub fn into_writer(self) -> W {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => mutex.into_inner().expect("stream sink lock poisoned").writer,
            Err(_) => panic!("stream sink still has live clones"),
        }
    }
}

impl<W: Write> Clone for StreamDeltaSink<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            header: self.header.clone(),
        }
    }
}

impl<W: Write> DeltaSink for StreamDeltaSink<W> {
    fn send_chunk(&mut self, ordinal: u64, hash: &ChunkHash, payload: &[u8]) -> Result<()> {
        let frame = build_frame(ordinal, hash, payload)?;
        let mut inner = self.inner.lock().expect("stream sink lock poisoned");
        if !inner.header_sent {
            wire::write_header(&mut inner.writer, &self.header)?;
            inner.header_sent = true;
        }
        wire::write_frame(&mut inner.writer, &frame)?;
        inner.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<bool> {
        let mut inner = self.inner.lock().expect("stream sink lock poisoned");
        // A peer still expects a well-formed stream when nothing differed
        if !inner.header_sent {
            wire::write_header(&mut inner.writer, &self.header)?;
            inner.header_sent = true;
        }
        wire::write_terminal(&mut inner.writer)?;
        inner
            .writer
            .flush()
            .map_err(|e| Error::io("flushing delta stream", e))?;
        Ok(inner.frames > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DigestKind;
    use crate::stat::FileStat;

    fn header() -> PatchHeader {
        PatchHeader::new(4096, FileStat {
            size: 0,
            mtime_secs: 0,
            mtime_nanos: 0,
            atime_secs: 0,
            atime_nanos: 0,
            uid: 0,
            gid: 0,
        })
    }

    #[test]
    fn test_file_sink_removed_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.delta");

        let mut sink = FileDeltaSink::create(path.clone(), header()).unwrap();
        assert!(path.exists());
        assert!(!sink.finish().unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_file_sink_writes_header_and_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.delta");

        let hash = DigestKind::Sha256.compute(b"ZZZZ");
        let mut sink = FileDeltaSink::create(path.clone(), header()).unwrap();
        sink.send_chunk(1, &hash, b"ZZZZ").unwrap();
        assert!(sink.finish().unwrap());

        let data = std::fs::read(&path).unwrap();
        let mut reader = data.as_slice();
        let parsed = wire::read_header(&mut reader).unwrap();
        assert_eq!(parsed.chunk_size, 4096);

        let frame = wire::read_frame(&mut reader, 32).unwrap().unwrap();
        assert_eq!(frame.ordinal, 1);
        assert!(wire::read_frame(&mut reader, 32).unwrap().is_none());
    }

    #[test]
    fn test_stream_sink_header_sent_once() {
        let mut sink = StreamDeltaSink::new(Vec::new(), header());
        let mut clone = sink.clone();

        let hash = DigestKind::Sha256.compute(b"AAAA");
        sink.send_chunk(0, &hash, b"AAAA").unwrap();
        clone.send_chunk(1, &hash, b"AAAA").unwrap();
        assert!(sink.finish().unwrap());

        drop(clone);
        let buf = sink.into_writer();

        let mut reader = buf.as_slice();
        wire::read_header(&mut reader).unwrap();
        assert!(wire::read_frame(&mut reader, 32).unwrap().is_some());
        assert!(wire::read_frame(&mut reader, 32).unwrap().is_some());
        assert!(wire::read_frame(&mut reader, 32).unwrap().is_none());
    }

    #[test]
    fn test_stream_sink_empty_run_still_well_formed() {
        let mut sink = StreamDeltaSink::new(Vec::new(), header());
        assert!(!sink.finish().unwrap());

        let buf = sink.into_writer();
        let mut reader = buf.as_slice();
        wire::read_header(&mut reader).unwrap();
        assert!(wire::read_frame(&mut reader, 32).unwrap().is_none());
    }
}
