//! Chunked reads of one shared file handle
//!
//! The OS file cursor is not concurrency-safe, so every seek+read pair
//! happens under a single mutex shared by all workers.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

/// Thread-safe reader of fixed-size chunks from one open file
#[derive(Debug)]
pub struct ChunkReader {
    file: Mutex<File>,
    chunk_size: u64,
    file_size: u64,
}

impl ChunkReader {
    /// Open `path` for chunked reading
    pub fn open(path: &Path, chunk_size: u64) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io("opening input file", e))?;
        let file_size = file
            .metadata()
            .map_err(|e| Error::io("reading input metadata", e))?
            .len();
        Ok(Self {
            file: Mutex::new(file),
            chunk_size,
            file_size,
        })
    }

    /// Chunk size this reader was opened with
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Size of the underlying file when it was opened
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Number of chunks covering the file (the last may be short)
    pub fn chunk_count(&self) -> u64 {
        self.file_size.div_ceil(self.chunk_size)
    }

    /// Byte length of the chunk at `ordinal`, clipped at end of file
    pub fn chunk_len(&self, ordinal: u64) -> u64 {
        let start = ordinal * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);
        end.saturating_sub(start)
    }

    /// Read the chunk at `ordinal`
    ///
    /// A short read anywhere but the clipped final chunk means the file
    /// shrank under us and is reported as an I/O error.
    pub fn read_chunk(&self, ordinal: u64) -> Result<Vec<u8>> {
        let want = self.chunk_len(ordinal) as usize;
        if want == 0 {
            return Err(Error::io(
                format!("chunk {} is beyond end of file", ordinal),
                std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            ));
        }

        let mut buf = vec![0u8; want];
        let mut file = self.file.lock().expect("file handle lock poisoned");
        file.seek(SeekFrom::Start(ordinal * self.chunk_size))
            .map_err(|e| Error::io(format!("seeking to chunk {}", ordinal), e))?;
        file.read_exact(&mut buf)
            .map_err(|e| Error::io(format!("reading chunk {}", ordinal), e))?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_chunk_count_and_lengths() {
        let file = fixture(b"AAAABBBBCC");
        let reader = ChunkReader::open(file.path(), 4).unwrap();

        assert_eq!(reader.chunk_count(), 3);
        assert_eq!(reader.chunk_len(0), 4);
        assert_eq!(reader.chunk_len(2), 2);
    }

    #[test]
    fn test_read_chunks() {
        let file = fixture(b"AAAABBBBCC");
        let reader = ChunkReader::open(file.path(), 4).unwrap();

        assert_eq!(reader.read_chunk(0).unwrap(), b"AAAA");
        assert_eq!(reader.read_chunk(1).unwrap(), b"BBBB");
        assert_eq!(reader.read_chunk(2).unwrap(), b"CC");
    }

    #[test]
    fn test_read_past_end_is_error() {
        let file = fixture(b"AAAA");
        let reader = ChunkReader::open(file.path(), 4).unwrap();
        assert!(reader.read_chunk(1).is_err());
    }

    #[test]
    fn test_concurrent_reads_are_consistent() {
        use std::sync::Arc;

        let file = fixture(&vec![7u8; 4096]);
        let reader = Arc::new(ChunkReader::open(file.path(), 512).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reader = Arc::clone(&reader);
                std::thread::spawn(move || {
                    for ordinal in 0..reader.chunk_count() {
                        let chunk = reader.read_chunk(ordinal).unwrap();
                        assert!(chunk.iter().all(|&b| b == 7));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }
}
