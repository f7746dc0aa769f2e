//! Binary delta streams: frame types, wire codec, sinks, comparison and
//! patch application

pub mod apply;
pub mod compare;
pub mod sink;
pub mod wire;

pub use apply::{apply, ApplyStats};
pub use compare::{compare, CompareOutcome, CompareStats};
pub use sink::{DeltaSink, FileDeltaSink, StreamDeltaSink};

use crate::digest::ChunkHash;
use crate::stat::FileStat;

/// One unit of the wire format
///
/// A frame whose payload is empty terminates the stream; its ordinal and
/// hash fields are ignored by readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaFrame {
    pub ordinal: u64,
    pub hash: ChunkHash,
    /// Whether `payload` is deflate-compressed
    pub compressed: bool,
    pub payload: Vec<u8>,
}

/// Header preceding all frames in a delta stream
///
/// Carries the producing run's configuration so the consumer can refuse a
/// stream it would misinterpret, plus the source file's metadata to apply
/// to the target after patching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchHeader {
    pub format_version: u64,
    pub chunk_size: u64,
    pub hash_len: u64,
    pub stat: FileStat,
}

impl PatchHeader {
    pub fn new(chunk_size: u64, stat: FileStat) -> Self {
        Self {
            format_version: crate::config::FORMAT_VERSION,
            chunk_size,
            hash_len: crate::digest::HASH_LEN as u64,
            stat,
        }
    }
}
