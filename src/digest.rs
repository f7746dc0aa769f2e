//! Chunk digest algorithms and the fixed-width content hash

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length in bytes of every chunk digest
pub const HASH_LEN: usize = 32;

/// Content hash of exactly one chunk
///
/// The canonical external representation is lowercase hex; serde uses it so
/// persisted indexes stay readable by external tooling.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHash([u8; HASH_LEN]);

impl ChunkHash {
    /// Wrap raw digest bytes
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw digest bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a lowercase hex rendering
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", self.to_hex())
    }
}

impl Serialize for ChunkHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| D::Error::custom("expected a 64-char hex chunk hash"))
    }
}

/// Supported digest algorithms
///
/// A closed enumeration dispatched through [`DigestKind::compute`]; selected
/// once at construction time, never looked up by name at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestKind {
    /// SHA-256, the default
    Sha256,
    /// BLAKE3, faster on wide machines
    Blake3,
}

impl Default for DigestKind {
    fn default() -> Self {
        DigestKind::Sha256
    }
}

impl DigestKind {
    /// Compute the digest of one chunk's bytes
    pub fn compute(&self, data: &[u8]) -> ChunkHash {
        match self {
            DigestKind::Sha256 => ChunkHash(Sha256::digest(data).into()),
            DigestKind::Blake3 => ChunkHash(*blake3::hash(data).as_bytes()),
        }
    }

    /// Name used in configuration and CLI flags
    pub fn name(&self) -> &'static str {
        match self {
            DigestKind::Sha256 => "sha256",
            DigestKind::Blake3 => "blake3",
        }
    }
}

impl fmt::Display for DigestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "sha256" => Ok(DigestKind::Sha256),
            "blake3" => Ok(DigestKind::Blake3),
            other => Err(crate::Error::config(format!(
                "unknown digest method: {}",
                other
            ))),
        }
    }
}
