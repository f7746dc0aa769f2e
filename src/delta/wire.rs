//! Wire codec for delta streams
//!
//! All integer fields are big-endian and fixed-width. The layout is
//! normative; both sinks and the patch applier speak exactly these bytes.
//!
//! Header: `u64 reserved(=0)`, `u64 format_version`, `u64 chunk_size`,
//! `u64 hash_len`, `u64 stat_len`, then `stat_len` bytes of JSON FileStat.
//!
//! Frame: `u64 ordinal`, `hash_len` hash bytes, `u8 compressed`,
//! `u64 payload_len`, then the payload. A zero `payload_len` ends the
//! stream.

use super::{DeltaFrame, PatchHeader};
use crate::digest::{ChunkHash, HASH_LEN};
use crate::error::{Error, Result};
use crate::stat::FileStat;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Write the stream header
pub fn write_header<W: Write>(writer: &mut W, header: &PatchHeader) -> Result<()> {
    let stat_blob = serde_json::to_vec(&header.stat)
        .map_err(|e| Error::format(format!("serializing file stat: {}", e)))?;

    writer
        .write_all(&0u64.to_be_bytes())
        .map_err(|e| Error::io("writing delta header", e))?;
    writer
        .write_all(&header.format_version.to_be_bytes())
        .map_err(|e| Error::io("writing delta header", e))?;
    writer
        .write_all(&header.chunk_size.to_be_bytes())
        .map_err(|e| Error::io("writing delta header", e))?;
    writer
        .write_all(&header.hash_len.to_be_bytes())
        .map_err(|e| Error::io("writing delta header", e))?;
    writer
        .write_all(&(stat_blob.len() as u64).to_be_bytes())
        .map_err(|e| Error::io("writing delta header", e))?;
    writer
        .write_all(&stat_blob)
        .map_err(|e| Error::io("writing delta header", e))?;
    Ok(())
}

/// Read and validate the stream header
pub fn read_header<R: Read>(reader: &mut R) -> Result<PatchHeader> {
    let reserved = read_u64(reader, "delta header")?;
    if reserved != 0 {
        return Err(Error::format(format!(
            "unexpected reserved field {} in delta header",
            reserved
        )));
    }

    let format_version = read_u64(reader, "delta header")?;
    let chunk_size = read_u64(reader, "delta header")?;
    let hash_len = read_u64(reader, "delta header")?;
    let stat_len = read_u64(reader, "delta header")?;

    let mut stat_blob = vec![0u8; stat_len as usize];
    reader
        .read_exact(&mut stat_blob)
        .map_err(|e| Error::io("reading stat blob", e))?;
    let stat: FileStat = serde_json::from_slice(&stat_blob)
        .map_err(|e| Error::format(format!("decoding stat blob: {}", e)))?;

    Ok(PatchHeader {
        format_version,
        chunk_size,
        hash_len,
        stat,
    })
}

/// Write one frame
pub fn write_frame<W: Write>(writer: &mut W, frame: &DeltaFrame) -> Result<()> {
    writer
        .write_all(&frame.ordinal.to_be_bytes())
        .map_err(|e| Error::io("writing delta frame", e))?;
    writer
        .write_all(frame.hash.as_bytes())
        .map_err(|e| Error::io("writing delta frame", e))?;
    writer
        .write_all(&[u8::from(frame.compressed)])
        .map_err(|e| Error::io("writing delta frame", e))?;
    writer
        .write_all(&(frame.payload.len() as u64).to_be_bytes())
        .map_err(|e| Error::io("writing delta frame", e))?;
    writer
        .write_all(&frame.payload)
        .map_err(|e| Error::io("writing delta frame", e))?;
    Ok(())
}

/// Write the end-of-stream marker
pub fn write_terminal<W: Write>(writer: &mut W) -> Result<()> {
    let terminal = DeltaFrame {
        ordinal: 0,
        hash: ChunkHash::from_bytes([0u8; HASH_LEN]),
        compressed: false,
        payload: Vec::new(),
    };
    write_frame(writer, &terminal)
}

/// Read the next frame, or `None` at the end-of-stream marker
pub fn read_frame<R: Read>(reader: &mut R, hash_len: u64) -> Result<Option<DeltaFrame>> {
    if hash_len != HASH_LEN as u64 {
        return Err(Error::format(format!(
            "unsupported hash length {} in delta stream",
            hash_len
        )));
    }

    let ordinal = read_u64(reader, "delta frame")?;

    let mut hash_bytes = [0u8; HASH_LEN];
    reader
        .read_exact(&mut hash_bytes)
        .map_err(|e| Error::io("reading frame hash", e))?;

    let mut flag = [0u8; 1];
    reader
        .read_exact(&mut flag)
        .map_err(|e| Error::io("reading compression flag", e))?;
    let compressed = match flag[0] {
        0 => false,
        1 => true,
        other => {
            return Err(Error::format(format!(
                "invalid compression flag {} in delta frame",
                other
            )))
        }
    };

    let payload_len = read_u64(reader, "delta frame")?;
    if payload_len == 0 {
        return Ok(None);
    }

    let mut payload = vec![0u8; payload_len as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|e| Error::io("reading frame payload", e))?;

    Ok(Some(DeltaFrame {
        ordinal,
        hash: ChunkHash::from_bytes(hash_bytes),
        compressed,
        payload,
    }))
}

/// Deflate a payload, keeping the compressed form only when it is
/// strictly smaller than the raw bytes
pub fn compress_payload(raw: &[u8]) -> Result<(bool, Vec<u8>)> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(raw.len()), Compression::default());
    encoder
        .write_all(raw)
        .map_err(|e| Error::io("compressing payload", e))?;
    let compressed = encoder
        .finish()
        .map_err(|e| Error::io("compressing payload", e))?;

    if compressed.len() < raw.len() {
        Ok((true, compressed))
    } else {
        Ok((false, raw.to_vec()))
    }
}

/// Inflate a compressed payload
pub fn decompress_payload(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::io("decompressing payload", e))?;
    Ok(out)
}

fn read_u64<R: Read>(reader: &mut R, what: &str) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|e| Error::io(format!("reading {}", what), e))?;
    Ok(u64::from_be_bytes(buf))
}
