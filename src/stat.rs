//! Portable file-metadata snapshots
//!
//! A `FileStat` is captured when a hashing run starts or a delta is
//! produced and reapplied verbatim to the patch target after the last
//! frame. It is an explicit, versioned-schema struct, never a raw OS stat.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

/// Snapshot of the filesystem metadata needed to reproduce source-file
/// state on a patch target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// File size in bytes
    pub size: u64,
    /// Modification time, seconds since the Unix epoch
    pub mtime_secs: i64,
    /// Modification time, nanosecond remainder
    pub mtime_nanos: u32,
    /// Access time, seconds since the Unix epoch
    pub atime_secs: i64,
    /// Access time, nanosecond remainder
    pub atime_nanos: u32,
    /// Owning user id (0 where the platform has none)
    pub uid: u32,
    /// Owning group id (0 where the platform has none)
    pub gid: u32,
}

impl FileStat {
    /// Capture a snapshot of the file at `path`
    #[cfg(unix)]
    pub fn capture(path: &Path) -> Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let meta =
            std::fs::metadata(path).map_err(|e| Error::io("reading file metadata", e))?;
        Ok(Self {
            size: meta.len(),
            mtime_secs: meta.mtime(),
            mtime_nanos: meta.mtime_nsec() as u32,
            atime_secs: meta.atime(),
            atime_nanos: meta.atime_nsec() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
        })
    }

    /// Capture a snapshot of the file at `path`
    #[cfg(not(unix))]
    pub fn capture(path: &Path) -> Result<Self> {
        use std::time::UNIX_EPOCH;

        let meta =
            std::fs::metadata(path).map_err(|e| Error::io("reading file metadata", e))?;
        let split = |t: std::io::Result<std::time::SystemTime>| {
            t.ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| (d.as_secs() as i64, d.subsec_nanos()))
                .unwrap_or((0, 0))
        };
        let (mtime_secs, mtime_nanos) = split(meta.modified());
        let (atime_secs, atime_nanos) = split(meta.accessed());
        Ok(Self {
            size: meta.len(),
            mtime_secs,
            mtime_nanos,
            atime_secs,
            atime_nanos,
            uid: 0,
            gid: 0,
        })
    }

    /// Apply this snapshot to the patch target: truncate to the recorded
    /// size, then set ownership and access/modification timestamps.
    ///
    /// Ownership is best-effort (an unprivileged consumer cannot chown);
    /// truncation and timestamps are strict.
    pub fn apply(&self, file: &File, path: &Path) -> Result<()> {
        file.set_len(self.size)
            .map_err(|e| Error::io("truncating patch target", e))?;
        file.sync_all()
            .map_err(|e| Error::io("flushing patch target", e))?;

        self.apply_ownership(path);

        let atime = filetime::FileTime::from_unix_time(self.atime_secs, self.atime_nanos);
        let mtime = filetime::FileTime::from_unix_time(self.mtime_secs, self.mtime_nanos);
        filetime::set_file_times(path, atime, mtime)
            .map_err(|e| Error::io("setting file times", e))?;

        Ok(())
    }

    #[cfg(unix)]
    fn apply_ownership(&self, path: &Path) {
        use nix::unistd::{chown, Gid, Uid};

        if let Err(err) = chown(
            path,
            Some(Uid::from_raw(self.uid)),
            Some(Gid::from_raw(self.gid)),
        ) {
            tracing::warn!(path = ?path, uid = self.uid, gid = self.gid, %err,
                "could not apply ownership");
        }
    }

    #[cfg(not(unix))]
    fn apply_ownership(&self, _path: &Path) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_capture_reads_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"twelve bytes").unwrap();
        file.flush().unwrap();

        let stat = FileStat::capture(file.path()).unwrap();
        assert_eq!(stat.size, 12);
    }

    #[test]
    fn test_apply_truncates_and_restores_times() {
        let mut src = tempfile::NamedTempFile::new().unwrap();
        src.write_all(b"source").unwrap();
        src.flush().unwrap();
        let stat = FileStat::capture(src.path()).unwrap();

        let mut target = tempfile::NamedTempFile::new().unwrap();
        target.write_all(b"target with trailing garbage").unwrap();
        target.flush().unwrap();

        stat.apply(target.as_file(), target.path()).unwrap();

        let applied = FileStat::capture(target.path()).unwrap();
        assert_eq!(applied.size, stat.size);
        assert_eq!(applied.mtime_secs, stat.mtime_secs);
    }

    #[test]
    fn test_serde_roundtrip() {
        let stat = FileStat {
            size: 42,
            mtime_secs: 1700000000,
            mtime_nanos: 123,
            atime_secs: 1700000001,
            atime_nanos: 456,
            uid: 1000,
            gid: 1000,
        };
        let json = serde_json::to_vec(&stat).unwrap();
        let back: FileStat = serde_json::from_slice(&json).unwrap();
        assert_eq!(stat, back);
    }
}
