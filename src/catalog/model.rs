//! The relational catalog's row types.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;

use crate::compress::CompressMethod;
use crate::hashing::Fingerprint;

pub type BackupId = i64;

/// An immutable, content-addressed stored file body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub fingerprint: Fingerprint,
    pub compress_method: CompressMethod,
    pub raw_size: u64,
    pub stored_size: u64,
}

/// What kind of filesystem entry a [`File`] row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileRole {
    Regular,
    Directory,
    Symlink,
}

impl FileRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileRole::Regular => "regular",
            FileRole::Directory => "directory",
            FileRole::Symlink => "symlink",
        }
    }
}

impl std::str::FromStr for FileRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "regular" => FileRole::Regular,
            "directory" => FileRole::Directory,
            "symlink" => FileRole::Symlink,
            other => anyhow::bail!("unknown file role {other}"),
        })
    }
}

/// A File row: one snapshot-relative path within one [`Backup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub id: i64,
    pub backup_id: BackupId,
    /// Snapshot-relative, POSIX-form path.
    pub path: Utf8PathBuf,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Truncated from nanoseconds by integer division by 1000.
    pub mtime_us: i64,
    /// Size of the *source* entry at scan time (0 for directories). For
    /// regular files this equals the referenced blob's `raw_size`; kept
    /// alongside so `ReuseKey` can be built without a blob join.
    pub size: u64,
    /// For symlinks: the target, as UTF-8 bytes.
    pub content: Option<Vec<u8>>,
    pub blob_fingerprint: Option<Fingerprint>,
    pub role: FileRole,
}

/// `(path, size, mode, uid, gid, mtime_µs)` — the key the Reuse Detector
/// compares between two runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReuseKey {
    pub path: Utf8PathBuf,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_us: i64,
}

impl File {
    /// Builds this file's `ReuseKey`, if it's a regular file — only regular
    /// files participate in stat-based reuse.
    pub fn reuse_key(&self) -> Option<ReuseKey> {
        if self.role != FileRole::Regular {
            return None;
        }
        Some(ReuseKey {
            path: self.path.clone(),
            size: self.size,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            mtime_us: self.mtime_us,
        })
    }
}

/// A Backup row: one completed (or in-progress) snapshot run.
#[derive(Debug, Clone)]
pub struct Backup {
    pub id: BackupId,
    pub timestamp: jiff::Zoned,
    pub creator: String,
    pub comment: String,
    pub targets: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

/// What `run()` hands back to its caller.
#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub id: BackupId,
    pub timestamp: jiff::Zoned,
    pub file_count: usize,
    pub tags: BTreeMap<String, String>,
    pub raw_bytes: u64,
    pub stored_bytes: u64,
}
