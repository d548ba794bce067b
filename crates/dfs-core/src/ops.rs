//! Driver-facing VFS semantics.

use dfs_error::Result;
use dfs_ondisk::InodeRecord;
use dfs_types::{FileKind, InodeNumber, S_IPERM};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Inode attributes returned by [`FsOps::getattr`] and [`FsOps::lookup`].
///
/// Analogous to POSIX `struct stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    /// File size in bytes (target length for symlinks).
    pub size: u64,
    /// Number of 512-byte units the logical content spans.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub kind: FileKind,
    /// Permission bits (lower 12 bits of mode).
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// Device id for block and character devices.
    pub rdev: u64,
    /// Preferred I/O size.
    pub blksize: u32,
}

fn epoch_seconds(secs: i64) -> SystemTime {
    let magnitude = Duration::from_secs(secs.unsigned_abs());
    if secs >= 0 {
        UNIX_EPOCH.checked_add(magnitude)
    } else {
        UNIX_EPOCH.checked_sub(magnitude)
    }
    .unwrap_or(UNIX_EPOCH)
}

impl InodeAttr {
    #[must_use]
    pub fn from_record(ino: InodeNumber, record: &InodeRecord, blksize: u32) -> Self {
        Self {
            ino,
            size: record.size,
            blocks: record.size.div_ceil(512),
            atime: epoch_seconds(record.atime),
            mtime: epoch_seconds(record.mtime),
            ctime: epoch_seconds(record.ctime),
            kind: record.kind,
            perm: u16::try_from(record.mode & S_IPERM).unwrap_or(0),
            nlink: record.nlink,
            uid: record.uid,
            gid: record.gid,
            rdev: record.rdev,
            blksize,
        }
    }
}

/// A directory entry returned by [`FsOps::readdir`].
///
/// `offset` is an opaque cookie: passing it back to `readdir` resumes after
/// this entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub offset: u64,
    pub kind: FileKind,
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Whole-image statistics for `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    pub inodes: u64,
    pub blocks: u64,
    /// Largest uncompressed block; reported as the preferred I/O size.
    pub block_size: u32,
    /// Sum of regular file sizes.
    pub file_bytes: u64,
    /// Sum of uncompressed block payloads (after dedup).
    pub unique_bytes: u64,
    /// Sum of block frame lengths on disk.
    pub stored_bytes: u64,
    pub image_bytes: u64,
}

/// Read-only VFS operations consumed by an external driver layer.
///
/// Errors map to POSIX errnos via [`dfs_error::DfsError::to_errno`]. The
/// trait is `Send + Sync` so a driver can call it from many threads.
pub trait FsOps: Send + Sync {
    /// Attributes of `ino`; `NotFound` if it does not exist.
    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr>;

    /// Attributes of the child `name` of directory `parent`.
    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr>;

    /// Entries of directory `ino` after cookie `offset` (0 starts from the
    /// beginning). `.` and `..` come first. An empty batch ends iteration.
    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>>;

    /// Up to `size` bytes of file `ino` from `offset`; fewer at end-of-file.
    fn read(&self, ino: InodeNumber, offset: i64, size: u32) -> Result<Vec<u8>>;

    /// Raw bytes of a symlink target.
    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>>;

    fn statfs(&self) -> Result<StatFs>;
}
