#![forbid(unsafe_code)]
//! Error types for DenseFS.
//!
//! # Error Taxonomy
//!
//! DenseFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `dfs-types` | Byte-level format violations in headers, frames and metadata |
//! | Runtime | `DfsError` | `dfs-error` (this crate) | Typed results for the read path, the builder and driver consumers |
//!
//! `dfs-error` is independent of `dfs-types`; `ParseError` is converted at the
//! mount boundary (`dfs-meta`, `dfs-core`) into `Format` when the image is
//! structurally wrong and into `CorruptMetadata` when a parsed table is
//! inconsistent.
//!
//! ## Propagation Policy
//!
//! The core never logs-and-swallows. Every failure travels back to the caller
//! as a `DfsError`, which decides whether to retry, surface or abort. Only
//! [`DfsError::is_transient`] I/O errors are retried, once, by the block layer.
//!
//! ## Driver errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`DfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `CorruptBlock`, `CorruptMetadata`, `CollisionIntegrity` | `EIO` |
//! | `Format`, `InvalidRange`, `InvalidConfig`, `InvalidPath`, `NotSymlink`, `NotRegularFile` | `EINVAL` |
//! | `UnsupportedVersion` | `EOPNOTSUPP` |
//! | `Loop` | `ELOOP` |
//! | `ResourceExhausted` | `ENOMEM` |
//! | `Timeout` | `ETIMEDOUT` |
//! | `Cancelled` | `EINTR` |
//! | `NotFound` | `ENOENT` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `Exists` | `EEXIST` |

use std::io;
use thiserror::Error;

/// Unified error type for all DenseFS operations.
#[derive(Debug, Error)]
pub enum DfsError {
    /// Underlying storage access failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Checksum mismatch or codec failure while materialising a block.
    ///
    /// Always fatal to the request. The cache never stores a block that
    /// failed verification, so other blocks stay usable.
    #[error("corrupt block {block}: {detail}")]
    CorruptBlock { block: u32, detail: String },

    /// The metadata section parsed but its tables are inconsistent.
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),

    /// The image is not a DenseFS image or its framing is malformed.
    #[error("invalid image format: {0}")]
    Format(String),

    /// The image was written by an incompatible format revision.
    #[error("unsupported image version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    /// Malformed read arguments.
    #[error("invalid range: offset={offset} length={length}")]
    InvalidRange { offset: i64, length: i64 },

    /// Symlink resolution exceeded the hop limit.
    #[error("too many levels of symbolic links resolving {path} ({hops} hops)")]
    Loop { path: String, hops: u32 },

    /// A budget-bounded allocation could not be satisfied even after eviction.
    #[error("resource exhausted: requested {requested} bytes with budget {budget}")]
    ResourceExhausted { requested: u64, budget: u64 },

    /// Two chunks share a fingerprint but differ byte-wise.
    #[error("fingerprint collision on {fingerprint}: {detail}")]
    CollisionIntegrity { fingerprint: String, detail: String },

    /// A block load did not complete within the configured I/O timeout.
    #[error("timed out after {waited_ms} ms waiting for block {block}")]
    Timeout { block: u32, waited_ms: u64 },

    /// Operation aborted (build cancelled after a fatal error, or shutdown).
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Path component or inode not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path component or the target is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Content operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// `readlink` on something that is not a symlink.
    #[error("not a symbolic link")]
    NotSymlink,

    /// Chunk lookup on an inode without content.
    #[error("not a regular file")]
    NotRegularFile,

    /// Builder: the path was already added.
    #[error("already exists: {0}")]
    Exists(String),

    /// Builder: path is empty, absolute-escaping or has an invalid component.
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl DfsError {
    /// Convert this error into a POSIX errno for the driver layer.
    ///
    /// The mapping is exhaustive: every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::CorruptBlock { .. } | Self::CorruptMetadata(_) | Self::CollisionIntegrity { .. } => {
                libc::EIO
            }
            Self::Format(_)
            | Self::InvalidRange { .. }
            | Self::InvalidConfig(_)
            | Self::InvalidPath(_)
            | Self::NotSymlink
            | Self::NotRegularFile => libc::EINVAL,
            Self::UnsupportedVersion { .. } => libc::EOPNOTSUPP,
            Self::Loop { .. } => libc::ELOOP,
            Self::ResourceExhausted { .. } => libc::ENOMEM,
            Self::Timeout { .. } => libc::ETIMEDOUT,
            Self::Cancelled => libc::EINTR,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::Exists(_) => libc::EEXIST,
        }
    }

    /// Whether a single retry may succeed (interrupted or would-block I/O).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// I/O errors are not `Clone`; they are re-materialised from kind and message
/// so a coalesced failure can be delivered to every waiter.
impl Clone for DfsError {
    fn clone(&self) -> Self {
        match self {
            Self::Io(err) => match err.raw_os_error() {
                Some(code) => Self::Io(io::Error::from_raw_os_error(code)),
                None => Self::Io(io::Error::new(err.kind(), err.to_string())),
            },
            Self::CorruptBlock { block, detail } => Self::CorruptBlock {
                block: *block,
                detail: detail.clone(),
            },
            Self::CorruptMetadata(s) => Self::CorruptMetadata(s.clone()),
            Self::Format(s) => Self::Format(s.clone()),
            Self::UnsupportedVersion { major, minor } => Self::UnsupportedVersion {
                major: *major,
                minor: *minor,
            },
            Self::InvalidRange { offset, length } => Self::InvalidRange {
                offset: *offset,
                length: *length,
            },
            Self::Loop { path, hops } => Self::Loop {
                path: path.clone(),
                hops: *hops,
            },
            Self::ResourceExhausted { requested, budget } => Self::ResourceExhausted {
                requested: *requested,
                budget: *budget,
            },
            Self::CollisionIntegrity {
                fingerprint,
                detail,
            } => Self::CollisionIntegrity {
                fingerprint: fingerprint.clone(),
                detail: detail.clone(),
            },
            Self::Timeout { block, waited_ms } => Self::Timeout {
                block: *block,
                waited_ms: *waited_ms,
            },
            Self::Cancelled => Self::Cancelled,
            Self::InvalidConfig(s) => Self::InvalidConfig(s.clone()),
            Self::NotFound(s) => Self::NotFound(s.clone()),
            Self::NotDirectory => Self::NotDirectory,
            Self::IsDirectory => Self::IsDirectory,
            Self::NotSymlink => Self::NotSymlink,
            Self::NotRegularFile => Self::NotRegularFile,
            Self::Exists(s) => Self::Exists(s.clone()),
            Self::InvalidPath(s) => Self::InvalidPath(s.clone()),
        }
    }
}

/// Result alias using `DfsError`.
pub type Result<T> = std::result::Result<T, DfsError>;
