#![forbid(unsafe_code)]
//! Shared vocabulary types for DenseFS.
//!
//! Id newtypes, the [`Chunk`] reference, [`FileKind`], POSIX mode bits and the
//! byte-level [`ParseError`] with its bounds-checked little-endian readers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Magic value at offset 0 of every image.
pub const IMAGE_MAGIC: [u8; 8] = *b"DENSEFS\0";
/// Image header length in bytes.
pub const IMAGE_HEADER_SIZE: usize = 64;
pub const FORMAT_VERSION_MAJOR: u16 = 1;
pub const FORMAT_VERSION_MINOR: u16 = 0;

/// Magic value opening the metadata section.
pub const METADATA_MAGIC: [u8; 4] = *b"DFSM";
pub const METADATA_VERSION: u16 = 1;

/// Length of the `[algorithm][usize][csize][checksum]` frame header.
pub const FRAME_HEADER_SIZE: usize = 13;

/// Smallest and largest accepted block sizes.
pub const MIN_BLOCK_SIZE: u32 = 4096;
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024 * 1024;

/// Maximum number of symlinks followed during a single path resolution.
pub const MAX_SYMLINK_HOPS: u32 = 40;

/// Sequential id of a sealed block (index into the block index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Inode number. The root directory is always inode 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    pub const ROOT: Self = Self(0);

    /// Narrow to a table index, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_index(self) -> Result<usize, ParseError> {
        u64_to_usize(self.0, "inode_number")
    }
}

impl BlockId {
    /// Table index of this block.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `(block, offset, length)` reference into a block's uncompressed payload.
///
/// Concatenating a file's chunks in order reproduces its content. Several
/// inodes may share the same triple; chunks are never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    pub block: BlockId,
    pub offset: u32,
    pub length: u32,
}

impl Chunk {
    #[must_use]
    pub fn new(block: BlockId, offset: u32, length: u32) -> Self {
        Self {
            block,
            offset,
            length,
        }
    }

    /// Exclusive end offset within the block, `None` on overflow.
    #[must_use]
    pub fn end(self) -> Option<u32> {
        self.offset.checked_add(self.length)
    }
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u32 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u32 = 0o010_000;
/// Character device.
pub const S_IFCHR: u32 = 0o020_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Block device.
pub const S_IFBLK: u32 = 0o060_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u32 = 0o140_000;

/// Permission bits (including setuid/setgid/sticky).
pub const S_IPERM: u32 = 0o7777;

/// Filesystem object type stored in each inode record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Directory,
    RegularFile,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// On-disk tag.
    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Directory => 1,
            Self::RegularFile => 2,
            Self::Symlink => 3,
            Self::BlockDevice => 4,
            Self::CharDevice => 5,
            Self::Fifo => 6,
            Self::Socket => 7,
        }
    }

    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        Ok(match raw {
            1 => Self::Directory,
            2 => Self::RegularFile,
            3 => Self::Symlink,
            4 => Self::BlockDevice,
            5 => Self::CharDevice,
            6 => Self::Fifo,
            7 => Self::Socket,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "inode_kind",
                    reason: "unknown file kind tag",
                });
            }
        })
    }

    /// `S_IF*` bits for this kind.
    #[must_use]
    pub fn mode_bits(self) -> u32 {
        match self {
            Self::Directory => S_IFDIR,
            Self::RegularFile => S_IFREG,
            Self::Symlink => S_IFLNK,
            Self::BlockDevice => S_IFBLK,
            Self::CharDevice => S_IFCHR,
            Self::Fifo => S_IFIFO,
            Self::Socket => S_IFSOCK,
        }
    }

    /// Kind encoded in the `S_IFMT` bits of `mode`, if any.
    #[must_use]
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFDIR => Some(Self::Directory),
            S_IFREG => Some(Self::RegularFile),
            S_IFLNK => Some(Self::Symlink),
            S_IFBLK => Some(Self::BlockDevice),
            S_IFCHR => Some(Self::CharDevice),
            S_IFIFO => Some(Self::Fifo),
            S_IFSOCK => Some(Self::Socket),
            _ => None,
        }
    }

    /// Device and special files carry an `rdev` and no content.
    #[must_use]
    pub fn is_special(self) -> bool {
        matches!(
            self,
            Self::BlockDevice | Self::CharDevice | Self::Fifo | Self::Socket
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    Ok(u16::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    Ok(i64::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Narrow a `u64` to `usize`, returning `ParseError::IntegerConversion` on overflow.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `usize` to `u32`, returning `ParseError::IntegerConversion` on overflow.
pub fn usize_to_u32(value: usize, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}
