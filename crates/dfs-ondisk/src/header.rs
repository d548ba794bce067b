//! Fixed 64-byte image header.

use dfs_types::{
    FORMAT_VERSION_MAJOR, FORMAT_VERSION_MINOR, IMAGE_HEADER_SIZE, IMAGE_MAGIC, ParseError,
    ensure_slice, read_fixed, read_le_u16, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

const HEADER_CHECKSUM_OFFSET: usize = 60;

/// Parsed image header.
///
/// Layout (little-endian):
///
/// ```text
/// 0   magic            [u8; 8]
/// 8   version_major    u16
/// 10  version_minor    u16
/// 12  flags            u32
/// 16  metadata_offset  u64
/// 24  metadata_len     u64
/// 32  blocks_offset    u64
/// 40  blocks_len       u64
/// 48  block_count      u32
/// 52  metadata_crc32c  u32
/// 56  reserved         u32
/// 60  header_crc32c    u32   (over bytes 0..60)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: u32,
    pub metadata_offset: u64,
    pub metadata_len: u64,
    pub blocks_offset: u64,
    pub blocks_len: u64,
    pub block_count: u32,
    pub metadata_checksum: u32,
}

impl ImageHeader {
    /// Frames were emitted in block-id order.
    pub const FLAG_REPRODUCIBLE: u32 = 1;

    /// Header for the current format version.
    #[must_use]
    pub fn current() -> Self {
        Self {
            version_major: FORMAT_VERSION_MAJOR,
            version_minor: FORMAT_VERSION_MINOR,
            flags: 0,
            metadata_offset: 0,
            metadata_len: 0,
            blocks_offset: 0,
            blocks_len: 0,
            block_count: 0,
            metadata_checksum: 0,
        }
    }

    #[must_use]
    pub fn is_reproducible(&self) -> bool {
        self.flags & Self::FLAG_REPRODUCIBLE != 0
    }

    #[must_use]
    pub fn encode(&self) -> [u8; IMAGE_HEADER_SIZE] {
        let mut out = [0_u8; IMAGE_HEADER_SIZE];
        out[0..8].copy_from_slice(&IMAGE_MAGIC);
        out[8..10].copy_from_slice(&self.version_major.to_le_bytes());
        out[10..12].copy_from_slice(&self.version_minor.to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.to_le_bytes());
        out[16..24].copy_from_slice(&self.metadata_offset.to_le_bytes());
        out[24..32].copy_from_slice(&self.metadata_len.to_le_bytes());
        out[32..40].copy_from_slice(&self.blocks_offset.to_le_bytes());
        out[40..48].copy_from_slice(&self.blocks_len.to_le_bytes());
        out[48..52].copy_from_slice(&self.block_count.to_le_bytes());
        out[52..56].copy_from_slice(&self.metadata_checksum.to_le_bytes());
        let crc = crc32c::crc32c(&out[..HEADER_CHECKSUM_OFFSET]);
        out[HEADER_CHECKSUM_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parse and checksum-verify the header at the start of `region`.
    ///
    /// Version compatibility is not judged here; the mount path decides.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        let bytes = ensure_slice(region, 0, IMAGE_HEADER_SIZE)?;
        let magic: [u8; 8] = read_fixed(bytes, 0)?;
        if magic != IMAGE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from_le_bytes(IMAGE_MAGIC),
                actual: u64::from_le_bytes(magic),
            });
        }

        let stored_crc = read_le_u32(bytes, HEADER_CHECKSUM_OFFSET)?;
        if crc32c::crc32c(&bytes[..HEADER_CHECKSUM_OFFSET]) != stored_crc {
            return Err(ParseError::InvalidField {
                field: "header_checksum",
                reason: "crc32c mismatch",
            });
        }

        Ok(Self {
            version_major: read_le_u16(bytes, 8)?,
            version_minor: read_le_u16(bytes, 10)?,
            flags: read_le_u32(bytes, 12)?,
            metadata_offset: read_le_u64(bytes, 16)?,
            metadata_len: read_le_u64(bytes, 24)?,
            blocks_offset: read_le_u64(bytes, 32)?,
            blocks_len: read_le_u64(bytes, 40)?,
            block_count: read_le_u32(bytes, 48)?,
            metadata_checksum: read_le_u32(bytes, 52)?,
        })
    }
}
