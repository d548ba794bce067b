//! Block frame records: `[algorithm][usize][csize][checksum][payload]`.

use dfs_types::{FRAME_HEADER_SIZE, ParseError, read_le_u32, read_u8, usize_to_u32};
use serde::{Deserialize, Serialize};

/// Header preceding every compressed block payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Raw algorithm id; the codec crate owns the mapping.
    pub algorithm_id: u8,
    pub uncompressed_size: u32,
    pub compressed_size: u32,
    /// crc32c of the uncompressed payload.
    pub checksum: u32,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            algorithm_id: read_u8(bytes, 0)?,
            uncompressed_size: read_le_u32(bytes, 1)?,
            compressed_size: read_le_u32(bytes, 5)?,
            checksum: read_le_u32(bytes, 9)?,
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.algorithm_id);
        out.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        out.extend_from_slice(&self.compressed_size.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
    }

    /// Header plus payload length.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.compressed_size as usize
    }
}

/// Build a complete frame for a compressed payload.
pub fn encode_frame(
    algorithm_id: u8,
    uncompressed: &[u8],
    compressed: &[u8],
) -> Result<Vec<u8>, ParseError> {
    let header = FrameHeader {
        algorithm_id,
        uncompressed_size: usize_to_u32(uncompressed.len(), "uncompressed_size")?,
        compressed_size: usize_to_u32(compressed.len(), "compressed_size")?,
        checksum: crc32c::crc32c(uncompressed),
    };
    let mut out = Vec::with_capacity(header.frame_len());
    header.encode_into(&mut out);
    out.extend_from_slice(compressed);
    Ok(out)
}

/// Split a complete frame into its header and payload.
pub fn split_frame(frame: &[u8]) -> Result<(FrameHeader, &[u8]), ParseError> {
    let header = FrameHeader::parse(frame)?;
    let payload = dfs_types::ensure_slice(frame, FRAME_HEADER_SIZE, header.compressed_size as usize)?;
    if frame.len() != header.frame_len() {
        return Err(ParseError::InvalidField {
            field: "compressed_size",
            reason: "frame length disagrees with header",
        });
    }
    Ok((header, payload))
}
