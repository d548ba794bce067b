#![forbid(unsafe_code)]
//! Block compression for DenseFS images.
//!
//! The algorithm set is closed and known at compile time, so it is modelled
//! as the [`Algorithm`] enum with one encode and one decode arm per variant.
//! Each sealed block records its algorithm id in its frame, which lets a
//! single image mix algorithms per content category.
//!
//! | Algorithm | Id | Crate | Trade-off |
//! |-----------|----|-------|-----------|
//! | `Store` | 0 | n/a | no-op, for incompressible content |
//! | `Lz4` | 1 | `lz4_flex` | fast byte-oriented |
//! | `Zlib` | 2 | `flate2` | general-purpose balanced |
//! | `Zstd` | 3 | `zstd` | high-ratio dictionary-based |
//! | `Brotli` | 4 | `brotli` | high-ratio windowed |
//!
//! Decoding is bounded by the expected uncompressed size: a stream that
//! decodes to more or fewer bytes is rejected as [`CodecError::SizeMismatch`].

use dfs_error::DfsError;
use dfs_types::BlockId;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use thiserror::Error;

/// Brotli sliding window (log2 bytes).
const BROTLI_LGWIN: i32 = 22;
const BROTLI_BUFFER_SIZE: usize = 64 * 1024;

/// Compression algorithm tag stored in every block frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Store,
    Lz4,
    Zlib,
    Zstd,
    Brotli,
}

impl Algorithm {
    pub const ALL: [Self; 5] = [Self::Store, Self::Lz4, Self::Zlib, Self::Zstd, Self::Brotli];

    /// On-disk algorithm id.
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Store => 0,
            Self::Lz4 => 1,
            Self::Zlib => 2,
            Self::Zstd => 3,
            Self::Brotli => 4,
        }
    }

    #[must_use]
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Store),
            1 => Some(Self::Lz4),
            2 => Some(Self::Zlib),
            3 => Some(Self::Zstd),
            4 => Some(Self::Brotli),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Lz4 => "lz4",
            Self::Zlib => "zlib",
            Self::Zstd => "zstd",
            Self::Brotli => "brotli",
        }
    }

    /// Accepted level range. `Store` and `Lz4` ignore the level.
    #[must_use]
    pub fn level_range(self) -> (i32, i32) {
        match self {
            Self::Store | Self::Lz4 => (0, 0),
            Self::Zlib => (0, 9),
            Self::Zstd => (-7, 22),
            Self::Brotli => (0, 11),
        }
    }

    #[must_use]
    pub fn default_level(self) -> i32 {
        match self {
            Self::Store | Self::Lz4 => 0,
            Self::Zlib => 6,
            Self::Zstd => 19,
            Self::Brotli => 9,
        }
    }

    /// Clamp `level` into [`Self::level_range`].
    #[must_use]
    pub fn clamp_level(self, level: i32) -> i32 {
        let (lo, hi) = self.level_range();
        level.clamp(lo, hi)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| CodecError::UnknownAlgorithm(s.to_owned()))
    }
}

/// Algorithm plus optional level; `None` defers to the configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionSpec {
    pub algorithm: Algorithm,
    #[serde(default)]
    pub level: Option<i32>,
}

impl CompressionSpec {
    #[must_use]
    pub const fn new(algorithm: Algorithm, level: Option<i32>) -> Self {
        Self { algorithm, level }
    }

    /// Level actually used: explicit level, else `fallback`, else the
    /// algorithm default, clamped into range.
    #[must_use]
    pub fn effective_level(self, fallback: Option<i32>) -> i32 {
        let level = self
            .level
            .or(fallback)
            .unwrap_or_else(|| self.algorithm.default_level());
        self.algorithm.clamp_level(level)
    }

    /// Reject explicit levels outside the algorithm's range.
    pub fn validate(self) -> Result<(), CodecError> {
        if let Some(level) = self.level {
            let (lo, hi) = self.algorithm.level_range();
            if !(lo..=hi).contains(&level) && hi != 0 {
                return Err(CodecError::LevelOutOfRange {
                    algorithm: self.algorithm,
                    level,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("{algorithm} decoded {actual} bytes, expected {expected}")]
    SizeMismatch {
        algorithm: Algorithm,
        expected: usize,
        actual: usize,
    },
    #[error("{algorithm} decode failed: {detail}")]
    Decode { algorithm: Algorithm, detail: String },
    #[error("{algorithm} encode failed: {detail}")]
    Encode { algorithm: Algorithm, detail: String },
    #[error("unknown compression algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("level {level} out of range for {algorithm}")]
    LevelOutOfRange { algorithm: Algorithm, level: i32 },
}

impl CodecError {
    /// Attach the block id: decode failures surface as `CorruptBlock`.
    #[must_use]
    pub fn into_block_error(self, block: BlockId) -> DfsError {
        match self {
            Self::SizeMismatch { .. } | Self::Decode { .. } | Self::UnknownAlgorithm(_) => {
                DfsError::CorruptBlock {
                    block: block.0,
                    detail: self.to_string(),
                }
            }
            Self::Encode { .. } => DfsError::Io(std::io::Error::other(self.to_string())),
            Self::LevelOutOfRange { .. } => DfsError::InvalidConfig(self.to_string()),
        }
    }
}

/// Compress `data` with `algorithm` at `level` (clamped into range).
pub fn compress(data: &[u8], algorithm: Algorithm, level: i32) -> Result<Vec<u8>, CodecError> {
    let level = algorithm.clamp_level(level);
    let encode_err = |detail: String| CodecError::Encode { algorithm, detail };
    match algorithm {
        Algorithm::Store => Ok(data.to_vec()),
        Algorithm::Lz4 => Ok(lz4_flex::block::compress(data)),
        Algorithm::Zlib => {
            let mut encoder = ZlibEncoder::new(
                Vec::with_capacity(data.len() / 2),
                Compression::new(level.unsigned_abs()),
            );
            encoder
                .write_all(data)
                .map_err(|e| encode_err(e.to_string()))?;
            encoder.finish().map_err(|e| encode_err(e.to_string()))
        }
        Algorithm::Zstd => zstd::bulk::compress(data, level).map_err(|e| encode_err(e.to_string())),
        Algorithm::Brotli => {
            let params = brotli::enc::BrotliEncoderParams {
                quality: level,
                lgwin: BROTLI_LGWIN,
                ..Default::default()
            };
            let mut out = Vec::with_capacity(data.len() / 2);
            let mut input = data;
            brotli::BrotliCompress(&mut input, &mut out, &params)
                .map_err(|e| encode_err(e.to_string()))?;
            Ok(out)
        }
    }
}

/// Decompress `data`, requiring exactly `expected_size` output bytes.
pub fn decompress(
    data: &[u8],
    algorithm: Algorithm,
    expected_size: usize,
) -> Result<Vec<u8>, CodecError> {
    let decode_err = |detail: String| CodecError::Decode { algorithm, detail };
    let out = match algorithm {
        Algorithm::Store => data.to_vec(),
        Algorithm::Lz4 => {
            let mut out = vec![0_u8; expected_size];
            let written = lz4_flex::block::decompress_into(data, &mut out)
                .map_err(|e| decode_err(e.to_string()))?;
            out.truncate(written);
            out
        }
        Algorithm::Zlib => read_bounded(ZlibDecoder::new(data), expected_size)
            .map_err(|e| decode_err(e.to_string()))?,
        Algorithm::Zstd => {
            // Capacity one past the expectation so oversized frames are
            // reported as a size mismatch rather than a generic failure.
            zstd::bulk::decompress(data, expected_size.saturating_add(1))
                .map_err(|e| decode_err(e.to_string()))?
        }
        Algorithm::Brotli => {
            read_bounded(brotli::Decompressor::new(data, BROTLI_BUFFER_SIZE), expected_size)
                .map_err(|e| decode_err(e.to_string()))?
        }
    };

    if out.len() != expected_size {
        return Err(CodecError::SizeMismatch {
            algorithm,
            expected: expected_size,
            actual: out.len(),
        });
    }
    Ok(out)
}

/// Drain a streaming decoder, reading at most one byte past `expected`.
fn read_bounded<R: Read>(reader: R, expected: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected);
    let limit = u64::try_from(expected).unwrap_or(u64::MAX).saturating_add(1);
    reader.take(limit).read_to_end(&mut out)?;
    Ok(out)
}
