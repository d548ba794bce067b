#![forbid(unsafe_code)]
//! Block layer: byte devices, frame decoding and the decompressed-block cache.
//!
//! Readers never touch frames directly. They ask [`BlockCache::get_block`],
//! which serves hits from memory and funnels misses through a
//! [`BlockSource`] (normally [`ImageBlockSource`] over a [`ByteDevice`]).

pub mod cache;
pub mod device;
pub mod source;

pub use cache::{BlockCache, BlockRef, CacheConfig, CacheStats};
pub use device::{ByteDevice, FileByteDevice, MemoryByteDevice};
pub use source::{BlockSource, ImageBlockSource, decode_frame};
