#![forbid(unsafe_code)]
//! Image builder for DenseFS.
//!
//! A [`Builder`] consumes an input tree file by file. Regular file content
//! is cut into candidate chunks of `dedup_window` bytes (small files are a
//! single candidate), fingerprinted with BLAKE3 and either resolved to
//! content already stored (after a byte-for-byte check) or appended to the
//! open block of the file's [`Category`]. Full blocks are sealed and handed
//! to a pool of compression workers while ingestion continues.
//!
//! `finalize` seals the remaining partial blocks, waits for compression and
//! emits `header | metadata | blocks`. Any failure aborts the whole build;
//! no partial image is ever produced.

mod builder;
mod category;
mod config;
mod namespace;
mod pool;
mod store;

pub use builder::{BuildStats, Builder, CategoryCounts};
pub use category::{Category, shannon_entropy};
pub use config::{BuilderConfig, CategoryCompression, CollisionPolicy};
pub use namespace::NodeAttrs;

pub use dfs_compress::{Algorithm, CompressionSpec};
