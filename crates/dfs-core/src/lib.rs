#![forbid(unsafe_code)]
//! Read side of DenseFS: mounting an image and serving driver requests.
//!
//! [`Image`] ties the three runtime components together: the
//! [`MetadataStore`](dfs_meta::MetadataStore) loaded once at mount, the
//! [`BlockCache`](dfs_block::BlockCache) decompressing blocks on demand, and
//! the [`Reader`] translating file byte ranges into block requests. The
//! [`FsOps`] trait is the surface an external filesystem driver calls.

mod image;
mod ops;
mod reader;

pub use image::{BlockVerdict, CheckReport, Image, OpenOptions};
pub use ops::{DirEntry, FsOps, InodeAttr, StatFs};
pub use reader::Reader;

pub use dfs_block::{CacheConfig, CacheStats};
pub use dfs_meta::{FileLayout, MetadataStore, WalkEntry};
