#![forbid(unsafe_code)]
//! DenseFS public API facade.
//!
//! Re-exports the image builder from `dfs-builder` and the mount and read
//! path from `dfs-core` behind one crate, so that a tool packing or serving
//! images depends on `dfs` alone.
//!
//! ```no_run
//! use dfs::{Builder, BuilderConfig, Image, OpenOptions};
//!
//! # fn main() -> dfs::Result<()> {
//! let mut builder = Builder::new(BuilderConfig::default())?;
//! builder.add_file("greeting.txt", &b"hello world"[..])?;
//! let bytes = builder.finalize()?;
//!
//! let image = Image::from_bytes(bytes, &OpenOptions::default())?;
//! assert_eq!(image.read_path("/greeting.txt")?, b"hello world");
//! # Ok(())
//! # }
//! ```

pub use dfs_builder::*;
pub use dfs_core::*;
pub use dfs_error::{DfsError, Result};
pub use dfs_types::{BlockId, Chunk, FileKind, InodeNumber};
