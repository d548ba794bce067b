#![forbid(unsafe_code)]
//! On-disk format of a DenseFS image.
//!
//! An image is three contiguous regions:
//!
//! ```text
//! [ header (64 B) | metadata section | block section ]
//! ```
//!
//! The header locates the other two regions. The block section is a
//! concatenation of frames, each one compressed block; the block index inside
//! the metadata section maps block ids to frame positions. Everything is
//! little-endian. Parsing here is purely structural and returns
//! [`dfs_types::ParseError`]; semantic validation happens at mount time.

pub mod frame;
pub mod header;
pub mod metadata;

pub use frame::{FrameHeader, encode_frame, split_frame};
pub use header::ImageHeader;
pub use metadata::{
    BlockIndexEntry, DirEntryRecord, DirectoryRecord, FileChunks, InodeRecord, MetadataImage,
    SectionTag, SymlinkRecord,
};
