//! Mounting an image and serving the driver API from it.

use crate::ops::{DirEntry, FsOps, InodeAttr, StatFs};
use crate::reader::Reader;
use dfs_block::{
    BlockCache, BlockSource, ByteDevice, CacheConfig, CacheStats, FileByteDevice, ImageBlockSource,
    MemoryByteDevice,
};
use dfs_error::{DfsError, Result};
use dfs_meta::{MetadataStore, WalkEntry};
use dfs_ondisk::{BlockIndexEntry, ImageHeader};
use dfs_types::{BlockId, FORMAT_VERSION_MAJOR, IMAGE_HEADER_SIZE, InodeNumber, u64_to_usize};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Mount-time options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    pub cache: CacheConfig,
    /// Compare the metadata section against the header's crc32c.
    pub verify_metadata_checksum: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            verify_metadata_checksum: true,
        }
    }
}

impl OpenOptions {
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()
    }
}

/// Outcome of verifying one block in [`Image::check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVerdict {
    pub block: BlockId,
    pub frame_len: u32,
    pub uncompressed_size: u32,
    /// `None` when the block decoded and its checksum matched.
    pub error: Option<String>,
}

/// Result of a full integrity pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub verdicts: Vec<BlockVerdict>,
    pub ok: u64,
    pub corrupt: u64,
}

impl CheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.corrupt == 0
    }
}

type DynDevice = Arc<dyn ByteDevice>;

/// A mounted, read-only image.
#[derive(Debug)]
pub struct Image {
    header: ImageHeader,
    image_len: u64,
    /// Largest uncompressed block, at least one page; reported as `blksize`.
    io_size: u32,
    source: Arc<ImageBlockSource<DynDevice>>,
    reader: Reader,
}

fn preferred_io_size(index: &[BlockIndexEntry]) -> u32 {
    index
        .iter()
        .map(|e| e.uncompressed_size)
        .max()
        .unwrap_or(0)
        .max(4096)
}

fn read_region(device: &dyn ByteDevice, offset: u64, len: u64, what: &str) -> Result<Vec<u8>> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| DfsError::Format(format!("{what} range overflows")))?;
    if end > device.len_bytes() {
        return Err(DfsError::Format(format!(
            "{what} [{offset}, {end}) exceeds image of {} bytes",
            device.len_bytes()
        )));
    }
    let len = u64_to_usize(len, "region_len").map_err(|e| DfsError::Format(e.to_string()))?;
    let mut buf = vec![0_u8; len];
    device.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}

impl Image {
    /// Mount the image file at `path`.
    pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let device = FileByteDevice::open(path.as_ref())?;
        debug!(target: "dfs::image", path = %path.as_ref().display(), "image_open");
        Self::from_device(Arc::new(device), options)
    }

    /// Mount an image held in memory.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>, options: &OpenOptions) -> Result<Self> {
        Self::from_device(Arc::new(MemoryByteDevice::new(bytes)), options)
    }

    /// Mount an image on an arbitrary byte device.
    pub fn from_device(device: DynDevice, options: &OpenOptions) -> Result<Self> {
        options.validate()?;
        let image_len = device.len_bytes();
        if image_len < IMAGE_HEADER_SIZE as u64 {
            return Err(DfsError::Format(format!(
                "image of {image_len} bytes is shorter than its header"
            )));
        }
        let mut raw = [0_u8; IMAGE_HEADER_SIZE];
        device.read_exact_at(0, &mut raw)?;
        let header = ImageHeader::parse(&raw).map_err(|e| DfsError::Format(e.to_string()))?;
        if header.version_major != FORMAT_VERSION_MAJOR {
            return Err(DfsError::UnsupportedVersion {
                major: header.version_major,
                minor: header.version_minor,
            });
        }

        let metadata = read_region(
            device.as_ref(),
            header.metadata_offset,
            header.metadata_len,
            "metadata section",
        )?;
        // Bounds only; frames are read lazily.
        header
            .blocks_offset
            .checked_add(header.blocks_len)
            .filter(|&end| end <= image_len)
            .ok_or_else(|| DfsError::Format("block section exceeds image".to_owned()))?;

        if options.verify_metadata_checksum {
            let actual = crc32c::crc32c(&metadata);
            if actual != header.metadata_checksum {
                return Err(DfsError::CorruptMetadata(format!(
                    "metadata checksum mismatch: stored {:#010x}, computed {actual:#010x}",
                    header.metadata_checksum
                )));
            }
        }

        let meta = MetadataStore::parse(&metadata, header.blocks_len)?;
        if meta.block_index().len() as u64 != u64::from(header.block_count) {
            return Err(DfsError::CorruptMetadata(format!(
                "header declares {} blocks, block index has {}",
                header.block_count,
                meta.block_index().len()
            )));
        }

        let io_size = preferred_io_size(meta.block_index());
        let source = Arc::new(ImageBlockSource::new(
            device,
            header.blocks_offset,
            meta.block_index().to_vec(),
        ));
        let cache = BlockCache::new(Arc::clone(&source) as Arc<dyn BlockSource>, &options.cache)?;

        debug!(
            target: "dfs::image",
            version_major = header.version_major,
            version_minor = header.version_minor,
            inodes = meta.inode_count(),
            blocks = header.block_count,
            image_len,
            "image_mounted"
        );
        Ok(Self {
            header,
            image_len,
            io_size,
            source,
            reader: Reader::new(Arc::new(meta), Arc::new(cache)),
        })
    }

    #[must_use]
    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    #[must_use]
    pub fn metadata(&self) -> &MetadataStore {
        self.reader.metadata()
    }

    #[must_use]
    pub fn cache(&self) -> &BlockCache {
        self.reader.cache()
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache().stats()
    }

    /// Cloneable read handle for worker threads.
    #[must_use]
    pub fn reader(&self) -> Reader {
        self.reader.clone()
    }

    /// Read `length` bytes of `ino` from `offset`; see [`Reader::read`].
    pub fn read_range(&self, ino: InodeNumber, offset: i64, length: i64) -> Result<Vec<u8>> {
        self.reader.read(ino, offset, length)
    }

    /// Resolve `path`, following symlinks, and return its attributes.
    pub fn lookup_path(&self, path: impl AsRef<[u8]>) -> Result<InodeAttr> {
        let ino = self.metadata().resolve(path)?;
        self.getattr(ino)
    }

    /// Like [`Image::lookup_path`] but a final symlink is not followed.
    pub fn lookup_path_nofollow(&self, path: impl AsRef<[u8]>) -> Result<InodeAttr> {
        let ino = self.metadata().resolve_nofollow(path)?;
        self.getattr(ino)
    }

    /// Whole file content of the regular file at `path`.
    pub fn read_path(&self, path: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let ino = self.metadata().resolve(path)?;
        let size = self.metadata().inode(ino)?.size;
        self.reader.read(ino, 0, i64::try_from(size).unwrap_or(i64::MAX))
    }

    /// Deterministic depth-first listing of every `(path, inode)`.
    pub fn walk(&self) -> Result<Vec<WalkEntry>> {
        self.metadata().walk()
    }

    /// Decode and verify every block without going through the cache.
    ///
    /// Never stops at the first bad block; every block gets a verdict.
    #[must_use]
    pub fn check(&self) -> CheckReport {
        let mut report = CheckReport::default();
        for (id, entry) in self.metadata().block_index().iter().enumerate() {
            let block = BlockId(u32::try_from(id).unwrap_or(u32::MAX));
            let error = match self.source.load(block) {
                Ok(_) => None,
                Err(err) => {
                    warn!(target: "dfs::image", block = block.0, error = %err, "block_check_failed");
                    Some(err.to_string())
                }
            };
            if error.is_some() {
                report.corrupt += 1;
            } else {
                report.ok += 1;
            }
            report.verdicts.push(BlockVerdict {
                block,
                frame_len: entry.frame_len,
                uncompressed_size: entry.uncompressed_size,
                error,
            });
        }
        debug!(
            target: "dfs::image",
            ok = report.ok,
            corrupt = report.corrupt,
            "image_checked"
        );
        report
    }
}

impl FsOps for Image {
    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        let record = self.metadata().inode(ino)?;
        Ok(InodeAttr::from_record(ino, record, self.io_size))
    }

    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr> {
        let child = self
            .metadata()
            .lookup_child(parent, name.as_encoded_bytes())?;
        self.getattr(child)
    }

    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>> {
        let meta = self.metadata();
        let children = meta.list_children(ino)?;
        let parent = meta.parent_of(ino)?;

        // Offset is the 1-indexed position in [".", "..", children...].
        let dots = [(b".".to_vec(), ino), (b"..".to_vec(), parent)];
        let named = children.iter().map(|e| (e.name.clone(), e.child));
        dots.into_iter()
            .chain(named)
            .enumerate()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .map(|(idx, (name, child))| -> Result<DirEntry> {
                Ok(DirEntry {
                    ino: child,
                    offset: idx as u64 + 1,
                    kind: meta.inode(child)?.kind,
                    name,
                })
            })
            .collect()
    }

    fn read(&self, ino: InodeNumber, offset: i64, size: u32) -> Result<Vec<u8>> {
        self.reader.read(ino, offset, i64::from(size))
    }

    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        self.metadata().readlink(ino).map(<[u8]>::to_vec)
    }

    fn statfs(&self) -> Result<StatFs> {
        let meta = self.metadata();
        Ok(StatFs {
            inodes: meta.inode_count(),
            blocks: meta.block_index().len() as u64,
            block_size: self.io_size,
            file_bytes: meta.total_file_bytes(),
            unique_bytes: meta
                .block_index()
                .iter()
                .map(|e| u64::from(e.uncompressed_size))
                .sum(),
            stored_bytes: self.source.stored_bytes(),
            image_bytes: self.image_len,
        })
    }
}
