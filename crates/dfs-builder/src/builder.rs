//! Turning a file tree into a finalized image.

use crate::category::Category;
use crate::config::BuilderConfig;
use crate::namespace::{Body, Namespace, NodeAttrs};
use crate::pool::{CompressJob, CompressedBlock, CompressionPool};
use crate::store::{ChunkStore, push_chunk};
use dfs_error::{DfsError, Result};
use dfs_ondisk::{BlockIndexEntry, ImageHeader, MetadataImage};
use dfs_types::{Chunk, FileKind, IMAGE_HEADER_SIZE};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use tracing::{debug, warn};

/// Per-category counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub binary: u64,
    pub text: u64,
    pub incompressible: u64,
}

impl CategoryCounts {
    #[must_use]
    pub fn get(&self, category: Category) -> u64 {
        match category {
            Category::Binary => self.binary,
            Category::Text => self.text,
            Category::Incompressible => self.incompressible,
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.binary + self.text + self.incompressible
    }

    fn from_array(counts: [u64; 3]) -> Self {
        Self {
            binary: counts[Category::Binary.index()],
            text: counts[Category::Text.index()],
            incompressible: counts[Category::Incompressible.index()],
        }
    }
}

/// Summary of a finished build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStats {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub specials: u64,
    /// Regular file bytes read from the input.
    pub input_bytes: u64,
    /// Candidate chunks resolved to already stored content.
    pub dedup_hits: u64,
    pub dedup_bytes: u64,
    /// Fingerprint matches whose bytes differed.
    pub collisions: u64,
    pub blocks: CategoryCounts,
    /// Uncompressed bytes across all blocks.
    pub unique_bytes: u64,
    /// Frame bytes in the block section.
    pub stored_bytes: u64,
    pub metadata_bytes: u64,
    pub image_bytes: u64,
}

/// Incremental image builder.
///
/// Add files, directories, symlinks and special files in any order, then
/// call one of the `finalize` methods. Any failure while ingesting content
/// or compressing blocks aborts the build: queued compression jobs are
/// discarded and every later call returns [`DfsError::Cancelled`].
#[derive(Debug)]
pub struct Builder {
    config: BuilderConfig,
    namespace: Namespace,
    store: ChunkStore,
    /// `None` once the build has failed.
    pool: Option<CompressionPool>,
    input_bytes: u64,
}

impl Builder {
    pub fn new(config: BuilderConfig) -> Result<Self> {
        config.validate()?;
        let store = ChunkStore::new(config.block_size, config.on_collision);
        Self::with_store(config, store)
    }

    fn with_store(config: BuilderConfig, store: ChunkStore) -> Result<Self> {
        let pool = CompressionPool::new(config.worker_count)?;
        debug!(
            target: "dfs::builder",
            block_size = config.block_size,
            window = config.window(),
            workers = config.worker_count,
            reproducible = config.reproducible,
            "build_started"
        );
        Ok(Self {
            config,
            namespace: Namespace::new(),
            store,
            pool: Some(pool),
            input_bytes: 0,
        })
    }

    #[must_use]
    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    fn ensure_live(&self) -> Result<()> {
        if self.pool.is_none() {
            return Err(DfsError::Cancelled);
        }
        Ok(())
    }

    /// Run a build step; a failure poisons the builder.
    fn step<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.ensure_live()?;
        let result = op(self);
        if let Err(err) = &result {
            self.abort(err);
        }
        result
    }

    /// Drop the pool, discarding queued jobs and joining its workers.
    fn abort(&mut self, err: &DfsError) {
        self.pool = None;
        warn!(target: "dfs::builder", error = %err, "build_aborted");
    }

    /// Add a regular file with default attributes (`0644`).
    pub fn add_file(&mut self, path: impl AsRef<[u8]>, content: impl Read) -> Result<()> {
        self.add_file_with(path, content, NodeAttrs::file())
    }

    /// Add a regular file whose content is read from `content` until EOF.
    pub fn add_file_with(
        &mut self,
        path: impl AsRef<[u8]>,
        content: impl Read,
        attrs: NodeAttrs,
    ) -> Result<()> {
        self.ensure_live()?;
        let slot = self.namespace.vacancy(path.as_ref())?;
        let (chunks, size) = self.step(|b| b.ingest(content))?;
        self.namespace
            .insert(slot, attrs, Body::File { chunks, size });
        Ok(())
    }

    /// Create a directory, or set the attributes of one that was created
    /// implicitly as a parent.
    pub fn add_directory(&mut self, path: impl AsRef<[u8]>, attrs: NodeAttrs) -> Result<()> {
        self.ensure_live()?;
        self.namespace.add_directory(path.as_ref(), attrs)
    }

    pub fn add_symlink(
        &mut self,
        path: impl AsRef<[u8]>,
        target: impl AsRef<[u8]>,
        attrs: NodeAttrs,
    ) -> Result<()> {
        self.ensure_live()?;
        let target = target.as_ref();
        if target.is_empty() || target.contains(&0) {
            return Err(DfsError::InvalidPath(format!(
                "symlink target {:?} is empty or contains NUL",
                String::from_utf8_lossy(target)
            )));
        }
        let slot = self.namespace.vacancy(path.as_ref())?;
        self.namespace
            .insert(slot, attrs, Body::Symlink(target.to_vec()));
        Ok(())
    }

    /// Add a device node, FIFO or socket.
    pub fn add_special(
        &mut self,
        path: impl AsRef<[u8]>,
        kind: FileKind,
        rdev: u64,
        attrs: NodeAttrs,
    ) -> Result<()> {
        self.ensure_live()?;
        if !kind.is_special() {
            return Err(DfsError::InvalidConfig(format!(
                "{kind:?} is not a special file kind"
            )));
        }
        let slot = self.namespace.vacancy(path.as_ref())?;
        self.namespace
            .insert(slot, attrs, Body::Special { kind, rdev });
        Ok(())
    }

    /// Import the host directory `root` as the image root.
    ///
    /// Entries are visited in name order and symlinks are stored, not
    /// followed. Ownership, permissions and timestamps are preserved.
    pub fn add_tree(&mut self, root: impl AsRef<Path>) -> Result<()> {
        let root = root.as_ref();
        self.step(|b| {
            let meta = fs::symlink_metadata(root)?;
            if !meta.is_dir() {
                return Err(DfsError::NotDirectory);
            }
            b.namespace.set_root_attrs(host_attrs(&meta));
            b.scan_dir(root, &[])
        })
    }

    fn scan_dir(&mut self, host: &Path, image_dir: &[u8]) -> Result<()> {
        let mut entries = fs::read_dir(host)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(fs::DirEntry::file_name);
        for entry in entries {
            let mut path = image_dir.to_vec();
            path.push(b'/');
            path.extend_from_slice(entry.file_name().as_bytes());

            let host_path = entry.path();
            let meta = fs::symlink_metadata(&host_path)?;
            let attrs = host_attrs(&meta);
            let file_type = meta.file_type();
            if file_type.is_dir() {
                self.namespace.add_directory(&path, attrs)?;
                self.scan_dir(&host_path, &path)?;
            } else if file_type.is_file() {
                let slot = self.namespace.vacancy(&path)?;
                let (chunks, size) = self.ingest(File::open(&host_path)?)?;
                self.namespace
                    .insert(slot, attrs, Body::File { chunks, size });
            } else if file_type.is_symlink() {
                let target = fs::read_link(&host_path)?;
                let slot = self.namespace.vacancy(&path)?;
                self.namespace.insert(
                    slot,
                    attrs,
                    Body::Symlink(target.as_os_str().as_bytes().to_vec()),
                );
            } else {
                let kind = if file_type.is_block_device() {
                    FileKind::BlockDevice
                } else if file_type.is_char_device() {
                    FileKind::CharDevice
                } else if file_type.is_fifo() {
                    FileKind::Fifo
                } else {
                    FileKind::Socket
                };
                let slot = self.namespace.vacancy(&path)?;
                self.namespace.insert(
                    slot,
                    attrs,
                    Body::Special {
                        kind,
                        rdev: meta.rdev(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Chunk, deduplicate and pack one file's content.
    fn ingest(&mut self, mut content: impl Read) -> Result<(Vec<Chunk>, u64)> {
        let window = u64::from(self.config.window());
        let mut buf = Vec::new();
        let mut category = None;
        let mut chunks = Vec::new();
        let mut size = 0_u64;
        loop {
            buf.clear();
            let read = content.by_ref().take(window).read_to_end(&mut buf)?;
            if read == 0 {
                break;
            }
            let category = *category.get_or_insert_with(|| Category::classify(&buf));
            for piece in self.store.put(category, &buf)? {
                push_chunk(&mut chunks, piece);
            }
            size += read as u64;
            self.submit_sealed()?;
            if (read as u64) < window {
                break;
            }
        }
        self.input_bytes += size;
        Ok((chunks, size))
    }

    fn submit_sealed(&mut self) -> Result<()> {
        let pool = self.pool.as_mut().ok_or(DfsError::Cancelled)?;
        for sealed in self.store.take_sealed() {
            let (algorithm, level) = self.config.codec_for(sealed.category);
            pool.submit(CompressJob {
                id: sealed.id,
                category: sealed.category,
                payload: sealed.payload,
                algorithm,
                level,
            })?;
        }
        Ok(())
    }

    /// Seal all open blocks, wait for compression and return the image.
    pub fn finalize(self) -> Result<Vec<u8>> {
        self.finalize_with_stats().map(|(image, _)| image)
    }

    pub fn finalize_with_stats(mut self) -> Result<(Vec<u8>, BuildStats)> {
        self.step(Self::assemble)
    }

    /// Finalize and write the image to `path` atomically: the bytes go to
    /// a temporary file in the same directory, renamed into place only once
    /// complete.
    pub fn finalize_to_path(self, path: impl AsRef<Path>) -> Result<BuildStats> {
        let path = path.as_ref();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let (image, stats) = self.finalize_with_stats()?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&image)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| DfsError::Io(e.error))?;
        debug!(target: "dfs::builder", path = %path.display(), bytes = image.len(), "image_written");
        Ok(stats)
    }

    fn assemble(&mut self) -> Result<(Vec<u8>, BuildStats)> {
        self.store.seal_all()?;
        self.submit_sealed()?;
        let pool = self.pool.take().ok_or(DfsError::Cancelled)?;
        let mut blocks = pool.finish()?;
        if self.config.reproducible {
            blocks.sort_unstable_by_key(|b| b.id);
        }

        let (section, index) = layout_blocks(&blocks, self.store.block_count())?;
        let metadata_image = self.namespace.flatten(index);
        let metadata = metadata_image
            .encode()
            .map_err(|e| DfsError::Format(format!("metadata encode: {e}")))?;

        let metadata_offset = IMAGE_HEADER_SIZE as u64;
        let metadata_len = metadata.len() as u64;
        let header = ImageHeader {
            flags: if self.config.reproducible {
                ImageHeader::FLAG_REPRODUCIBLE
            } else {
                0
            },
            metadata_offset,
            metadata_len,
            blocks_offset: metadata_offset + metadata_len,
            blocks_len: section.len() as u64,
            block_count: u32::try_from(blocks.len())
                .map_err(|_| DfsError::Format("block count exceeds u32".to_owned()))?,
            metadata_checksum: crc32c::crc32c(&metadata),
            ..ImageHeader::current()
        };

        let mut image = Vec::with_capacity(IMAGE_HEADER_SIZE + metadata.len() + section.len());
        image.extend_from_slice(&header.encode());
        image.extend_from_slice(&metadata);
        image.extend_from_slice(&section);

        let stats = self.stats(&metadata_image, &blocks, metadata.len(), image.len());
        debug!(
            target: "dfs::builder",
            files = stats.files,
            blocks = stats.blocks.total(),
            input_bytes = stats.input_bytes,
            dedup_bytes = stats.dedup_bytes,
            stored_bytes = stats.stored_bytes,
            image_bytes = stats.image_bytes,
            "build_finished"
        );
        Ok((image, stats))
    }

    fn stats(
        &self,
        metadata: &MetadataImage,
        blocks: &[CompressedBlock],
        metadata_bytes: usize,
        image_bytes: usize,
    ) -> BuildStats {
        let counters = self.store.counters();
        let count = |kind: FileKind| {
            metadata
                .inodes
                .iter()
                .filter(|inode| inode.kind == kind)
                .count() as u64
        };
        BuildStats {
            files: count(FileKind::RegularFile),
            directories: count(FileKind::Directory),
            symlinks: count(FileKind::Symlink),
            specials: metadata
                .inodes
                .iter()
                .filter(|inode| inode.kind.is_special())
                .count() as u64,
            input_bytes: self.input_bytes,
            dedup_hits: counters.dedup_hits,
            dedup_bytes: counters.dedup_bytes,
            collisions: counters.collisions,
            blocks: CategoryCounts::from_array(counters.blocks_per_category),
            unique_bytes: counters.unique_bytes,
            stored_bytes: blocks.iter().map(|b| b.frame.len() as u64).sum(),
            metadata_bytes: metadata_bytes as u64,
            image_bytes: image_bytes as u64,
        }
    }
}

/// Concatenate frames in the given order and index them by block id.
fn layout_blocks(
    blocks: &[CompressedBlock],
    block_count: usize,
) -> Result<(Vec<u8>, Vec<BlockIndexEntry>)> {
    let mut section = Vec::with_capacity(blocks.iter().map(|b| b.frame.len()).sum());
    let mut index: Vec<Option<BlockIndexEntry>> = vec![None; block_count];
    for block in blocks {
        let slot = index
            .get_mut(block.id.index())
            .ok_or_else(|| DfsError::Format(format!("block {} has no index slot", block.id)))?;
        *slot = Some(BlockIndexEntry {
            offset: section.len() as u64,
            frame_len: u32::try_from(block.frame.len())
                .map_err(|_| DfsError::Format(format!("block {} frame exceeds u32", block.id)))?,
            uncompressed_size: block.uncompressed_size,
        });
        section.extend_from_slice(&block.frame);
    }
    let index = index
        .into_iter()
        .enumerate()
        .map(|(id, entry)| {
            entry.ok_or_else(|| DfsError::Format(format!("block {id} was never compressed")))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((section, index))
}

fn host_attrs(meta: &fs::Metadata) -> NodeAttrs {
    NodeAttrs {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        atime: meta.atime(),
        mtime: meta.mtime(),
        ctime: meta.ctime(),
    }
}
