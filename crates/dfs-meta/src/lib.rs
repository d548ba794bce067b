#![forbid(unsafe_code)]
//! Metadata Store: the immutable inode, directory and chunk index of a
//! mounted image.
//!
//! The store is built once from a parsed [`MetadataImage`], validated as a
//! whole, and never mutated afterwards. Every accessor takes `&self` and no
//! locks are involved, so one store is shared freely across reader threads.

mod resolve;

use dfs_error::{DfsError, Result};
use dfs_ondisk::{BlockIndexEntry, DirEntryRecord, InodeRecord, MetadataImage};
use dfs_types::{Chunk, FRAME_HEADER_SIZE, FileKind, InodeNumber, MAX_BLOCK_SIZE, ParseError};
use std::collections::HashMap;
use tracing::debug;

pub use resolve::WalkEntry;

/// A regular file's chunk list together with prefix sums of chunk lengths.
#[derive(Debug, Clone, Copy)]
pub struct FileLayout<'a> {
    pub chunks: &'a [Chunk],
    /// `ends[i]` is the file offset one past the last byte of `chunks[i]`.
    pub ends: &'a [u64],
}

impl FileLayout<'_> {
    #[must_use]
    pub fn size(&self) -> u64 {
        self.ends.last().copied().unwrap_or(0)
    }

    /// Index of the chunk containing file offset `offset`, if any.
    #[must_use]
    pub fn chunk_at(&self, offset: u64) -> Option<usize> {
        let idx = self.ends.partition_point(|&end| end <= offset);
        (idx < self.chunks.len()).then_some(idx)
    }

    /// File offset at which chunk `idx` starts.
    #[must_use]
    pub fn chunk_start(&self, idx: usize) -> u64 {
        if idx == 0 { 0 } else { self.ends[idx - 1] }
    }
}

#[derive(Debug)]
struct Directory {
    parent: InodeNumber,
    entries: Vec<DirEntryRecord>,
}

#[derive(Debug, Default)]
struct FileChunkIndex {
    chunks: Vec<Chunk>,
    ends: Vec<u64>,
}

/// Validated, immutable metadata of one image.
#[derive(Debug)]
pub struct MetadataStore {
    inodes: Vec<InodeRecord>,
    directories: HashMap<InodeNumber, Directory>,
    files: HashMap<InodeNumber, FileChunkIndex>,
    symlinks: HashMap<InodeNumber, Vec<u8>>,
    blocks: Vec<BlockIndexEntry>,
    total_file_bytes: u64,
}

fn corrupt(detail: impl Into<String>) -> DfsError {
    DfsError::CorruptMetadata(detail.into())
}

/// Map a structural parse failure of the metadata section.
#[must_use]
pub fn parse_error_to_dfs(err: &ParseError) -> DfsError {
    match err {
        ParseError::InvalidMagic { .. } => DfsError::Format(err.to_string()),
        ParseError::InsufficientData { .. }
        | ParseError::InvalidField { .. }
        | ParseError::IntegerConversion { .. } => DfsError::CorruptMetadata(err.to_string()),
    }
}

impl MetadataStore {
    /// Parse and validate a metadata section.
    ///
    /// `blocks_len` is the length of the image's block section; every block
    /// index entry must lie inside it.
    pub fn parse(bytes: &[u8], blocks_len: u64) -> Result<Self> {
        let image = MetadataImage::parse(bytes).map_err(|e| parse_error_to_dfs(&e))?;
        Self::load(image, blocks_len)
    }

    /// Validate a decoded metadata image and index it.
    pub fn load(image: MetadataImage, blocks_len: u64) -> Result<Self> {
        let MetadataImage {
            inodes,
            directories,
            files,
            symlinks,
            blocks,
        } = image;

        validate_block_index(&blocks, blocks_len)?;
        validate_inodes(&inodes)?;
        let kind_of = |ino: InodeNumber| -> Result<FileKind> {
            ino.to_index()
                .ok()
                .and_then(|idx| inodes.get(idx))
                .map(|inode| inode.kind)
                .ok_or_else(|| corrupt(format!("reference to missing inode {ino}")))
        };

        let mut dir_map = HashMap::with_capacity(directories.len());
        for dir in directories {
            if kind_of(dir.ino)? != FileKind::Directory {
                return Err(corrupt(format!("directory record for non-directory {}", dir.ino)));
            }
            if kind_of(dir.parent)? != FileKind::Directory {
                return Err(corrupt(format!("directory {} has non-directory parent", dir.ino)));
            }
            if dir.ino == InodeNumber::ROOT && dir.parent != InodeNumber::ROOT {
                return Err(corrupt("root directory must be its own parent"));
            }
            validate_entries(dir.ino, &dir.entries, &kind_of)?;
            let ino = dir.ino;
            let previous = dir_map.insert(
                ino,
                Directory {
                    parent: dir.parent,
                    entries: dir.entries,
                },
            );
            if previous.is_some() {
                return Err(corrupt(format!("duplicate directory record for {ino}")));
            }
        }
        validate_tree(&inodes, &dir_map)?;

        let mut file_map = HashMap::with_capacity(files.len());
        let mut total_file_bytes = 0_u64;
        for file in files {
            if kind_of(file.ino)? != FileKind::RegularFile {
                return Err(corrupt(format!("chunk list for non-regular inode {}", file.ino)));
            }
            let ends = validate_chunks(file.ino, &file.chunks, &blocks)?;
            let declared = inodes[file.ino.to_index().map_err(|e| corrupt(e.to_string()))?].size;
            let actual = ends.last().copied().unwrap_or(0);
            if actual != declared {
                return Err(corrupt(format!(
                    "inode {} chunks sum to {actual} bytes, size is {declared}",
                    file.ino
                )));
            }
            total_file_bytes = total_file_bytes.saturating_add(declared);
            if file_map
                .insert(
                    file.ino,
                    FileChunkIndex {
                        chunks: file.chunks,
                        ends,
                    },
                )
                .is_some()
            {
                return Err(corrupt(format!("duplicate chunk list for {}", file.ino)));
            }
        }

        let mut link_map = HashMap::with_capacity(symlinks.len());
        for link in symlinks {
            if kind_of(link.ino)? != FileKind::Symlink {
                return Err(corrupt(format!("symlink target for non-symlink {}", link.ino)));
            }
            if link.target.is_empty() {
                return Err(corrupt(format!("symlink {} has an empty target", link.ino)));
            }
            if link_map.insert(link.ino, link.target).is_some() {
                return Err(corrupt(format!("duplicate symlink record for {}", link.ino)));
            }
        }

        for (idx, inode) in inodes.iter().enumerate() {
            let ino = InodeNumber(idx as u64);
            match inode.kind {
                FileKind::Directory if !dir_map.contains_key(&ino) => {
                    return Err(corrupt(format!("directory {ino} has no entry table")));
                }
                FileKind::RegularFile if !file_map.contains_key(&ino) && inode.size != 0 => {
                    return Err(corrupt(format!("file {ino} of size {} has no chunks", inode.size)));
                }
                FileKind::Symlink => match link_map.get(&ino) {
                    None => return Err(corrupt(format!("symlink {ino} has no target"))),
                    Some(target) if target.len() as u64 != inode.size => {
                        return Err(corrupt(format!("symlink {ino} size disagrees with target")));
                    }
                    Some(_) => {}
                },
                _ => {}
            }
        }

        debug!(
            target: "dfs::meta",
            inodes = inodes.len(),
            directories = dir_map.len(),
            files = file_map.len(),
            symlinks = link_map.len(),
            blocks = blocks.len(),
            "metadata_loaded"
        );

        Ok(Self {
            inodes,
            directories: dir_map,
            files: file_map,
            symlinks: link_map,
            blocks,
            total_file_bytes,
        })
    }

    #[must_use]
    pub fn inode_count(&self) -> u64 {
        self.inodes.len() as u64
    }

    #[must_use]
    pub fn block_index(&self) -> &[BlockIndexEntry] {
        &self.blocks
    }

    /// Sum of all regular file sizes (logical, before dedup).
    #[must_use]
    pub fn total_file_bytes(&self) -> u64 {
        self.total_file_bytes
    }

    pub fn inode(&self, ino: InodeNumber) -> Result<&InodeRecord> {
        ino.to_index()
            .ok()
            .and_then(|idx| self.inodes.get(idx))
            .ok_or_else(|| DfsError::NotFound(format!("inode {ino}")))
    }

    /// Entries of directory `ino`, sorted by name bytes.
    pub fn list_children(&self, ino: InodeNumber) -> Result<&[DirEntryRecord]> {
        Ok(&self.directory(ino)?.entries)
    }

    /// Parent of directory `ino`; the root is its own parent.
    pub fn parent_of(&self, ino: InodeNumber) -> Result<InodeNumber> {
        Ok(self.directory(ino)?.parent)
    }

    /// Look up `name` in directory `parent` by binary search.
    pub fn lookup_child(&self, parent: InodeNumber, name: &[u8]) -> Result<InodeNumber> {
        let entries = &self.directory(parent)?.entries;
        entries
            .binary_search_by(|entry| entry.name.as_slice().cmp(name))
            .map(|idx| entries[idx].child)
            .map_err(|_| DfsError::NotFound(String::from_utf8_lossy(name).into_owned()))
    }

    /// Ordered chunk list of regular file `ino`.
    pub fn get_chunks(&self, ino: InodeNumber) -> Result<&[Chunk]> {
        Ok(self.layout(ino)?.chunks)
    }

    /// Chunk list plus prefix sums, for offset lookups.
    pub fn layout(&self, ino: InodeNumber) -> Result<FileLayout<'_>> {
        match self.inode(ino)?.kind {
            FileKind::RegularFile => {}
            FileKind::Directory => return Err(DfsError::IsDirectory),
            _ => return Err(DfsError::NotRegularFile),
        }
        Ok(self.files.get(&ino).map_or(
            FileLayout {
                chunks: &[],
                ends: &[],
            },
            |f| FileLayout {
                chunks: &f.chunks,
                ends: &f.ends,
            },
        ))
    }

    /// Raw target bytes of symlink `ino`.
    pub fn readlink(&self, ino: InodeNumber) -> Result<&[u8]> {
        if self.inode(ino)?.kind != FileKind::Symlink {
            return Err(DfsError::NotSymlink);
        }
        self.symlinks
            .get(&ino)
            .map(Vec::as_slice)
            .ok_or(DfsError::NotSymlink)
    }

    fn directory(&self, ino: InodeNumber) -> Result<&Directory> {
        let inode = self.inode(ino)?;
        if inode.kind != FileKind::Directory {
            return Err(DfsError::NotDirectory);
        }
        self.directories.get(&ino).ok_or(DfsError::NotDirectory)
    }
}

fn validate_block_index(blocks: &[BlockIndexEntry], blocks_len: u64) -> Result<()> {
    for (id, entry) in blocks.iter().enumerate() {
        let end = entry
            .offset
            .checked_add(u64::from(entry.frame_len))
            .ok_or_else(|| corrupt(format!("block {id} offset overflows")))?;
        if end > blocks_len {
            return Err(corrupt(format!(
                "block {id} frame [{}, {end}) exceeds block section of {blocks_len} bytes",
                entry.offset
            )));
        }
        if (entry.frame_len as usize) < FRAME_HEADER_SIZE {
            return Err(corrupt(format!("block {id} frame shorter than its header")));
        }
        if entry.uncompressed_size > MAX_BLOCK_SIZE {
            return Err(corrupt(format!(
                "block {id} declares {} uncompressed bytes, above the {MAX_BLOCK_SIZE} byte limit",
                entry.uncompressed_size
            )));
        }
    }
    Ok(())
}

fn validate_inodes(inodes: &[InodeRecord]) -> Result<()> {
    let Some(root) = inodes.first() else {
        return Err(corrupt("inode table is empty"));
    };
    if root.kind != FileKind::Directory {
        return Err(corrupt("inode 0 is not a directory"));
    }
    for (idx, inode) in inodes.iter().enumerate() {
        if FileKind::from_mode(inode.mode) != Some(inode.kind) {
            return Err(corrupt(format!(
                "inode {idx} mode {:#o} disagrees with kind {:?}",
                inode.mode, inode.kind
            )));
        }
        if inode.kind == FileKind::Directory && inode.size != 0 {
            return Err(corrupt(format!("directory {idx} has non-zero size")));
        }
    }
    Ok(())
}

fn validate_entries(
    dir: InodeNumber,
    entries: &[DirEntryRecord],
    kind_of: &impl Fn(InodeNumber) -> Result<FileKind>,
) -> Result<()> {
    let mut previous: Option<&[u8]> = None;
    for entry in entries {
        let name = entry.name.as_slice();
        if name.is_empty() || name == b"." || name == b".." {
            return Err(corrupt(format!("directory {dir} has a reserved or empty name")));
        }
        if name.iter().any(|&b| b == b'/' || b == 0) {
            return Err(corrupt(format!(
                "directory {dir} entry {:?} contains '/' or NUL",
                String::from_utf8_lossy(name)
            )));
        }
        if previous.is_some_and(|prev| prev >= name) {
            return Err(corrupt(format!(
                "directory {dir} entries not strictly sorted at {:?}",
                String::from_utf8_lossy(name)
            )));
        }
        if entry.child == InodeNumber::ROOT {
            return Err(corrupt(format!("directory {dir} lists the root as a child")));
        }
        kind_of(entry.child)?;
        previous = Some(name);
    }
    Ok(())
}

/// Each directory other than the root appears in exactly one listing, the
/// one of its recorded parent.
fn validate_tree(inodes: &[InodeRecord], dirs: &HashMap<InodeNumber, Directory>) -> Result<()> {
    let is_dir = |ino: InodeNumber| {
        ino.to_index()
            .ok()
            .and_then(|idx| inodes.get(idx))
            .is_some_and(|inode| inode.kind == FileKind::Directory)
    };

    let mut listed_under: HashMap<InodeNumber, InodeNumber> = HashMap::new();
    for (&ino, dir) in dirs {
        for entry in dir.entries.iter().filter(|e| is_dir(e.child)) {
            if listed_under.insert(entry.child, ino).is_some() {
                return Err(corrupt(format!("directory {} is linked twice", entry.child)));
            }
        }
    }
    for (child, listed) in listed_under {
        let recorded = dirs.get(&child).map(|d| d.parent);
        if recorded != Some(listed) {
            return Err(corrupt(format!(
                "directory {child} listed under {listed} but records another parent"
            )));
        }
    }
    Ok(())
}

fn validate_chunks(
    ino: InodeNumber,
    chunks: &[Chunk],
    blocks: &[BlockIndexEntry],
) -> Result<Vec<u64>> {
    let mut ends = Vec::with_capacity(chunks.len());
    let mut pos = 0_u64;
    for (idx, chunk) in chunks.iter().enumerate() {
        let block = blocks.get(chunk.block.index()).ok_or_else(|| {
            corrupt(format!(
                "inode {ino} chunk {idx} references missing block {}",
                chunk.block
            ))
        })?;
        let in_bounds = chunk
            .end()
            .is_some_and(|end| end <= block.uncompressed_size);
        if !in_bounds {
            return Err(corrupt(format!(
                "inode {ino} chunk {idx} [{}, +{}) exceeds block {} of {} bytes",
                chunk.offset, chunk.length, chunk.block, block.uncompressed_size
            )));
        }
        if chunk.length == 0 {
            return Err(corrupt(format!("inode {ino} chunk {idx} is empty")));
        }
        pos += u64::from(chunk.length);
        ends.push(pos);
    }
    Ok(ends)
}
