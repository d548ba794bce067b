//! Metadata section encoding.
//!
//! The section is self-describing: a small preamble followed by tagged,
//! length-prefixed sub-sections. Readers skip tags they do not know, so a
//! minor format revision can append sections without breaking old readers.
//!
//! ```text
//! "DFSM" | version u16 | section_count u16 | { tag u16 | reserved u16 | len u32 | payload }*
//! ```
//!
//! This module only checks structure. Cross-table consistency (chunk bounds,
//! dangling children, sizes) is validated when the metadata store loads.

use dfs_types::{
    BlockId, Chunk, FileKind, InodeNumber, METADATA_MAGIC, METADATA_VERSION, ParseError,
    ensure_slice, read_fixed, read_le_i64, read_le_u16, read_le_u32, read_le_u64, read_u8,
    u64_to_usize, usize_to_u32,
};
use serde::{Deserialize, Serialize};

const PREAMBLE_LEN: usize = 8;
const SECTION_HEADER_LEN: usize = 8;
const INODE_RECORD_LEN: usize = 60;
const CHUNK_RECORD_LEN: usize = 12;
const BLOCK_INDEX_RECORD_LEN: usize = 16;

/// Sub-section tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SectionTag {
    Inodes = 1,
    Directories = 2,
    Chunks = 3,
    Symlinks = 4,
    BlockIndex = 5,
}

impl SectionTag {
    fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Inodes),
            2 => Some(Self::Directories),
            3 => Some(Self::Chunks),
            4 => Some(Self::Symlinks),
            5 => Some(Self::BlockIndex),
            _ => None,
        }
    }
}

/// One inode; its number is its position in [`MetadataImage::inodes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub kind: FileKind,
    /// Full mode including `S_IF*` bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub rdev: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryRecord {
    pub name: Vec<u8>,
    pub child: InodeNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub ino: InodeNumber,
    pub parent: InodeNumber,
    /// Sorted by name bytes.
    pub entries: Vec<DirEntryRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunks {
    pub ino: InodeNumber,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkRecord {
    pub ino: InodeNumber,
    pub target: Vec<u8>,
}

/// Physical location of one block frame, indexed by block id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndexEntry {
    /// Offset of the frame relative to the start of the block section.
    pub offset: u64,
    pub frame_len: u32,
    pub uncompressed_size: u32,
}

/// Decoded metadata section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataImage {
    pub inodes: Vec<InodeRecord>,
    pub directories: Vec<DirectoryRecord>,
    pub files: Vec<FileChunks>,
    pub symlinks: Vec<SymlinkRecord>,
    pub blocks: Vec<BlockIndexEntry>,
}

impl MetadataImage {
    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let sections = [
            (SectionTag::Inodes, self.encode_inodes()?),
            (SectionTag::Directories, self.encode_directories()?),
            (SectionTag::Chunks, self.encode_chunks()?),
            (SectionTag::Symlinks, self.encode_symlinks()?),
            (SectionTag::BlockIndex, self.encode_block_index()?),
        ];

        let body_len: usize = sections
            .iter()
            .map(|(_, payload)| SECTION_HEADER_LEN + payload.len())
            .sum();
        let mut out = Vec::with_capacity(PREAMBLE_LEN + body_len);
        out.extend_from_slice(&METADATA_MAGIC);
        out.extend_from_slice(&METADATA_VERSION.to_le_bytes());
        let count = u16::try_from(sections.len()).map_err(|_| ParseError::IntegerConversion {
            field: "section_count",
        })?;
        out.extend_from_slice(&count.to_le_bytes());
        for (tag, payload) in &sections {
            out.extend_from_slice(&(*tag as u16).to_le_bytes());
            out.extend_from_slice(&0_u16.to_le_bytes());
            out.extend_from_slice(&usize_to_u32(payload.len(), "section_len")?.to_le_bytes());
            out.extend_from_slice(payload);
        }
        Ok(out)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic: [u8; 4] = read_fixed(bytes, 0)?;
        if magic != METADATA_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(u32::from_le_bytes(METADATA_MAGIC)),
                actual: u64::from(u32::from_le_bytes(magic)),
            });
        }
        if read_le_u16(bytes, 4)? != METADATA_VERSION {
            return Err(ParseError::InvalidField {
                field: "metadata_version",
                reason: "unsupported metadata version",
            });
        }
        let section_count = read_le_u16(bytes, 6)?;

        let mut image = Self::default();
        let mut seen = [false; 6];
        let mut pos = PREAMBLE_LEN;
        for _ in 0..section_count {
            let raw_tag = read_le_u16(bytes, pos)?;
            let len = read_le_u32(bytes, pos + 4)? as usize;
            let payload = ensure_slice(bytes, pos + SECTION_HEADER_LEN, len)?;
            pos += SECTION_HEADER_LEN + len;

            let Some(tag) = SectionTag::from_raw(raw_tag) else {
                continue;
            };
            let slot = &mut seen[tag as usize];
            if *slot {
                return Err(ParseError::InvalidField {
                    field: "section_tag",
                    reason: "duplicate section",
                });
            }
            *slot = true;

            match tag {
                SectionTag::Inodes => image.inodes = parse_inodes(payload)?,
                SectionTag::Directories => image.directories = parse_directories(payload)?,
                SectionTag::Chunks => image.files = parse_chunks(payload)?,
                SectionTag::Symlinks => image.symlinks = parse_symlinks(payload)?,
                SectionTag::BlockIndex => image.blocks = parse_block_index(payload)?,
            }
        }

        if pos != bytes.len() {
            return Err(ParseError::InvalidField {
                field: "metadata_len",
                reason: "trailing bytes after last section",
            });
        }
        if !seen[SectionTag::Inodes as usize] || !seen[SectionTag::Directories as usize] {
            return Err(ParseError::InvalidField {
                field: "section_tag",
                reason: "missing inode or directory section",
            });
        }
        Ok(image)
    }

    fn encode_inodes(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::with_capacity(4 + self.inodes.len() * INODE_RECORD_LEN);
        put_count(&mut out, self.inodes.len(), "inode_count")?;
        for inode in &self.inodes {
            out.push(inode.kind.to_raw());
            out.extend_from_slice(&[0_u8; 3]);
            out.extend_from_slice(&inode.mode.to_le_bytes());
            out.extend_from_slice(&inode.uid.to_le_bytes());
            out.extend_from_slice(&inode.gid.to_le_bytes());
            out.extend_from_slice(&inode.nlink.to_le_bytes());
            out.extend_from_slice(&inode.size.to_le_bytes());
            out.extend_from_slice(&inode.rdev.to_le_bytes());
            out.extend_from_slice(&inode.atime.to_le_bytes());
            out.extend_from_slice(&inode.mtime.to_le_bytes());
            out.extend_from_slice(&inode.ctime.to_le_bytes());
        }
        Ok(out)
    }

    fn encode_directories(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::new();
        put_count(&mut out, self.directories.len(), "directory_count")?;
        for dir in &self.directories {
            out.extend_from_slice(&dir.ino.0.to_le_bytes());
            out.extend_from_slice(&dir.parent.0.to_le_bytes());
            put_count(&mut out, dir.entries.len(), "entry_count")?;
            for entry in &dir.entries {
                let name_len = u16::try_from(entry.name.len())
                    .map_err(|_| ParseError::IntegerConversion { field: "name_len" })?;
                out.extend_from_slice(&name_len.to_le_bytes());
                out.extend_from_slice(&entry.name);
                out.extend_from_slice(&entry.child.0.to_le_bytes());
            }
        }
        Ok(out)
    }

    fn encode_chunks(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::new();
        put_count(&mut out, self.files.len(), "file_count")?;
        for file in &self.files {
            out.extend_from_slice(&file.ino.0.to_le_bytes());
            put_count(&mut out, file.chunks.len(), "chunk_count")?;
            for chunk in &file.chunks {
                out.extend_from_slice(&chunk.block.0.to_le_bytes());
                out.extend_from_slice(&chunk.offset.to_le_bytes());
                out.extend_from_slice(&chunk.length.to_le_bytes());
            }
        }
        Ok(out)
    }

    fn encode_symlinks(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::new();
        put_count(&mut out, self.symlinks.len(), "symlink_count")?;
        for link in &self.symlinks {
            out.extend_from_slice(&link.ino.0.to_le_bytes());
            put_count(&mut out, link.target.len(), "target_len")?;
            out.extend_from_slice(&link.target);
        }
        Ok(out)
    }

    fn encode_block_index(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::with_capacity(4 + self.blocks.len() * BLOCK_INDEX_RECORD_LEN);
        put_count(&mut out, self.blocks.len(), "block_count")?;
        for entry in &self.blocks {
            out.extend_from_slice(&entry.offset.to_le_bytes());
            out.extend_from_slice(&entry.frame_len.to_le_bytes());
            out.extend_from_slice(&entry.uncompressed_size.to_le_bytes());
        }
        Ok(out)
    }
}

fn put_count(out: &mut Vec<u8>, count: usize, field: &'static str) -> Result<(), ParseError> {
    out.extend_from_slice(&usize_to_u32(count, field)?.to_le_bytes());
    Ok(())
}

/// Sequential reader over a section payload.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        let v = read_u8(self.data, self.pos)?;
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        let v = read_le_u16(self.data, self.pos)?;
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        let v = read_le_u32(self.data, self.pos)?;
        self.pos += 4;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64, ParseError> {
        let v = read_le_u64(self.data, self.pos)?;
        self.pos += 8;
        Ok(v)
    }

    fn i64(&mut self) -> Result<i64, ParseError> {
        let v = read_le_i64(self.data, self.pos)?;
        self.pos += 8;
        Ok(v)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        let v = ensure_slice(self.data, self.pos, len)?;
        self.pos += len;
        Ok(v)
    }

    fn skip(&mut self, len: usize) -> Result<(), ParseError> {
        self.bytes(len).map(|_| ())
    }

    /// Read a record count and pre-size a vector without trusting it blindly.
    fn counted<T>(&mut self, min_record_len: usize) -> Result<(usize, Vec<T>), ParseError> {
        let count = self.u32()? as usize;
        let plausible = self.remaining() / min_record_len.max(1);
        if count > plausible {
            return Err(ParseError::InsufficientData {
                needed: count.saturating_mul(min_record_len),
                offset: self.pos,
                actual: self.remaining(),
            });
        }
        Ok((count, Vec::with_capacity(count)))
    }

    fn finish(&self, field: &'static str) -> Result<(), ParseError> {
        if self.remaining() != 0 {
            return Err(ParseError::InvalidField {
                field,
                reason: "trailing bytes in section",
            });
        }
        Ok(())
    }
}

fn parse_inodes(payload: &[u8]) -> Result<Vec<InodeRecord>, ParseError> {
    let mut cur = Cursor::new(payload);
    let (count, mut out) = cur.counted(INODE_RECORD_LEN)?;
    for _ in 0..count {
        let kind = FileKind::from_raw(cur.u8()?)?;
        cur.skip(3)?;
        out.push(InodeRecord {
            kind,
            mode: cur.u32()?,
            uid: cur.u32()?,
            gid: cur.u32()?,
            nlink: cur.u32()?,
            size: cur.u64()?,
            rdev: cur.u64()?,
            atime: cur.i64()?,
            mtime: cur.i64()?,
            ctime: cur.i64()?,
        });
    }
    cur.finish("inodes")?;
    Ok(out)
}

fn parse_directories(payload: &[u8]) -> Result<Vec<DirectoryRecord>, ParseError> {
    let mut cur = Cursor::new(payload);
    let (count, mut out) = cur.counted(20)?;
    for _ in 0..count {
        let ino = InodeNumber(cur.u64()?);
        let parent = InodeNumber(cur.u64()?);
        let (entry_count, mut entries) = cur.counted(10)?;
        for _ in 0..entry_count {
            let name_len = usize::from(cur.u16()?);
            let name = cur.bytes(name_len)?.to_vec();
            let child = InodeNumber(cur.u64()?);
            entries.push(DirEntryRecord { name, child });
        }
        out.push(DirectoryRecord {
            ino,
            parent,
            entries,
        });
    }
    cur.finish("directories")?;
    Ok(out)
}

fn parse_chunks(payload: &[u8]) -> Result<Vec<FileChunks>, ParseError> {
    let mut cur = Cursor::new(payload);
    let (count, mut out) = cur.counted(12)?;
    for _ in 0..count {
        let ino = InodeNumber(cur.u64()?);
        let (chunk_count, mut chunks) = cur.counted(CHUNK_RECORD_LEN)?;
        for _ in 0..chunk_count {
            chunks.push(Chunk {
                block: BlockId(cur.u32()?),
                offset: cur.u32()?,
                length: cur.u32()?,
            });
        }
        out.push(FileChunks { ino, chunks });
    }
    cur.finish("chunks")?;
    Ok(out)
}

fn parse_symlinks(payload: &[u8]) -> Result<Vec<SymlinkRecord>, ParseError> {
    let mut cur = Cursor::new(payload);
    let (count, mut out) = cur.counted(12)?;
    for _ in 0..count {
        let ino = InodeNumber(cur.u64()?);
        let len = u64_to_usize(u64::from(cur.u32()?), "target_len")?;
        let target = cur.bytes(len)?.to_vec();
        out.push(SymlinkRecord { ino, target });
    }
    cur.finish("symlinks")?;
    Ok(out)
}

fn parse_block_index(payload: &[u8]) -> Result<Vec<BlockIndexEntry>, ParseError> {
    let mut cur = Cursor::new(payload);
    let (count, mut out) = cur.counted(BLOCK_INDEX_RECORD_LEN)?;
    for _ in 0..count {
        out.push(BlockIndexEntry {
            offset: cur.u64()?,
            frame_len: cur.u32()?,
            uncompressed_size: cur.u32()?,
        });
    }
    cur.finish("block_index")?;
    Ok(out)
}
