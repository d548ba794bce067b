//! In-memory file tree assembled while building.
//!
//! Paths are byte strings split on `/`. Empty components and `.` are
//! ignored, `..` is rejected. Missing parent directories are created
//! implicitly and may later be given explicit attributes.

use dfs_error::{DfsError, Result};
use dfs_ondisk::{
    BlockIndexEntry, DirEntryRecord, DirectoryRecord, FileChunks, InodeRecord, MetadataImage,
    SymlinkRecord,
};
use dfs_types::{Chunk, FileKind, InodeNumber, S_IPERM};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const NAME_MAX: usize = 255;
const ROOT: usize = 0;

/// Ownership, permissions and timestamps of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttrs {
    /// Permission bits; file type bits are ignored.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl NodeAttrs {
    #[must_use]
    pub const fn with_mode(mode: u32) -> Self {
        Self {
            mode,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
        }
    }

    #[must_use]
    pub const fn file() -> Self {
        Self::with_mode(0o644)
    }

    #[must_use]
    pub const fn directory() -> Self {
        Self::with_mode(0o755)
    }

    #[must_use]
    pub const fn symlink() -> Self {
        Self::with_mode(0o777)
    }
}

impl Default for NodeAttrs {
    fn default() -> Self {
        Self::file()
    }
}

#[derive(Debug)]
pub(crate) enum Body {
    Directory {
        entries: BTreeMap<Vec<u8>, usize>,
        implicit: bool,
    },
    File {
        chunks: Vec<Chunk>,
        size: u64,
    },
    Symlink(Vec<u8>),
    Special {
        kind: FileKind,
        rdev: u64,
    },
}

impl Body {
    fn kind(&self) -> FileKind {
        match self {
            Self::Directory { .. } => FileKind::Directory,
            Self::File { .. } => FileKind::RegularFile,
            Self::Symlink(_) => FileKind::Symlink,
            Self::Special { kind, .. } => *kind,
        }
    }
}

#[derive(Debug)]
struct Node {
    parent: usize,
    attrs: NodeAttrs,
    body: Body,
}

/// Free name in an existing directory, reserved by [`Namespace::vacancy`].
#[derive(Debug)]
pub(crate) struct Slot {
    parent: usize,
    name: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct Namespace {
    nodes: Vec<Node>,
}

fn display(path: &[u8]) -> String {
    String::from_utf8_lossy(path).into_owned()
}

fn components(path: &[u8]) -> Result<Vec<&[u8]>> {
    let mut out = Vec::new();
    for part in path.split(|&b| b == b'/') {
        match part {
            b"" | b"." => {}
            b".." => {
                return Err(DfsError::InvalidPath(format!(
                    "{}: '..' components are not allowed",
                    display(path)
                )));
            }
            name if name.contains(&0) => {
                return Err(DfsError::InvalidPath(format!(
                    "{}: name contains NUL",
                    display(path)
                )));
            }
            name if name.len() > NAME_MAX => {
                return Err(DfsError::InvalidPath(format!(
                    "{}: component longer than {NAME_MAX} bytes",
                    display(path)
                )));
            }
            name => out.push(name),
        }
    }
    Ok(out)
}

impl Namespace {
    pub(crate) fn new() -> Self {
        Self {
            nodes: vec![Node {
                parent: ROOT,
                attrs: NodeAttrs::directory(),
                body: Body::Directory {
                    entries: BTreeMap::new(),
                    implicit: true,
                },
            }],
        }
    }

    fn child(&self, dir: usize, name: &[u8]) -> Option<usize> {
        match &self.nodes[dir].body {
            Body::Directory { entries, .. } => entries.get(name).copied(),
            _ => None,
        }
    }

    fn push(&mut self, parent: usize, name: Vec<u8>, attrs: NodeAttrs, body: Body) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(Node {
            parent,
            attrs,
            body,
        });
        if let Body::Directory { entries, .. } = &mut self.nodes[parent].body {
            entries.insert(name, idx);
        }
        idx
    }

    /// Walk `dirs`, creating implicit directories where missing.
    fn ensure_dirs(&mut self, dirs: &[&[u8]], path: &[u8]) -> Result<usize> {
        let mut current = ROOT;
        for name in dirs {
            current = match self.child(current, name) {
                Some(idx) if self.nodes[idx].body.kind() == FileKind::Directory => idx,
                Some(_) => {
                    return Err(DfsError::InvalidPath(format!(
                        "{}: {} is not a directory",
                        display(path),
                        display(name)
                    )));
                }
                None => self.push(
                    current,
                    name.to_vec(),
                    NodeAttrs::directory(),
                    Body::Directory {
                        entries: BTreeMap::new(),
                        implicit: true,
                    },
                ),
            };
        }
        Ok(current)
    }

    /// Reserve `path` for a new non-directory node.
    pub(crate) fn vacancy(&mut self, path: &[u8]) -> Result<Slot> {
        let parts = components(path)?;
        let Some((name, dirs)) = parts.split_last() else {
            return Err(DfsError::InvalidPath(format!(
                "{}: path names the root",
                display(path)
            )));
        };
        let parent = self.ensure_dirs(dirs, path)?;
        if self.child(parent, name).is_some() {
            return Err(DfsError::Exists(display(path)));
        }
        Ok(Slot {
            parent,
            name: name.to_vec(),
        })
    }

    pub(crate) fn insert(&mut self, slot: Slot, attrs: NodeAttrs, body: Body) {
        self.push(slot.parent, slot.name, attrs, body);
    }

    /// Create a directory, or give an implicitly created one its
    /// attributes. The empty path and `/` address the root.
    pub(crate) fn add_directory(&mut self, path: &[u8], attrs: NodeAttrs) -> Result<()> {
        let parts = components(path)?;
        let target = match parts.split_last() {
            None => ROOT,
            Some((name, dirs)) => {
                let parent = self.ensure_dirs(dirs, path)?;
                match self.child(parent, name) {
                    Some(idx) => idx,
                    None => {
                        self.push(
                            parent,
                            name.to_vec(),
                            attrs,
                            Body::Directory {
                                entries: BTreeMap::new(),
                                implicit: false,
                            },
                        );
                        return Ok(());
                    }
                }
            }
        };
        let node = &mut self.nodes[target];
        match &mut node.body {
            Body::Directory { implicit, .. } if *implicit => {
                *implicit = false;
                node.attrs = attrs;
                Ok(())
            }
            _ => Err(DfsError::Exists(display(path))),
        }
    }

    /// Replace the root's attributes regardless of how it was created.
    pub(crate) fn set_root_attrs(&mut self, attrs: NodeAttrs) {
        self.nodes[ROOT].attrs = attrs;
        if let Body::Directory { implicit, .. } = &mut self.nodes[ROOT].body {
            *implicit = false;
        }
    }

    /// Number inodes (root 0, then depth-first in name order) and emit the
    /// metadata tables.
    pub(crate) fn flatten(&self, blocks: Vec<BlockIndexEntry>) -> MetadataImage {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut ino_of = vec![InodeNumber::ROOT; self.nodes.len()];
        let mut stack = vec![ROOT];
        while let Some(idx) = stack.pop() {
            ino_of[idx] = InodeNumber(order.len() as u64);
            order.push(idx);
            if let Body::Directory { entries, .. } = &self.nodes[idx].body {
                stack.extend(entries.values().rev().copied());
            }
        }

        let mut image = MetadataImage {
            inodes: Vec::with_capacity(order.len()),
            directories: Vec::new(),
            files: Vec::new(),
            symlinks: Vec::new(),
            blocks,
        };
        for &idx in &order {
            let node = &self.nodes[idx];
            let ino = ino_of[idx];
            let kind = node.body.kind();
            let (size, rdev, nlink) = match &node.body {
                Body::Directory { entries, .. } => {
                    let subdirs = entries
                        .values()
                        .filter(|&&child| self.nodes[child].body.kind() == FileKind::Directory)
                        .count();
                    image.directories.push(DirectoryRecord {
                        ino,
                        parent: ino_of[node.parent],
                        entries: entries
                            .iter()
                            .map(|(name, &child)| DirEntryRecord {
                                name: name.clone(),
                                child: ino_of[child],
                            })
                            .collect(),
                    });
                    (0, 0, u32::try_from(subdirs + 2).unwrap_or(u32::MAX))
                }
                Body::File { chunks, size } => {
                    if !chunks.is_empty() {
                        image.files.push(FileChunks {
                            ino,
                            chunks: chunks.clone(),
                        });
                    }
                    (*size, 0, 1)
                }
                Body::Symlink(target) => {
                    image.symlinks.push(SymlinkRecord {
                        ino,
                        target: target.clone(),
                    });
                    (target.len() as u64, 0, 1)
                }
                Body::Special { rdev, .. } => (0, *rdev, 1),
            };
            image.inodes.push(InodeRecord {
                kind,
                mode: kind.mode_bits() | (node.attrs.mode & S_IPERM),
                uid: node.attrs.uid,
                gid: node.attrs.gid,
                nlink,
                size,
                rdev,
                atime: node.attrs.atime,
                mtime: node.attrs.mtime,
                ctime: node.attrs.ctime,
            });
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_types::{BlockId, S_IFDIR, S_IFREG};

    fn file(ns: &mut Namespace, path: &str, len: u32) {
        let slot = ns.vacancy(path.as_bytes()).expect("vacancy");
        let chunks = if len == 0 {
            Vec::new()
        } else {
            vec![Chunk::new(BlockId(0), 0, len)]
        };
        ns.insert(
            slot,
            NodeAttrs::file(),
            Body::File {
                chunks,
                size: u64::from(len),
            },
        );
    }

    fn names(image: &MetadataImage, dir: u64) -> Vec<(String, u64)> {
        image
            .directories
            .iter()
            .find(|d| d.ino == InodeNumber(dir))
            .expect("dir")
            .entries
            .iter()
            .map(|e| (String::from_utf8_lossy(&e.name).into_owned(), e.child.0))
            .collect()
    }

    #[test]
    fn path_components() {
        assert_eq!(
            components(b"/a//b/./c/").expect("ok"),
            vec![&b"a"[..], &b"b"[..], &b"c"[..]]
        );
        assert!(components(b"/").expect("root").is_empty());
        assert!(matches!(components(b"a/../b"), Err(DfsError::InvalidPath(_))));
        assert!(components(b"a\0b").is_err());
        assert!(components(&[b'x'; 256]).is_err());
    }

    #[test]
    fn inodes_are_numbered_depth_first_in_name_order() {
        let mut ns = Namespace::new();
        file(&mut ns, "z.txt", 1);
        file(&mut ns, "dir/b", 2);
        file(&mut ns, "dir/a", 3);
        file(&mut ns, "a.txt", 4);
        let image = ns.flatten(vec![BlockIndexEntry {
            offset: 0,
            frame_len: 20,
            uncompressed_size: 4,
        }]);

        assert_eq!(
            names(&image, 0),
            vec![("a.txt".into(), 1), ("dir".into(), 2), ("z.txt".into(), 5)]
        );
        assert_eq!(names(&image, 2), vec![("a".into(), 3), ("b".into(), 4)]);
        assert_eq!(image.inodes[2].mode, S_IFDIR | 0o755);
        assert_eq!(image.inodes[2].nlink, 2);
        assert_eq!(image.inodes[0].nlink, 3);
        assert_eq!(image.inodes[3].mode, S_IFREG | 0o644);
        assert_eq!(image.inodes[3].size, 3);
        let dir = image
            .directories
            .iter()
            .find(|d| d.ino == InodeNumber(2))
            .expect("dir");
        assert_eq!(dir.parent, InodeNumber::ROOT);
    }

    #[test]
    fn duplicates_and_file_parents_are_rejected() {
        let mut ns = Namespace::new();
        file(&mut ns, "a", 1);
        assert!(matches!(ns.vacancy(b"/a"), Err(DfsError::Exists(_))));
        assert!(matches!(ns.vacancy(b"a/b"), Err(DfsError::InvalidPath(_))));
        assert!(matches!(ns.vacancy(b"/"), Err(DfsError::InvalidPath(_))));
        assert!(matches!(
            ns.add_directory(b"a", NodeAttrs::directory()),
            Err(DfsError::Exists(_))
        ));
    }

    #[test]
    fn implicit_directories_accept_attributes_once() {
        let mut ns = Namespace::new();
        file(&mut ns, "x/y/z", 1);
        let attrs = NodeAttrs {
            uid: 42,
            ..NodeAttrs::with_mode(0o700)
        };
        ns.add_directory(b"x/y", attrs).expect("explicit");
        assert!(matches!(
            ns.add_directory(b"x/y", attrs),
            Err(DfsError::Exists(_))
        ));
        ns.add_directory(b"", NodeAttrs::with_mode(0o711)).expect("root");

        let image = ns.flatten(Vec::new());
        assert_eq!(image.inodes[0].mode, S_IFDIR | 0o711);
        assert_eq!(image.inodes[2].mode, S_IFDIR | 0o700);
        assert_eq!(image.inodes[2].uid, 42);
        assert_eq!(image.inodes[1].mode, S_IFDIR | 0o755);
    }

    #[test]
    fn empty_files_have_no_chunk_list() {
        let mut ns = Namespace::new();
        file(&mut ns, "empty", 0);
        let image = ns.flatten(Vec::new());
        assert!(image.files.is_empty());
        assert_eq!(image.inodes[1].size, 0);
    }
}
