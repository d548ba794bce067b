//! Path resolution and tree traversal.

use crate::MetadataStore;
use dfs_error::{DfsError, Result};
use dfs_types::{FileKind, InodeNumber, MAX_SYMLINK_HOPS};
use tracing::trace;

/// One node visited by [`MetadataStore::walk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Absolute path inside the image, `/`-separated; the root is `/`.
    pub path: Vec<u8>,
    pub ino: InodeNumber,
    pub kind: FileKind,
}

impl WalkEntry {
    #[must_use]
    pub fn path_str(&self) -> String {
        String::from_utf8_lossy(&self.path).into_owned()
    }
}

/// Remaining components, in reverse so the next one is at the end.
fn push_components(stack: &mut Vec<Vec<u8>>, path: &[u8]) {
    stack.extend(
        path.split(|&b| b == b'/')
            .filter(|c| !c.is_empty())
            .rev()
            .map(<[u8]>::to_vec),
    );
}

impl MetadataStore {
    /// Resolve `path` from the root, following symlinks in every component
    /// including the last one.
    pub fn resolve(&self, path: impl AsRef<[u8]>) -> Result<InodeNumber> {
        self.resolve_inner(path.as_ref(), true)
    }

    /// Resolve `path` without following a symlink in the final component.
    pub fn resolve_nofollow(&self, path: impl AsRef<[u8]>) -> Result<InodeNumber> {
        self.resolve_inner(path.as_ref(), false)
    }

    /// Iterative walk with a bounded hop counter. Relative link targets
    /// continue from the link's directory, absolute ones from the root, and
    /// `..` at the root stays at the root.
    fn resolve_inner(&self, path: &[u8], follow_final: bool) -> Result<InodeNumber> {
        let mut pending = Vec::new();
        push_components(&mut pending, path);

        let mut cur = InodeNumber::ROOT;
        let mut hops = 0_u32;
        while let Some(component) = pending.pop() {
            match component.as_slice() {
                b"." => continue,
                b".." => {
                    cur = self.parent_of(cur)?;
                    continue;
                }
                _ => {}
            }

            let child = self.lookup_child(cur, &component)?;
            let is_last = pending.is_empty();
            if self.inode(child)?.kind == FileKind::Symlink && (follow_final || !is_last) {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(DfsError::Loop {
                        path: String::from_utf8_lossy(path).into_owned(),
                        hops,
                    });
                }
                let target = self.readlink(child)?;
                trace!(
                    target: "dfs::meta",
                    link = child.0,
                    hops,
                    "symlink_followed"
                );
                if target.first() == Some(&b'/') {
                    cur = InodeNumber::ROOT;
                }
                push_components(&mut pending, target);
            } else {
                cur = child;
            }
        }
        Ok(cur)
    }

    /// Depth-first, pre-order traversal of the whole tree in name order.
    pub fn walk(&self) -> Result<Vec<WalkEntry>> {
        let mut out = Vec::with_capacity(usize::try_from(self.inode_count()).unwrap_or(0));
        let mut stack = vec![(b"/".to_vec(), InodeNumber::ROOT)];
        while let Some((path, ino)) = stack.pop() {
            let kind = self.inode(ino)?.kind;
            if kind == FileKind::Directory {
                for entry in self.list_children(ino)?.iter().rev() {
                    let mut child_path = path.clone();
                    if child_path.len() > 1 {
                        child_path.push(b'/');
                    }
                    child_path.extend_from_slice(&entry.name);
                    stack.push((child_path, entry.child));
                }
            }
            out.push(WalkEntry { path, ino, kind });
        }
        Ok(out)
    }
}
