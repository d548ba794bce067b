//! Read path: byte ranges of a file to block cache requests.

use dfs_block::{BlockCache, BlockRef};
use dfs_error::{DfsError, Result};
use dfs_meta::MetadataStore;
use dfs_types::{BlockId, InodeNumber};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tracing::trace;

/// Cheap, cloneable handle for serving reads from many threads.
#[derive(Debug, Clone)]
pub struct Reader {
    meta: Arc<MetadataStore>,
    cache: Arc<BlockCache>,
}

impl Reader {
    #[must_use]
    pub fn new(meta: Arc<MetadataStore>, cache: Arc<BlockCache>) -> Self {
        Self { meta, cache }
    }

    /// Read up to `length` bytes of `ino` starting at `offset`.
    ///
    /// Negative arguments are [`DfsError::InvalidRange`]. A range running
    /// past end-of-file is clamped and returns fewer bytes; a start at or
    /// beyond end-of-file returns an empty buffer.
    pub fn read(&self, ino: InodeNumber, offset: i64, length: i64) -> Result<Vec<u8>> {
        let (Ok(start), Ok(length)) = (u64::try_from(offset), u64::try_from(length)) else {
            return Err(DfsError::InvalidRange { offset, length });
        };
        let layout = self.meta.layout(ino)?;
        let size = layout.size();
        if start >= size || length == 0 {
            return Ok(Vec::new());
        }
        let end = start.saturating_add(length).min(size);

        let Some(mut idx) = layout.chunk_at(start) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(usize::try_from(end - start).unwrap_or(0));
        // One cache request per distinct block, held until the copy is done.
        let mut blocks: HashMap<BlockId, BlockRef> = HashMap::new();
        let mut pos = start;
        while pos < end {
            let chunk = layout.chunks[idx];
            let within = pos - layout.chunk_start(idx);
            let take = (u64::from(chunk.length) - within).min(end - pos);

            let block: &BlockRef = match blocks.entry(chunk.block) {
                Entry::Occupied(held) => held.into_mut(),
                Entry::Vacant(slot) => slot.insert(self.cache.get_block(chunk.block)?),
            };
            let from = u64::from(chunk.offset) + within;
            let slice = usize::try_from(from)
                .ok()
                .zip(usize::try_from(take).ok())
                .and_then(|(from, take)| block.get(from..from.checked_add(take)?))
                .ok_or_else(|| DfsError::CorruptBlock {
                    block: chunk.block.0,
                    detail: format!(
                        "chunk [{}, +{}) outside decoded payload of {} bytes",
                        chunk.offset,
                        chunk.length,
                        block.len()
                    ),
                })?;
            out.extend_from_slice(slice);
            pos += take;
            idx += 1;
        }

        trace!(
            target: "dfs::image",
            ino = ino.0,
            offset = start,
            requested = length,
            returned = out.len(),
            blocks = blocks.len(),
            "read"
        );
        Ok(out)
    }

    #[must_use]
    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.meta
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }
}
