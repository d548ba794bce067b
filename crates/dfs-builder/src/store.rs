//! Fingerprint table and block packing.
//!
//! Every candidate chunk is fingerprinted. A fingerprint hit is only reused
//! after the stored bytes compare equal to the candidate; a miss (or a
//! collision under `store_separately`) appends the candidate to the open
//! block of its category, splitting it at block boundaries.
//!
//! Block ids are assigned when a block is opened, so the content of every
//! block depends only on input order, never on compression timing. Sealed
//! payloads stay resident until finalization because later hits are
//! verified against them.

use crate::category::Category;
use crate::config::CollisionPolicy;
use dfs_error::{DfsError, Result};
use dfs_types::{BlockId, Chunk};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub(crate) type Fingerprint = blake3::Hash;

pub(crate) fn content_fingerprint(data: &[u8]) -> Fingerprint {
    blake3::hash(data)
}

#[derive(Debug)]
enum BlockBuf {
    Open(Vec<u8>),
    Sealed(Arc<[u8]>),
}

impl BlockBuf {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Open(data) => data,
            Self::Sealed(data) => data,
        }
    }
}

/// A block whose content is final and ready for compression.
#[derive(Debug, Clone)]
pub(crate) struct SealedBlock {
    pub id: BlockId,
    pub category: Category,
    pub payload: Arc<[u8]>,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StoreCounters {
    pub dedup_hits: u64,
    pub dedup_bytes: u64,
    pub collisions: u64,
    pub unique_bytes: u64,
    pub blocks_per_category: [u64; 3],
}

#[derive(Debug)]
pub(crate) struct ChunkStore {
    block_size: usize,
    policy: CollisionPolicy,
    fingerprint: fn(&[u8]) -> Fingerprint,
    /// Each fingerprint maps to the physical pieces of every distinct
    /// content stored under it (more than one only after a collision).
    table: HashMap<Fingerprint, Vec<Vec<Chunk>>>,
    blocks: Vec<BlockBuf>,
    open: [Option<BlockId>; 3],
    sealed: Vec<SealedBlock>,
    counters: StoreCounters,
}

impl ChunkStore {
    pub(crate) fn new(block_size: u32, policy: CollisionPolicy) -> Self {
        Self::with_fingerprint(block_size, policy, content_fingerprint)
    }

    pub(crate) fn with_fingerprint(
        block_size: u32,
        policy: CollisionPolicy,
        fingerprint: fn(&[u8]) -> Fingerprint,
    ) -> Self {
        Self {
            block_size: block_size as usize,
            policy,
            fingerprint,
            table: HashMap::new(),
            blocks: Vec::new(),
            open: [None; 3],
            sealed: Vec::new(),
            counters: StoreCounters::default(),
        }
    }

    pub(crate) fn counters(&self) -> StoreCounters {
        self.counters
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Store one candidate chunk and return the physical pieces holding it.
    pub(crate) fn put(&mut self, category: Category, data: &[u8]) -> Result<Vec<Chunk>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let fingerprint = (self.fingerprint)(data);
        let (hit, candidates) = match self.table.get(&fingerprint) {
            Some(known) => (
                known.iter().find(|pieces| self.matches(pieces, data)).cloned(),
                known.len(),
            ),
            None => (None, 0),
        };

        if let Some(pieces) = hit {
            self.counters.dedup_hits += 1;
            self.counters.dedup_bytes += data.len() as u64;
            trace!(
                target: "dfs::builder",
                fingerprint = %fingerprint.to_hex(),
                bytes = data.len(),
                "dedup_hit"
            );
            return Ok(pieces);
        }

        if candidates > 0 {
            let detail = format!(
                "{} new bytes differ from {candidates} stored chunk(s) with the same fingerprint",
                data.len()
            );
            match self.policy {
                CollisionPolicy::Abort => {
                    return Err(DfsError::CollisionIntegrity {
                        fingerprint: fingerprint.to_hex().to_string(),
                        detail,
                    });
                }
                CollisionPolicy::StoreSeparately => {
                    self.counters.collisions += 1;
                    warn!(
                        target: "dfs::builder",
                        fingerprint = %fingerprint.to_hex(),
                        detail = %detail,
                        "fingerprint_collision"
                    );
                }
            }
        }

        let pieces = self.append(category, data)?;
        self.table
            .entry(fingerprint)
            .or_default()
            .push(pieces.clone());
        Ok(pieces)
    }

    /// Whether the bytes behind `pieces` equal `data`.
    fn matches(&self, pieces: &[Chunk], data: &[u8]) -> bool {
        let mut rest = data;
        for piece in pieces {
            let Some(stored) = self.piece_bytes(*piece) else {
                return false;
            };
            let Some((head, tail)) = rest.split_at_checked(stored.len()) else {
                return false;
            };
            if head != stored {
                return false;
            }
            rest = tail;
        }
        rest.is_empty()
    }

    fn piece_bytes(&self, piece: Chunk) -> Option<&[u8]> {
        let start = piece.offset as usize;
        let end = start.checked_add(piece.length as usize)?;
        self.blocks.get(piece.block.index())?.bytes().get(start..end)
    }

    fn append(&mut self, category: Category, data: &[u8]) -> Result<Vec<Chunk>> {
        let mut pieces = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let id = self.open_block(category)?;
            let block_size = self.block_size;
            let buf = self.open_buf(id)?;
            let offset = buf.len();
            let take = (block_size - offset).min(rest.len());
            let (head, tail) = rest.split_at(take);
            buf.extend_from_slice(head);
            let full = buf.len() >= block_size;
            pieces.push(Chunk::new(id, to_u32(offset)?, to_u32(take)?));
            self.counters.unique_bytes += take as u64;
            rest = tail;
            if full {
                self.seal(category)?;
            }
        }
        Ok(pieces)
    }

    fn open_block(&mut self, category: Category) -> Result<BlockId> {
        if let Some(id) = self.open[category.index()] {
            return Ok(id);
        }
        let id = BlockId(
            u32::try_from(self.blocks.len())
                .map_err(|_| DfsError::Format("block id space exhausted".to_owned()))?,
        );
        self.blocks
            .push(BlockBuf::Open(Vec::with_capacity(self.block_size)));
        self.open[category.index()] = Some(id);
        self.counters.blocks_per_category[category.index()] += 1;
        trace!(target: "dfs::builder", block = id.0, category = %category, "block_opened");
        Ok(id)
    }

    fn open_buf(&mut self, id: BlockId) -> Result<&mut Vec<u8>> {
        match self.blocks.get_mut(id.index()) {
            Some(BlockBuf::Open(data)) => Ok(data),
            _ => Err(DfsError::Format(format!("block {id} is not open"))),
        }
    }

    /// Freeze the open block of `category`, if any, and queue it.
    pub(crate) fn seal(&mut self, category: Category) -> Result<()> {
        let Some(id) = self.open[category.index()].take() else {
            return Ok(());
        };
        let slot = self
            .blocks
            .get_mut(id.index())
            .ok_or_else(|| DfsError::Format(format!("block {id} is missing")))?;
        let BlockBuf::Open(data) = slot else {
            return Err(DfsError::Format(format!("block {id} sealed twice")));
        };
        let payload: Arc<[u8]> = std::mem::take(data).into();
        *slot = BlockBuf::Sealed(Arc::clone(&payload));
        debug!(
            target: "dfs::builder",
            block = id.0,
            category = %category,
            bytes = payload.len(),
            "block_sealed"
        );
        self.sealed.push(SealedBlock {
            id,
            category,
            payload,
        });
        Ok(())
    }

    /// Seal every partially filled block, lowest id first.
    pub(crate) fn seal_all(&mut self) -> Result<()> {
        let mut open: Vec<(BlockId, Category)> = Category::ALL
            .into_iter()
            .filter_map(|c| self.open[c.index()].map(|id| (id, c)))
            .collect();
        open.sort_unstable();
        for (_, category) in open {
            self.seal(category)?;
        }
        Ok(())
    }

    /// Blocks sealed since the last call.
    pub(crate) fn take_sealed(&mut self) -> Vec<SealedBlock> {
        std::mem::take(&mut self.sealed)
    }
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| DfsError::Format(format!("{value} exceeds u32")))
}

/// Append `next` to a file's chunk list, merging it into the previous chunk
/// when the two are contiguous in the same block.
pub(crate) fn push_chunk(chunks: &mut Vec<Chunk>, next: Chunk) {
    if let Some(last) = chunks.last_mut() {
        if last.block == next.block && last.end() == Some(next.offset) {
            if let Some(length) = last.length.checked_add(next.length) {
                last.length = length;
                return;
            }
        }
    }
    chunks.push(next);
}
