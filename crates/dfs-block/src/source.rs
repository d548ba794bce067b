//! Materialising one block from its frame.

use crate::device::ByteDevice;
use dfs_compress::Algorithm;
use dfs_error::{DfsError, Result};
use dfs_ondisk::{BlockIndexEntry, split_frame};
use dfs_types::BlockId;
use tracing::{trace, warn};

/// Something that can produce the verified, uncompressed payload of a block.
///
/// The cache calls [`BlockSource::load`] outside of any lock, possibly from
/// several threads at once for distinct blocks.
pub trait BlockSource: Send + Sync {
    fn block_count(&self) -> u32;

    /// Declared uncompressed size, used for budget checks before loading.
    /// Called with the cache lock held; must not do I/O.
    fn uncompressed_size(&self, block: BlockId) -> Result<u32>;

    /// Read, decompress and checksum-verify one block.
    fn load(&self, block: BlockId) -> Result<Vec<u8>>;
}

/// Block source reading frames from an image's block section.
#[derive(Debug)]
pub struct ImageBlockSource<D: ByteDevice> {
    device: D,
    blocks_offset: u64,
    index: Vec<BlockIndexEntry>,
}

impl<D: ByteDevice> ImageBlockSource<D> {
    /// `blocks_offset` is the absolute device offset of the block section;
    /// index offsets are relative to it.
    pub fn new(device: D, blocks_offset: u64, index: Vec<BlockIndexEntry>) -> Self {
        Self {
            device,
            blocks_offset,
            index,
        }
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    fn entry(&self, block: BlockId) -> Result<&BlockIndexEntry> {
        self.index
            .get(block.index())
            .ok_or_else(|| DfsError::NotFound(format!("block {block}")))
    }

    /// Sum of all frame lengths in the block section.
    #[must_use]
    pub fn stored_bytes(&self) -> u64 {
        self.index.iter().map(|e| u64::from(e.frame_len)).sum()
    }

    /// Read the raw frame, retrying once on a transient I/O error.
    pub fn read_frame(&self, block: BlockId) -> Result<Vec<u8>> {
        let entry = self.entry(block)?;
        let offset = self
            .blocks_offset
            .checked_add(entry.offset)
            .ok_or_else(|| DfsError::Format(format!("frame offset overflow for block {block}")))?;
        let mut frame = vec![0_u8; entry.frame_len as usize];
        match self.device.read_exact_at(offset, &mut frame) {
            Ok(()) => {}
            Err(err) if err.is_transient() => {
                warn!(
                    target: "dfs::cache",
                    block = block.0,
                    error = %err,
                    "frame_read_retry"
                );
                self.device.read_exact_at(offset, &mut frame)?;
            }
            Err(err) => return Err(err),
        }
        Ok(frame)
    }
}

impl<D: ByteDevice> BlockSource for ImageBlockSource<D> {
    fn block_count(&self) -> u32 {
        u32::try_from(self.index.len()).unwrap_or(u32::MAX)
    }

    fn uncompressed_size(&self, block: BlockId) -> Result<u32> {
        Ok(self.entry(block)?.uncompressed_size)
    }

    fn load(&self, block: BlockId) -> Result<Vec<u8>> {
        let expected = self.entry(block)?.uncompressed_size;
        let frame = self.read_frame(block)?;
        decode_frame(block, &frame, expected)
    }
}

/// Decode and verify a complete frame whose index entry declares `expected`
/// uncompressed bytes.
pub fn decode_frame(block: BlockId, frame: &[u8], expected: u32) -> Result<Vec<u8>> {
    let corrupt = |detail: String| DfsError::CorruptBlock {
        block: block.0,
        detail,
    };

    let (header, payload) = split_frame(frame).map_err(|e| corrupt(e.to_string()))?;
    if header.uncompressed_size != expected {
        return Err(corrupt(format!(
            "frame declares {} uncompressed bytes, index declares {expected}",
            header.uncompressed_size
        )));
    }
    let algorithm = Algorithm::from_id(header.algorithm_id)
        .ok_or_else(|| corrupt(format!("unknown algorithm id {}", header.algorithm_id)))?;

    let data = dfs_compress::decompress(payload, algorithm, header.uncompressed_size as usize)
        .map_err(|e| e.into_block_error(block))?;

    let actual = crc32c::crc32c(&data);
    if actual != header.checksum {
        return Err(corrupt(format!(
            "checksum mismatch: stored {:#010x}, computed {actual:#010x}",
            header.checksum
        )));
    }
    trace!(
        target: "dfs::cache",
        block = block.0,
        algorithm = %algorithm,
        compressed = payload.len(),
        uncompressed = data.len(),
        "block_decoded"
    );
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryByteDevice;
    use dfs_ondisk::encode_frame;
    use parking_lot::Mutex;
    use std::io;

    fn build_section(blocks: &[(&[u8], Algorithm)]) -> (Vec<u8>, Vec<BlockIndexEntry>) {
        let mut section = Vec::new();
        let mut index = Vec::new();
        for (data, algorithm) in blocks {
            let compressed =
                dfs_compress::compress(data, *algorithm, algorithm.default_level()).expect("c");
            let frame = encode_frame(algorithm.id(), data, &compressed).expect("frame");
            index.push(BlockIndexEntry {
                offset: section.len() as u64,
                frame_len: u32::try_from(frame.len()).expect("len"),
                uncompressed_size: u32::try_from(data.len()).expect("len"),
            });
            section.extend_from_slice(&frame);
        }
        (section, index)
    }

    #[test]
    fn loads_blocks_with_mixed_algorithms() {
        let a = b"alpha alpha alpha alpha".repeat(20);
        let b = b"beta".repeat(100);
        let (section, index) = build_section(&[(&a, Algorithm::Zstd), (&b, Algorithm::Lz4)]);
        let mut image = vec![0xAA_u8; 7];
        image.extend_from_slice(&section);
        let source = ImageBlockSource::new(MemoryByteDevice::new(image), 7, index);

        assert_eq!(source.block_count(), 2);
        assert_eq!(source.load(BlockId(0)).expect("a"), a);
        assert_eq!(source.load(BlockId(1)).expect("b"), b);
        assert!(matches!(
            source.load(BlockId(2)),
            Err(DfsError::NotFound(_))
        ));
    }

    #[test]
    fn flipped_payload_byte_is_corrupt_block() {
        let data = b"store me verbatim".to_vec();
        let (mut section, index) = build_section(&[(&data, Algorithm::Store)]);
        let last = section.len() - 1;
        section[last] ^= 0xFF;
        let source = ImageBlockSource::new(MemoryByteDevice::new(section), 0, index);
        let err = source.load(BlockId(0)).expect_err("corrupt");
        assert!(
            matches!(err, DfsError::CorruptBlock { block: 0, ref detail } if detail.contains("checksum")),
            "{err:?}"
        );
    }

    #[test]
    fn unknown_algorithm_is_corrupt_block() {
        let data = b"payload".to_vec();
        let (mut section, index) = build_section(&[(&data, Algorithm::Store)]);
        section[0] = 99;
        let source = ImageBlockSource::new(MemoryByteDevice::new(section), 0, index);
        assert!(matches!(
            source.load(BlockId(0)),
            Err(DfsError::CorruptBlock { .. })
        ));
    }

    /// Fails the first reads with `Interrupted`, then delegates.
    #[derive(Debug)]
    struct FlakyDevice {
        inner: MemoryByteDevice,
        failures_left: Mutex<u32>,
    }

    impl ByteDevice for FlakyDevice {
        fn len_bytes(&self) -> u64 {
            self.inner.len_bytes()
        }

        fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(DfsError::Io(io::Error::from(io::ErrorKind::Interrupted)));
            }
            drop(left);
            self.inner.read_exact_at(offset, buf)
        }
    }

    #[test]
    fn transient_error_is_retried_once() {
        let data = b"retry me".to_vec();
        let (section, index) = build_section(&[(&data, Algorithm::Store)]);
        let device = FlakyDevice {
            inner: MemoryByteDevice::new(section.clone()),
            failures_left: Mutex::new(1),
        };
        let source = ImageBlockSource::new(device, 0, index.clone());
        assert_eq!(source.load(BlockId(0)).expect("retried"), data);

        let device = FlakyDevice {
            inner: MemoryByteDevice::new(section),
            failures_left: Mutex::new(2),
        };
        let source = ImageBlockSource::new(device, 0, index);
        let err = source.load(BlockId(0)).expect_err("second failure surfaces");
        assert!(err.is_transient());
    }
}
