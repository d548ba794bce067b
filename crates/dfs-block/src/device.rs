//! Byte-addressed read-only devices backing an image.

use dfs_error::{DfsError, Result};
use std::fmt::Debug;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed device for fixed-offset reads (pread semantics).
///
/// Implementations must be safe to call from many threads at once; there is
/// no shared seek position.
pub trait ByteDevice: Send + Sync + Debug {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

fn check_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| DfsError::Format("read length overflows u64".to_owned()))?,
        )
        .ok_or_else(|| DfsError::Format("read range overflows u64".to_owned()))?;
    if end > device_len {
        return Err(DfsError::Format(format!(
            "read out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed device using positional reads.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a shared
/// seek position, so one handle serves every cache worker.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// Image held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<[u8]>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        let start = usize::try_from(offset)
            .map_err(|_| DfsError::Format("offset does not fit usize".to_owned()))?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}
