#![forbid(unsafe_code)]
//! Read-only block I/O layer.
//!
//! Provides the byte-addressed [`ByteDevice`] trait with positioned reads
//! (no shared seek cursor), a file-backed and an in-memory implementation,
//! and the block-addressed [`BlockDevice`] view used by every decoder.
//!
//! A read that cannot be satisfied in full is an I/O error of kind
//! `UnexpectedEof`: ext2 metadata is only interpreted in whole blocks.

use lens_error::{LensError, Result};
use lens_types::{
    BlockNumber, BlockSize, ByteOffset, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE,
};
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

fn short_read(offset: ByteOffset, wanted: usize, len: u64) -> LensError {
    LensError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("short read: offset={offset} len={wanted} volume_len={len}"),
    ))
}

fn check_range(offset: ByteOffset, wanted: usize, len: u64) -> Result<()> {
    let wanted_u64 = u64::try_from(wanted)
        .map_err(|_| LensError::Format("read length overflows u64".to_owned()))?;
    match offset.0.checked_add(wanted_u64) {
        Some(end) if end <= len => Ok(()),
        _ => Err(short_read(offset, wanted, len)),
    }
}

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset reads (pread semantics).
///
/// Implementations must not depend on a shared cursor, so concurrent readers
/// never interleave.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;
}

/// File-backed byte device using `pread` style I/O.
///
/// The file is opened read-only; this crate never writes.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

/// Length of a volume, found by seeking to its end.
///
/// Block device nodes report a zero `metadata().len()`; seeking reports the
/// device size for them and the file size for regular files.
fn volume_len(handle: &mut impl Seek) -> io::Result<u64> {
    let len = handle.seek(SeekFrom::End(0))?;
    handle.seek(SeekFrom::Start(0))?;
    Ok(len)
}

impl FileByteDevice {
    /// Open an image file or block device read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;
        let len = volume_len(&mut file)?;
        trace!(path = %path.as_ref().display(), len, "opened volume");
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

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }
}

/// In-memory byte device, mainly for crafted test images.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemByteDevice {
    bytes: Vec<u8>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        let start: usize = offset
            .0
            .try_into()
            .map_err(|_| short_read(offset, buf.len(), self.len_bytes()))?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for Box<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

/// Block-addressed read interface.
pub trait BlockDevice: Send + Sync {
    /// Read block `block` (zero-based). The buffer is exactly `block_size()` long.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Device block size.
    fn block_size(&self) -> BlockSize;

    /// Number of whole blocks backed by the device.
    fn block_count(&self) -> u64;
}

/// Adapts a [`ByteDevice`] to fixed-size blocks.
///
/// A trailing partial block is not addressable; reading it is a short read.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: BlockSize,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    #[must_use]
    pub fn new(inner: D, block_size: BlockSize) -> Self {
        let block_count = inner.len_bytes() / u64::from(block_size.get());
        Self {
            inner,
            block_size,
            block_count,
        }
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let len = self.block_size.as_usize();
        if block.0 >= self.block_count {
            return Err(LensError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "block out of range: block={block} block_count={}",
                    self.block_count
                ),
            )));
        }

        let offset = self
            .block_size
            .block_to_byte(block)
            .ok_or_else(|| LensError::Format("block offset overflow".to_owned()))?;
        let mut buf = vec![0_u8; len];
        self.inner.read_exact_at(offset, &mut buf)?;
        trace!(block = block.0, offset = offset.0, "read block");
        Ok(BlockBuf::new(buf))
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

/// Read the superblock region (1024 bytes at byte offset 1024).
///
/// Works before the block size is known.
pub fn read_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; EXT2_SUPERBLOCK_SIZE]> {
    let mut buf = [0_u8; EXT2_SUPERBLOCK_SIZE];
    let offset = u64::try_from(EXT2_SUPERBLOCK_OFFSET)
        .map_err(|_| LensError::Format("superblock offset does not fit u64".to_owned()))?;
    dev.read_exact_at(ByteOffset(offset), &mut buf)?;
    Ok(buf)
}
