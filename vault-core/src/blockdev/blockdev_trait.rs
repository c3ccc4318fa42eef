//! Block device trait definitions for tapevault

use std::io;
use thiserror::Error;

/// Block size in bytes (4KB). Every on-disk page and LBA uses this size.
pub const BLOCK_SIZE: usize = 4096;

/// Error type for block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid block number: {0}")]
    InvalidBlockNumber(u64),
    #[error("Invalid block size: {0} (expected a multiple of {BLOCK_SIZE})")]
    InvalidBlockSize(usize),
    #[error("Device is read-only")]
    ReadOnly,
    #[error("Device is already closed")]
    DeviceClosed,
    #[error("Injected fault on block {0}")]
    Fault(u64),
}

/// Result type for block device operations
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Trait for block device operations.
///
/// This is the only boundary through which the engine touches storage; nothing
/// above it depends on the kind of device behind it.
#[async_trait::async_trait]
pub trait BlockDevice: Send + Sync + 'static {
    /// Read a block from the device
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()>;

    /// Write a block to the device
    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()>;

    /// Read `count` contiguous blocks starting at `start`
    async fn read_blocks(&self, start: u64, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count * BLOCK_SIZE];
        for (i, chunk) in buf.chunks_mut(BLOCK_SIZE).enumerate() {
            self.read_block(start + i as u64, chunk).await?;
        }
        Ok(buf)
    }

    /// Write contiguous blocks starting at `start`; `data` must be block aligned
    async fn write_blocks(&self, start: u64, data: &[u8]) -> Result<()> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(BlockDeviceError::InvalidBlockSize(data.len()));
        }
        for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            self.write_block(start + i as u64, chunk).await?;
        }
        Ok(())
    }

    /// Discard (unmap) a block range
    async fn discard(&self, _start: u64, _count: u64) -> Result<()> {
        Ok(())
    }

    /// Whether `discard` actually releases backing storage
    fn supports_discard(&self) -> bool {
        false
    }

    /// Get the total number of blocks in the device
    fn block_count(&self) -> u64;

    /// Get the block size in bytes
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Sync any pending writes to the device
    async fn sync(&self) -> Result<()>;

    /// Close the device
    async fn close(&mut self) -> Result<()>;

    /// Check if the device is read-only
    fn is_read_only(&self) -> bool {
        false
    }
}
