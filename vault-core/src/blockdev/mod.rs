//! Backing storage: image files, raw block devices and the in-memory device
//!
//! Everything above this module reaches storage through [`BlockDevice`] in
//! whole 4 KiB blocks. Page writes, coalesced runs and discards of released
//! allocation units all end up in one positional transfer per call.

mod blockdev_trait;
mod memory;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};
pub use self::memory::MemoryBlockDevice;

/// Blocks of zeroes written per transfer when a discard is emulated
const ZERO_RUN_BLOCKS: u64 = 256;

/// An image file or a raw block device node
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<Option<File>>,
    path: PathBuf,
    block_count: u64,
    read_only: bool,
    discard: bool,
}

impl FileBackedBlockDevice {
    /// Create, or truncate, an image of `size` bytes
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(size).await?;
        log::debug!("FileBackedBlockDevice::create: {} ({} bytes)", path.display(), size);
        Ok(Self::wrap(file, path, size, false))
    }

    /// Open an existing image or device node. The size of a device node
    /// comes from the kernel, that of an image from its length.
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(!read_only).open(&path).await?;
        let size = storage_size(&file).await?;
        log::debug!(
            "FileBackedBlockDevice::open: {} ({} bytes{})",
            path.display(),
            size,
            if read_only { ", read-only" } else { "" }
        );
        Ok(Self::wrap(file, path, size, read_only))
    }

    fn wrap(file: File, path: PathBuf, size: u64, read_only: bool) -> Self {
        Self {
            file: Mutex::new(Some(file)),
            path,
            block_count: size / BLOCK_SIZE as u64,
            read_only,
            discard: false,
        }
    }

    /// Zero released extents in the background
    pub fn with_discard(mut self, enabled: bool) -> Self {
        self.discard = enabled;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Usable bytes; a trailing partial block is ignored
    pub fn size(&self) -> u64 {
        self.block_count * BLOCK_SIZE as u64
    }

    /// Byte offset of `blocks` blocks at `start`, if they lie on the device
    fn extent_offset(&self, start: u64, blocks: u64) -> Result<u64> {
        match start.checked_add(blocks) {
            Some(end) if end <= self.block_count => Ok(start * BLOCK_SIZE as u64),
            _ => Err(BlockDeviceError::InvalidBlockNumber(start.saturating_add(blocks))),
        }
    }

    fn writable(&self) -> Result<()> {
        if self.read_only {
            Err(BlockDeviceError::ReadOnly)
        } else {
            Ok(())
        }
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(BlockDeviceError::DeviceClosed)?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(BlockDeviceError::DeviceClosed)?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }
}

async fn storage_size(file: &File) -> Result<u64> {
    let metadata = file.metadata().await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if metadata.file_type().is_block_device() {
            return device_node_size(file);
        }
    }
    Ok(metadata.len())
}

#[cfg(unix)]
fn device_node_size(file: &File) -> Result<u64> {
    use std::os::unix::io::AsRawFd;

    // BLKGETSIZE64
    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
    let mut size: u64 = 0;
    // SAFETY: the descriptor stays open for the call and `size` outlives it
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size as *mut u64) };
    if rc == -1 {
        return Err(BlockDeviceError::Io(std::io::Error::last_os_error()));
    }
    Ok(size)
}

#[async_trait]
impl BlockDevice for FileBackedBlockDevice {
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(buf.len()));
        }
        let offset = self.extent_offset(block_num, 1)?;
        self.read_at(offset, buf).await
    }

    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(data.len()));
        }
        self.write_blocks(block_num, data).await
    }

    async fn read_blocks(&self, start: u64, count: usize) -> Result<Vec<u8>> {
        let offset = self.extent_offset(start, count as u64)?;
        let mut buf = vec![0u8; count * BLOCK_SIZE];
        self.read_at(offset, &mut buf).await?;
        Ok(buf)
    }

    async fn write_blocks(&self, start: u64, data: &[u8]) -> Result<()> {
        self.writable()?;
        if data.len() % BLOCK_SIZE != 0 {
            return Err(BlockDeviceError::InvalidBlockSize(data.len()));
        }
        let offset = self.extent_offset(start, (data.len() / BLOCK_SIZE) as u64)?;
        self.write_at(offset, data).await
    }

    /// Images have no unmap here; the extent is overwritten with zeroes
    async fn discard(&self, start: u64, count: u64) -> Result<()> {
        self.writable()?;
        let mut offset = self.extent_offset(start, count)?;
        let zero = vec![0u8; ZERO_RUN_BLOCKS as usize * BLOCK_SIZE];
        let mut left = count;
        while left > 0 {
            let n = left.min(ZERO_RUN_BLOCKS);
            self.write_at(offset, &zero[..n as usize * BLOCK_SIZE]).await?;
            offset += n * BLOCK_SIZE as u64;
            left -= n;
        }
        Ok(())
    }

    fn supports_discard(&self) -> bool {
        self.discard
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    async fn sync(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(BlockDeviceError::DeviceClosed)?;
        file.sync_all().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let file = self.file.get_mut().take().ok_or(BlockDeviceError::DeviceClosed)?;
        if !self.read_only {
            file.sync_all().await?;
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn run(blocks: usize) -> Vec<u8> {
        (0..blocks * BLOCK_SIZE).map(|i| (i / BLOCK_SIZE + 1) as u8).collect()
    }

    #[tokio::test]
    async fn test_image_extent_io() {
        let dir = tempdir().unwrap();
        let device = FileBackedBlockDevice::create(dir.path().join("image.bin"), 16 * BLOCK_SIZE as u64 + 100)
            .await
            .unwrap();
        assert_eq!(device.block_count(), 16);
        assert_eq!(device.size(), 16 * BLOCK_SIZE as u64);

        let data = run(3);
        device.write_blocks(4, &data).await.unwrap();
        assert_eq!(device.read_blocks(4, 3).await.unwrap(), data);
        let mut page = vec![0u8; BLOCK_SIZE];
        device.read_block(5, &mut page).await.unwrap();
        assert_eq!(page, data[BLOCK_SIZE..2 * BLOCK_SIZE]);

        assert!(matches!(
            device.write_blocks(15, &data).await,
            Err(BlockDeviceError::InvalidBlockNumber(18))
        ));
        assert!(matches!(
            device.write_blocks(0, &data[..100]).await,
            Err(BlockDeviceError::InvalidBlockSize(100))
        ));
        assert!(device.read_blocks(u64::MAX, 2).await.is_err());
    }

    #[tokio::test]
    async fn test_discard_zeroes_the_extent() {
        let dir = tempdir().unwrap();
        let device = FileBackedBlockDevice::create(dir.path().join("discard.bin"), 600 * BLOCK_SIZE as u64)
            .await
            .unwrap()
            .with_discard(true);
        assert!(device.supports_discard());

        // longer than one zero run
        let data = vec![0xa5u8; 300 * BLOCK_SIZE];
        device.write_blocks(100, &data).await.unwrap();
        device.discard(101, 298).await.unwrap();
        let back = device.read_blocks(100, 300).await.unwrap();
        assert!(back[..BLOCK_SIZE].iter().all(|&b| b == 0xa5));
        assert!(back[BLOCK_SIZE..299 * BLOCK_SIZE].iter().all(|&b| b == 0));
        assert!(back[299 * BLOCK_SIZE..].iter().all(|&b| b == 0xa5));
        assert!(device.discard(590, 20).await.is_err());
    }

    #[tokio::test]
    async fn test_reopen_read_only_and_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.bin");
        let device = FileBackedBlockDevice::create(&path, 4 * BLOCK_SIZE as u64).await.unwrap();
        device.write_blocks(1, &run(2)).await.unwrap();

        let mut ro = FileBackedBlockDevice::open(&path, true).await.unwrap();
        assert!(ro.is_read_only());
        assert_eq!(ro.block_count(), 4);
        assert_eq!(ro.read_blocks(1, 2).await.unwrap(), run(2));
        assert!(matches!(ro.write_blocks(0, &run(1)).await, Err(BlockDeviceError::ReadOnly)));
        assert!(matches!(ro.discard(0, 1).await, Err(BlockDeviceError::ReadOnly)));

        ro.close().await.unwrap();
        assert!(matches!(ro.read_blocks(1, 1).await, Err(BlockDeviceError::DeviceClosed)));
        assert!(matches!(ro.close().await, Err(BlockDeviceError::DeviceClosed)));
    }
}
