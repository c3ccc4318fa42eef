//! Sparse in-memory block device with fault injection

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{BlockDevice, BlockDeviceError, Result, BLOCK_SIZE};

/// Faults to inject on the next operations
#[derive(Debug, Default, Clone)]
struct FaultPlan {
    /// Writes touching these blocks fail
    fail_writes: Option<Range<u64>>,
    /// Reads touching these blocks fail
    fail_reads: Option<Range<u64>>,
    /// Number of writes allowed to succeed before every write fails
    writes_before_failure: Option<u64>,
}

/// A block device kept entirely in memory.
///
/// Unwritten blocks read back as zeroes. Used by tests and benchmarks, and
/// as a scratch device for tooling.
pub struct MemoryBlockDevice {
    blocks: RwLock<HashMap<u64, Box<[u8]>>>,
    block_count: u64,
    discard: bool,
    discard_delay: Mutex<Option<Duration>>,
    faults: Mutex<FaultPlan>,
    /// Blocks whose discard has been issued but not completed yet
    discarding: Mutex<HashSet<u64>>,
    writes: AtomicU64,
    reads: AtomicU64,
    discards: AtomicU64,
    discard_conflicts: AtomicU64,
}

impl MemoryBlockDevice {
    /// Create a device of `size` bytes (rounded down to whole blocks)
    pub fn new(size: u64) -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            block_count: size / BLOCK_SIZE as u64,
            discard: false,
            discard_delay: Mutex::new(None),
            faults: Mutex::new(FaultPlan::default()),
            discarding: Mutex::new(HashSet::new()),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            discards: AtomicU64::new(0),
            discard_conflicts: AtomicU64::new(0),
        }
    }

    /// Advertise discard support
    pub fn with_discard(mut self, enabled: bool) -> Self {
        self.discard = enabled;
        self
    }

    /// Delay every discard by `delay` before it completes
    pub fn set_discard_delay(&self, delay: Option<Duration>) {
        *self.discard_delay.lock() = delay;
    }

    /// Fail writes that touch any block in `range`
    pub fn fail_writes_in(&self, range: Range<u64>) {
        self.faults.lock().fail_writes = Some(range);
    }

    /// Fail reads that touch any block in `range`
    pub fn fail_reads_in(&self, range: Range<u64>) {
        self.faults.lock().fail_reads = Some(range);
    }

    /// Let `n` more writes succeed, then fail all of them
    pub fn fail_writes_after(&self, n: u64) {
        self.faults.lock().writes_before_failure = Some(n);
    }

    /// Remove every injected fault
    pub fn clear_faults(&self) {
        *self.faults.lock() = FaultPlan::default();
    }

    /// Flip one byte of a stored block
    pub fn corrupt_byte(&self, block_num: u64, offset: usize) {
        let mut blocks = self.blocks.write();
        let block = blocks
            .entry(block_num)
            .or_insert_with(|| vec![0u8; BLOCK_SIZE].into_boxed_slice());
        block[offset] ^= 0xFF;
    }

    /// Copy of a stored block, zeroes if never written
    pub fn snapshot_block(&self, block_num: u64) -> Vec<u8> {
        self.blocks
            .read()
            .get(&block_num)
            .map(|b| b.to_vec())
            .unwrap_or_else(|| vec![0u8; BLOCK_SIZE])
    }

    /// Number of block writes performed
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of block reads performed
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of discards that have completed
    pub fn discard_count(&self) -> u64 {
        self.discards.load(Ordering::Relaxed)
    }

    /// Writes that landed on a block while its discard was still in flight
    pub fn discard_conflicts(&self) -> u64 {
        self.discard_conflicts.load(Ordering::Relaxed)
    }

    fn check_write(&self, start: u64, count: u64) -> Result<()> {
        if start + count > self.block_count {
            return Err(BlockDeviceError::InvalidBlockNumber(start + count - 1));
        }
        let mut faults = self.faults.lock();
        if let Some(left) = faults.writes_before_failure.as_mut() {
            if *left == 0 {
                return Err(BlockDeviceError::Fault(start));
            }
            *left -= 1;
        }
        if let Some(range) = &faults.fail_writes {
            if let Some(block) = (start..start + count).find(|b| range.contains(b)) {
                return Err(BlockDeviceError::Fault(block));
            }
        }
        Ok(())
    }

    fn check_read(&self, start: u64, count: u64) -> Result<()> {
        if start + count > self.block_count {
            return Err(BlockDeviceError::InvalidBlockNumber(start + count - 1));
        }
        if let Some(range) = &self.faults.lock().fail_reads {
            if let Some(block) = (start..start + count).find(|b| range.contains(b)) {
                return Err(BlockDeviceError::Fault(block));
            }
        }
        Ok(())
    }

    fn store(&self, start: u64, data: &[u8]) {
        {
            let discarding = self.discarding.lock();
            let count = (data.len() / BLOCK_SIZE) as u64;
            if (start..start + count).any(|b| discarding.contains(&b)) {
                log::warn!(
                    "MemoryBlockDevice::store: write to block {} raced an in-flight discard",
                    start
                );
                self.discard_conflicts.fetch_add(1, Ordering::Relaxed);
            }
        }
        let mut blocks = self.blocks.write();
        for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            blocks.insert(start + i as u64, chunk.to_vec().into_boxed_slice());
        }
        self.writes
            .fetch_add((data.len() / BLOCK_SIZE) as u64, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for MemoryBlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlockDevice")
            .field("block_count", &self.block_count)
            .field("resident_blocks", &self.blocks.read().len())
            .field("discard", &self.discard)
            .finish()
    }
}

#[async_trait]
impl BlockDevice for MemoryBlockDevice {
    async fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(buf.len()));
        }
        self.check_read(block_num, 1)?;
        match self.blocks.read().get(&block_num) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn write_block(&self, block_num: u64, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(BlockDeviceError::InvalidBlockSize(data.len()));
        }
        self.check_write(block_num, 1)?;
        self.store(block_num, data);
        Ok(())
    }

    async fn read_blocks(&self, start: u64, count: usize) -> Result<Vec<u8>> {
        self.check_read(start, count as u64)?;
        let mut buf = vec![0u8; count * BLOCK_SIZE];
        {
            let blocks = self.blocks.read();
            for (i, chunk) in buf.chunks_mut(BLOCK_SIZE).enumerate() {
                if let Some(data) = blocks.get(&(start + i as u64)) {
                    chunk.copy_from_slice(data);
                }
            }
        }
        self.reads.fetch_add(count as u64, Ordering::Relaxed);
        Ok(buf)
    }

    async fn write_blocks(&self, start: u64, data: &[u8]) -> Result<()> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(BlockDeviceError::InvalidBlockSize(data.len()));
        }
        self.check_write(start, (data.len() / BLOCK_SIZE) as u64)?;
        self.store(start, data);
        Ok(())
    }

    async fn discard(&self, start: u64, count: u64) -> Result<()> {
        if start + count > self.block_count {
            return Err(BlockDeviceError::InvalidBlockNumber(start + count - 1));
        }
        self.discarding.lock().extend(start..start + count);

        let delay = *self.discard_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut blocks = self.blocks.write();
            blocks.retain(|b, _| *b < start || *b >= start + count);
        }
        {
            let mut discarding = self.discarding.lock();
            for b in start..start + count {
                discarding.remove(&b);
            }
        }
        self.discards.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn supports_discard(&self) -> bool {
        self.discard
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
