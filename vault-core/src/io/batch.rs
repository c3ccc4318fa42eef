//! Page batching and asynchronous completion tracking
//!
//! An [`IoBatch`] collects page-sized operations and coalesces contiguous
//! pages on the same device into runs. Submitting it spawns one device
//! request per run and returns a shared [`IoRequest`]; the last run to
//! complete marks the request done and wakes its waiters. A batch either
//! succeeds or fails as a whole.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::workers::{RunCompletion, WorkerPool};
use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::format::{zero_page, BlockPtr};

/// Zero pages written per batch by [`zero_range`]
const ZERO_CHUNK_PAGES: u64 = 1024;

/// A device together with its registry id
#[derive(Clone)]
pub struct DeviceHandle {
    pub bid: u32,
    pub device: Arc<dyn BlockDevice>,
}

impl DeviceHandle {
    pub fn new(bid: u32, device: Arc<dyn BlockDevice>) -> Self {
        Self { bid, device }
    }

    /// Pointer to `block` on this device
    pub fn ptr(&self, block: u64) -> BlockPtr {
        BlockPtr::new(self.bid, block)
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceHandle({})", self.bid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// Contiguous pages on one device, sent as a single device request
struct IoRun {
    handle: DeviceHandle,
    start: u64,
    pages: Vec<Vec<u8>>,
    slots: Vec<usize>,
}

impl IoRun {
    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Builder for one batch of page I/O
pub struct IoBatch {
    direction: IoDirection,
    runs: Vec<IoRun>,
    slots: usize,
    max_run_bytes: usize,
    max_run_pages: usize,
    workers: Arc<WorkerPool>,
}

impl IoBatch {
    pub fn new(direction: IoDirection, workers: &Arc<WorkerPool>) -> Self {
        let config = workers.config();
        Self {
            direction,
            runs: Vec::new(),
            slots: 0,
            max_run_bytes: config.max_run_bytes,
            max_run_pages: config.max_run_pages,
            workers: workers.clone(),
        }
    }

    pub fn direction(&self) -> IoDirection {
        self.direction
    }

    /// Pages queued so far
    pub fn len(&self) -> usize {
        self.slots
    }

    pub fn is_empty(&self) -> bool {
        self.slots == 0
    }

    /// Device requests the batch will issue
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Queue a page to be written to `block`; returns its slot
    pub fn add_page(&mut self, handle: &DeviceHandle, block: u64, page: Vec<u8>) -> usize {
        debug_assert_eq!(self.direction, IoDirection::Write);
        debug_assert_eq!(page.len(), BLOCK_SIZE);
        self.push(handle, block, page)
    }

    /// Queue a page to be read from `block`; the data is fetched with
    /// [`IoRequest::take_page`] using the returned slot
    pub fn add_read(&mut self, handle: &DeviceHandle, block: u64) -> usize {
        debug_assert_eq!(self.direction, IoDirection::Read);
        self.push(handle, block, Vec::new())
    }

    fn push(&mut self, handle: &DeviceHandle, block: u64, page: Vec<u8>) -> usize {
        let slot = self.slots;
        self.slots += 1;

        let max_pages = std::cmp::min(self.max_run_pages, self.max_run_bytes / BLOCK_SIZE).max(1);
        if let Some(run) = self.runs.last_mut() {
            if run.handle.bid == handle.bid
                && run.start + run.len() as u64 == block
                && run.len() < max_pages
            {
                run.pages.push(page);
                run.slots.push(slot);
                return slot;
            }
        }
        self.runs.push(IoRun {
            handle: handle.clone(),
            start: block,
            pages: vec![page],
            slots: vec![slot],
        });
        slot
    }

    /// Issue every run; completion is tracked by the returned request
    pub fn submit(self) -> Arc<IoRequest> {
        let request = Arc::new(IoRequest::new(
            self.direction,
            self.runs.len(),
            self.slots,
        ));
        self.workers.note_batch(self.runs.len());
        if self.runs.is_empty() {
            request.mark_done();
            return request;
        }

        let direction = self.direction;
        for run in self.runs {
            let request = request.clone();
            let workers = self.workers.clone();
            tokio::spawn(async move {
                let IoRun {
                    handle,
                    start,
                    pages,
                    slots,
                } = run;
                let count = slots.len();
                let result = match direction {
                    IoDirection::Write => {
                        let data = pages.concat();
                        handle.device.write_blocks(start, &data).await.map(|_| None)
                    }
                    IoDirection::Read => handle.device.read_blocks(start, count).await.map(Some),
                };
                let result = result.map_err(|e| {
                    log::error!(
                        "IoBatch::submit: {:?} of {} pages at {}:{} failed: {}",
                        direction,
                        count,
                        handle.bid,
                        start,
                        e
                    );
                    e.to_string()
                });
                workers.post_completion(RunCompletion {
                    request,
                    slots,
                    result,
                });
            });
        }
        request
    }
}

/// Shared completion state of a submitted batch
pub struct IoRequest {
    direction: IoDirection,
    remaining: AtomicUsize,
    failed: AtomicBool,
    done: AtomicBool,
    notify: Notify,
    size: u64,
    pages: Mutex<Vec<Option<Vec<u8>>>>,
}

impl IoRequest {
    fn new(direction: IoDirection, runs: usize, slots: usize) -> Self {
        Self {
            direction,
            remaining: AtomicUsize::new(runs),
            failed: AtomicBool::new(false),
            done: AtomicBool::new(false),
            notify: Notify::new(),
            size: (slots * BLOCK_SIZE) as u64,
            pages: Mutex::new(vec![None; slots]),
        }
    }

    pub fn direction(&self) -> IoDirection {
        self.direction
    }

    /// Total bytes covered by the batch
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Whether any run failed; meaningful once done
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Wait for completion; returns true if any part of the batch failed
    pub async fn wait(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            if self.is_done() {
                break;
            }
            notified.await;
        }
        self.has_failed()
    }

    /// Data read into `slot`; each slot can be taken once
    pub fn take_page(&self, slot: usize) -> Option<Vec<u8>> {
        self.pages.lock().get_mut(slot).and_then(|p| p.take())
    }

    fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn complete_run(&self, slots: &[usize], result: std::result::Result<Option<Vec<u8>>, String>) {
        match result {
            Ok(Some(data)) => {
                let mut pages = self.pages.lock();
                for (slot, chunk) in slots.iter().zip(data.chunks(BLOCK_SIZE)) {
                    if let Some(page) = pages.get_mut(*slot) {
                        *page = Some(chunk.to_vec());
                    }
                }
            }
            Ok(None) => {}
            Err(_) => self.failed.store(true, Ordering::Release),
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.mark_done();
        }
    }
}

impl std::fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRequest")
            .field("direction", &self.direction)
            .field("size", &self.size)
            .field("remaining", &self.remaining.load(Ordering::Relaxed))
            .field("failed", &self.has_failed())
            .finish()
    }
}

/// Wait for every request; true if any of them failed
pub async fn wait_all(requests: &[Arc<IoRequest>]) -> bool {
    futures::future::join_all(requests.iter().map(|r| r.wait()))
        .await
        .into_iter()
        .any(|failed| failed)
}

/// Read one page through a single-page batch
pub async fn read_page(workers: &Arc<WorkerPool>, handle: &DeviceHandle, block: u64) -> Result<Vec<u8>> {
    let mut batch = IoBatch::new(IoDirection::Read, workers);
    let slot = batch.add_read(handle, block);
    let request = batch.submit();
    if request.wait().await {
        return Err(Error::media(format!("read of {}:{} failed", handle.bid, block)));
    }
    request
        .take_page(slot)
        .ok_or_else(|| Error::media(format!("read of {}:{} returned no data", handle.bid, block)))
}

/// Write one page through a single-page batch
pub async fn write_page(
    workers: &Arc<WorkerPool>,
    handle: &DeviceHandle,
    block: u64,
    page: Vec<u8>,
) -> Result<()> {
    let mut batch = IoBatch::new(IoDirection::Write, workers);
    batch.add_page(handle, block, page);
    if batch.submit().wait().await {
        return Err(Error::media(format!("write of {}:{} failed", handle.bid, block)));
    }
    Ok(())
}

/// Write zeroes over `count` pages starting at `start`
pub async fn zero_range(
    workers: &Arc<WorkerPool>,
    handle: &DeviceHandle,
    start: u64,
    count: u64,
) -> Result<()> {
    let mut done = 0;
    while done < count {
        let n = std::cmp::min(ZERO_CHUNK_PAGES, count - done);
        let mut batch = IoBatch::new(IoDirection::Write, workers);
        for i in 0..n {
            batch.add_page(handle, start + done + i, zero_page());
        }
        if batch.submit().wait().await {
            return Err(Error::media(format!(
                "zeroing {} pages at {}:{} failed",
                n,
                handle.bid,
                start + done
            )));
        }
        done += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;
    use crate::config::IoConfig;

    fn workers() -> Arc<WorkerPool> {
        WorkerPool::start(&IoConfig {
            worker_threads: 2,
            max_run_bytes: 4 * BLOCK_SIZE,
            max_run_pages: 128,
        })
    }

    #[tokio::test]
    async fn test_coalescing_rules() {
        let workers = workers();
        let a = DeviceHandle::new(1, Arc::new(MemoryBlockDevice::new(1 << 20)));
        let b = DeviceHandle::new(2, Arc::new(MemoryBlockDevice::new(1 << 20)));

        let mut batch = IoBatch::new(IoDirection::Write, &workers);
        for block in 10..16 {
            batch.add_page(&a, block, vec![block as u8; BLOCK_SIZE]);
        }
        // capped at four pages per run
        assert_eq!(batch.run_count(), 2);
        batch.add_page(&a, 30, vec![0; BLOCK_SIZE]);
        assert_eq!(batch.run_count(), 3);
        batch.add_page(&b, 31, vec![0; BLOCK_SIZE]);
        assert_eq!(batch.run_count(), 4);
        assert_eq!(batch.len(), 8);

        let request = batch.submit();
        assert!(!request.wait().await);
        assert_eq!(request.size(), 8 * BLOCK_SIZE as u64);

        let stats = workers.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.runs, 4);
        workers.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_back_by_slot() {
        let workers = workers();
        let mem = Arc::new(MemoryBlockDevice::new(1 << 20));
        let handle = DeviceHandle::new(1, mem.clone());
        for block in 0..6u64 {
            mem.write_block(block, &[block as u8 + 1; BLOCK_SIZE]).await.unwrap();
        }

        let mut batch = IoBatch::new(IoDirection::Read, &workers);
        let slots: Vec<_> = [4u64, 5, 0, 1].iter().map(|b| batch.add_read(&handle, *b)).collect();
        let request = batch.submit();
        assert!(!request.wait().await);
        assert_eq!(request.take_page(slots[0]).unwrap()[0], 5);
        assert_eq!(request.take_page(slots[1]).unwrap()[0], 6);
        assert_eq!(request.take_page(slots[2]).unwrap()[0], 1);
        assert_eq!(request.take_page(slots[3]).unwrap()[0], 2);
        assert!(request.take_page(slots[3]).is_none());
        workers.shutdown().await;
    }

    #[tokio::test]
    async fn test_partial_failure_fails_batch() {
        let workers = workers();
        let mem = Arc::new(MemoryBlockDevice::new(1 << 20));
        let handle = DeviceHandle::new(1, mem.clone());
        mem.fail_writes_in(40..41);

        let mut batch = IoBatch::new(IoDirection::Write, &workers);
        batch.add_page(&handle, 1, vec![1; BLOCK_SIZE]);
        batch.add_page(&handle, 40, vec![2; BLOCK_SIZE]);
        let first = batch.submit();

        let mut batch = IoBatch::new(IoDirection::Write, &workers);
        batch.add_page(&handle, 2, vec![3; BLOCK_SIZE]);
        let second = batch.submit();

        assert!(first.wait().await);
        assert!(!second.wait().await);
        assert!(wait_all(&[first.clone(), second.clone()]).await);
        assert!(!wait_all(&[second]).await);
        assert_eq!(workers.stats().errors, 1);
        workers.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_batch_and_zero_range() {
        let workers = workers();
        let mem = Arc::new(MemoryBlockDevice::new(1 << 20));
        let handle = DeviceHandle::new(1, mem.clone());

        let request = IoBatch::new(IoDirection::Write, &workers).submit();
        assert!(request.is_done());
        assert!(!request.wait().await);

        mem.write_block(3, &[9; BLOCK_SIZE]).await.unwrap();
        zero_range(&workers, &handle, 2, 3).await.unwrap();
        assert_eq!(mem.snapshot_block(3), vec![0; BLOCK_SIZE]);

        write_page(&workers, &handle, 7, vec![7; BLOCK_SIZE]).await.unwrap();
        assert_eq!(read_page(&workers, &handle, 7).await.unwrap(), vec![7; BLOCK_SIZE]);
        workers.shutdown().await;
    }
}
