//! Backing devices: one raw block device contributing capacity to a pool

use lru::LruCache;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use super::index_page::{FreeBit, IndexPage, UnmapTracker, UNITS_PER_INDEX};
use super::Extent;
use crate::blockdev::{BlockDevice, BLOCK_SIZE};
use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::format::{
    fill_field, BlockPtr, DeviceHeader, FormatError, DEV_FLAG_MASTER, DEV_FLAG_UNMAP,
    DEV_FLAG_WORM, PAGE_SIZE, PRODUCT_TAG,
};

/// Block holding the device header
const HEADER_BLOCK: u64 = 0;
/// First index page block
const INDEX_START_BLOCK: u64 = 1;

/// Parameters for formatting a device into a pool
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub bid: u32,
    pub pool_id: u32,
    pub pool_name: String,
    pub relation_id: String,
    pub master: bool,
    pub worm: bool,
    /// Discard released extents when the device supports it
    pub unmap: bool,
}

/// Unit layout of a device, derived from its size and the unit shift
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    pub unit_shift: u32,
    /// 4 KiB blocks per allocation unit
    pub unit_blocks: u64,
    /// Whole units on the device
    pub units: u64,
    /// Units at the start of the device holding the header and index pages
    pub reserved_units: u64,
    pub index_pages: u32,
}

impl DeviceGeometry {
    pub fn compute(block_count: u64, unit_shift: u32) -> Result<Self> {
        let unit_blocks = (1u64 << unit_shift) / BLOCK_SIZE as u64;
        let units = block_count / unit_blocks;
        let index_pages = ((units + UNITS_PER_INDEX - 1) / UNITS_PER_INDEX) as u32;
        let reserved_blocks = INDEX_START_BLOCK + index_pages as u64;
        let reserved_units = std::cmp::max(1, (reserved_blocks + unit_blocks - 1) / unit_blocks);
        if units <= reserved_units {
            return Err(Error::InvalidArgument(format!(
                "device of {} blocks holds no allocatable unit",
                block_count
            )));
        }
        if reserved_units > UNITS_PER_INDEX {
            return Err(Error::InvalidArgument(
                "index pages do not fit in the first index page's reserve".into(),
            ));
        }
        Ok(Self {
            unit_shift,
            unit_blocks,
            units,
            reserved_units,
            index_pages,
        })
    }

    pub fn unit_size(&self) -> u64 {
        1u64 << self.unit_shift
    }

    pub fn usable_size(&self) -> u64 {
        (self.units - self.reserved_units) * self.unit_size()
    }

    /// Usable bits in index page `index_id`
    fn bits_in_page(&self, index_id: u32) -> u32 {
        let first = index_id as u64 * UNITS_PER_INDEX;
        std::cmp::min(UNITS_PER_INDEX, self.units - first) as u32
    }
}

/// Resident index pages of one device
struct IndexCache {
    pages: LruCache<u32, IndexPage>,
    capacity: usize,
}

/// Counts discards that have been issued but have not completed
#[derive(Debug, Default)]
struct DiscardGate {
    inflight: AtomicUsize,
    notify: Notify,
}

impl DiscardGate {
    fn enter(&self) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            if self.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// One formatted device and its free-space bitmap
pub struct BackingDevice {
    bid: u32,
    device: Arc<dyn BlockDevice>,
    header: RwLock<DeviceHeader>,
    geometry: DeviceGeometry,
    unmap: bool,
    /// Free bytes; changed only while `index` is locked
    free: AtomicU64,
    index: Mutex<IndexCache>,
    discards: Arc<DiscardGate>,
}

impl BackingDevice {
    /// Write a fresh header and empty bitmap to `device`
    pub async fn format(
        device: Arc<dyn BlockDevice>,
        opts: FormatOptions,
        config: &AllocatorConfig,
    ) -> Result<Self> {
        let size = device.block_count() * BLOCK_SIZE as u64;
        if size < config.min_device_size {
            return Err(Error::InvalidArgument(format!(
                "device size {} below minimum {}",
                size, config.min_device_size
            )));
        }
        if opts.bid == 0 || opts.bid > crate::format::MAX_DEVICE_ID {
            return Err(Error::InvalidArgument(format!("device id {}", opts.bid)));
        }
        let geometry = DeviceGeometry::compute(device.block_count(), config.unit_shift)?;

        for index_id in 0..geometry.index_pages {
            let mut page = IndexPage::new(index_id);
            if index_id == 0 {
                for bit in 0..geometry.reserved_units as u32 {
                    page.set(bit);
                }
            }
            device
                .write_block(INDEX_START_BLOCK + index_id as u64, &page.encode())
                .await?;
        }

        let mut header = DeviceHeader::new(opts.bid, opts.pool_id, &opts.pool_name)?;
        header.unit_shift = config.unit_shift;
        header.usable_size = geometry.usable_size();
        header.b_start = geometry.reserved_units * geometry.unit_blocks;
        header.b_end = geometry.units * geometry.unit_blocks;
        fill_field(&mut header.relation_id, opts.relation_id.as_bytes());
        if opts.master {
            header.flags |= DEV_FLAG_MASTER;
        }
        if opts.worm {
            header.flags |= DEV_FLAG_WORM;
        }
        if opts.unmap && device.supports_discard() {
            header.flags |= DEV_FLAG_UNMAP;
        }
        device.write_block(HEADER_BLOCK, &header.encode()?).await?;
        device.sync().await?;

        log::info!(
            "BACKING_DEVICE: formatted device {} into pool {} - {} units of {} bytes, {} reserved",
            opts.bid,
            opts.pool_id,
            geometry.units,
            geometry.unit_size(),
            geometry.reserved_units
        );

        Ok(Self::assemble(device, header, geometry, geometry.usable_size(), config))
    }

    /// Read the header and bitmap of a formatted device
    pub async fn load(device: Arc<dyn BlockDevice>, config: &AllocatorConfig) -> Result<Self> {
        let mut raw = vec![0u8; PAGE_SIZE];
        device.read_block(HEADER_BLOCK, &mut raw).await?;
        let mut header = DeviceHeader::decode(&raw, HEADER_BLOCK)?;

        if header.unit_shift != config.unit_shift {
            return Err(Error::Config(format!(
                "device {} uses unit shift {}, engine is configured for {}",
                header.bid, header.unit_shift, config.unit_shift
            )));
        }
        let geometry = DeviceGeometry::compute(device.block_count(), header.unit_shift)?;
        if header.b_end > geometry.units * geometry.unit_blocks {
            return Err(FormatError::InvalidField("device end beyond media").into());
        }

        if config.fix_legacy_product_tag && header.needs_product_tag_fixup() && !device.is_read_only() {
            log::warn!(
                "BACKING_DEVICE: device {} has no product tag, rewriting header",
                header.bid
            );
            header.product_tag = *PRODUCT_TAG;
            device.write_block(HEADER_BLOCK, &header.encode()?).await?;
        }

        let mut free = 0u64;
        let mut pages = Vec::new();
        for index_id in 0..geometry.index_pages {
            let block = INDEX_START_BLOCK + index_id as u64;
            device.read_block(block, &mut raw).await?;
            let page = IndexPage::decode(index_id, &raw, block)?;
            free += page.count_free(geometry.bits_in_page(index_id)) * geometry.unit_size();
            if pages.len() < config.index_cache_pages {
                pages.push(page);
            }
        }

        log::info!(
            "BACKING_DEVICE: loaded device {} (pool {}) - {} of {} bytes free",
            header.bid,
            header.pool_id,
            free,
            geometry.usable_size()
        );

        let bdev = Self::assemble(device, header, geometry, free, config);
        {
            let mut cache = bdev.index.lock().await;
            for page in pages {
                cache.pages.put(page.index_id(), page);
            }
        }
        Ok(bdev)
    }

    fn assemble(
        device: Arc<dyn BlockDevice>,
        header: DeviceHeader,
        geometry: DeviceGeometry,
        free: u64,
        config: &AllocatorConfig,
    ) -> Self {
        let unmap = header.unmap_enabled() && device.supports_discard();
        Self {
            bid: header.bid,
            device,
            header: RwLock::new(header),
            geometry,
            unmap,
            free: AtomicU64::new(free),
            index: Mutex::new(IndexCache {
                pages: LruCache::unbounded(),
                capacity: config.index_cache_pages,
            }),
            discards: Arc::new(DiscardGate::default()),
        }
    }

    pub fn bid(&self) -> u32 {
        self.bid
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn header(&self) -> DeviceHeader {
        self.header.read().clone()
    }

    pub fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    pub fn pool_id(&self) -> u32 {
        self.header.read().pool_id
    }

    pub fn is_master(&self) -> bool {
        self.header.read().is_master()
    }

    pub fn unit_size(&self) -> u64 {
        self.geometry.unit_size()
    }

    pub fn usable_size(&self) -> u64 {
        self.geometry.usable_size()
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.load(Ordering::SeqCst)
    }

    /// Discards issued and not yet completed
    pub fn pending_discards(&self) -> usize {
        self.discards.inflight.load(Ordering::SeqCst)
    }

    /// Wait for every in-flight discard
    pub async fn wait_discards(&self) {
        self.discards.wait_idle().await;
    }

    /// Persist a changed master flag
    pub async fn set_master(&self, master: bool) -> Result<()> {
        let page = {
            let mut header = self.header.write();
            if master {
                header.flags |= DEV_FLAG_MASTER;
            } else {
                header.flags &= !DEV_FLAG_MASTER;
            }
            header.encode()?
        };
        self.device.write_block(HEADER_BLOCK, &page).await?;
        Ok(())
    }

    /// Allocate one unit.
    ///
    /// Returns `Ok(None)` when the device is full. If the only clear bits
    /// still have a discard in flight, waits for that discard first.
    pub async fn alloc_extent(&self) -> Result<Option<Extent>> {
        let mut cache = self.index.lock().await;
        if self.free.load(Ordering::SeqCst) < self.unit_size() {
            log::debug!("BackingDevice::alloc_extent: device {} is full", self.bid);
            return Ok(None);
        }

        let mut pending: Option<(u32, u32)> = None;
        for index_id in 0..self.geometry.index_pages {
            let limit = self.geometry.bits_in_page(index_id);
            let page = self.page_mut(&mut cache, index_id).await?;
            match page.find_free(limit, true) {
                FreeBit::Free(bit) => {
                    return self.commit_alloc(&mut cache, index_id, bit).await.map(Some);
                }
                FreeBit::Pending(bit) => {
                    pending.get_or_insert((index_id, bit));
                }
                FreeBit::Full => {}
            }
        }

        let Some((index_id, bit)) = pending else {
            log::error!(
                "BackingDevice::alloc_extent: device {} has {} free bytes but no clear bit",
                self.bid,
                self.free.load(Ordering::SeqCst)
            );
            return Ok(None);
        };

        let tracker: Arc<UnmapTracker> = self.page_mut(&mut cache, index_id).await?.unmaps().clone();
        log::debug!(
            "BackingDevice::alloc_extent: device {} waiting on discard of unit {}",
            self.bid,
            index_id as u64 * UNITS_PER_INDEX + bit as u64
        );
        tracker.wait_for(bit).await;
        self.commit_alloc(&mut cache, index_id, bit).await.map(Some)
    }

    async fn commit_alloc(&self, cache: &mut IndexCache, index_id: u32, bit: u32) -> Result<Extent> {
        let page = self.page_mut(cache, index_id).await?;
        page.set(bit);
        let raw = page.encode();
        if let Err(e) = self
            .device
            .write_block(INDEX_START_BLOCK + index_id as u64, &raw)
            .await
        {
            log::error!(
                "BackingDevice::alloc_extent: persisting index page {} of device {} failed: {}",
                index_id,
                self.bid,
                e
            );
            if let Some(page) = cache.pages.peek_mut(&index_id) {
                page.clear(bit);
            }
            return Err(Error::media(format!(
                "index page {} of device {}: {}",
                index_id, self.bid, e
            )));
        }

        let remaining = self.free.fetch_sub(self.unit_size(), Ordering::SeqCst) - self.unit_size();
        let unit = index_id as u64 * UNITS_PER_INDEX + bit as u64;
        let block = unit * self.geometry.unit_blocks;
        log::debug!(
            "BackingDevice::alloc_extent: device {} unit {} (block {}), {} bytes free",
            self.bid,
            unit,
            block,
            remaining
        );
        Ok(Extent {
            ptr: BlockPtr::new(self.bid, block),
            blocks: self.geometry.unit_blocks,
        })
    }

    /// Return the unit starting at `block` to the free pool
    pub async fn release(&self, block: u64) -> Result<()> {
        let unit_blocks = self.geometry.unit_blocks;
        if block % unit_blocks != 0 {
            return Err(Error::InvalidArgument(format!(
                "block {} is not a unit boundary",
                block
            )));
        }
        let unit = block / unit_blocks;
        if unit < self.geometry.reserved_units || unit >= self.geometry.units {
            return Err(Error::InvalidArgument(format!(
                "block {} outside allocatable range of device {}",
                block, self.bid
            )));
        }
        let index_id = (unit / UNITS_PER_INDEX) as u32;
        let bit = (unit % UNITS_PER_INDEX) as u32;

        let mut cache = self.index.lock().await;
        let page = self.page_mut(&mut cache, index_id).await?;
        if !page.is_set(bit) {
            return Err(Error::InvalidArgument(format!(
                "unit {} of device {} is not allocated",
                unit, self.bid
            )));
        }
        page.clear(bit);
        let raw = page.encode();
        let tracker = page.unmaps().clone();
        if let Err(e) = self
            .device
            .write_block(INDEX_START_BLOCK + index_id as u64, &raw)
            .await
        {
            if let Some(page) = cache.pages.peek_mut(&index_id) {
                page.set(bit);
            }
            return Err(Error::media(format!(
                "index page {} of device {}: {}",
                index_id, self.bid, e
            )));
        }
        self.free.fetch_add(self.unit_size(), Ordering::SeqCst);

        if self.unmap {
            tracker.insert(bit);
            self.discards.enter();
            let device = self.device.clone();
            let gate = self.discards.clone();
            let bid = self.bid;
            tokio::spawn(async move {
                if let Err(e) = device.discard(block, unit_blocks).await {
                    log::warn!(
                        "BackingDevice::release: discard of block {} on device {} failed: {}",
                        block,
                        bid,
                        e
                    );
                }
                tracker.complete(bit);
                gate.leave();
            });
        }

        log::debug!(
            "BackingDevice::release: device {} unit {} released, {} bytes free",
            self.bid,
            unit,
            self.free_bytes()
        );
        Ok(())
    }

    /// Resident page `index_id`, loading it and evicting an idle page if needed
    async fn page_mut<'a>(
        &self,
        cache: &'a mut IndexCache,
        index_id: u32,
    ) -> Result<&'a mut IndexPage> {
        if !cache.pages.contains(&index_id) {
            if cache.pages.len() >= cache.capacity {
                let victim = cache
                    .pages
                    .iter()
                    .rev()
                    .find(|(_, page)| page.unmaps().is_empty())
                    .map(|(id, _)| *id);
                match victim {
                    Some(id) => {
                        cache.pages.pop(&id);
                    }
                    None => log::debug!(
                        "BackingDevice::page_mut: every resident page of device {} has pending discards, deferring eviction",
                        self.bid
                    ),
                }
            }
            let block = INDEX_START_BLOCK + index_id as u64;
            let mut raw = vec![0u8; PAGE_SIZE];
            self.device.read_block(block, &mut raw).await?;
            let page = IndexPage::decode(index_id, &raw, block)?;
            cache.pages.put(index_id, page);
        }
        cache
            .pages
            .get_mut(&index_id)
            .ok_or_else(|| Error::media(format!("index page {} vanished", index_id)))
    }
}

impl std::fmt::Debug for BackingDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackingDevice")
            .field("bid", &self.bid)
            .field("geometry", &self.geometry)
            .field("free", &self.free_bytes())
            .field("unmap", &self.unmap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;
    use std::time::Duration;

    fn small_config() -> AllocatorConfig {
        AllocatorConfig {
            unit_shift: 20,
            min_device_size: 8 << 20,
            index_cache_pages: 2,
            fix_legacy_product_tag: true,
        }
    }

    fn opts(bid: u32) -> FormatOptions {
        FormatOptions {
            bid,
            pool_id: 1,
            pool_name: "test".into(),
            relation_id: "rel".into(),
            master: true,
            worm: false,
            unmap: true,
        }
    }

    #[tokio::test]
    async fn test_format_allocate_release() {
        env_logger::builder().is_test(true).try_init().ok();
        let config = small_config();
        let mem = Arc::new(MemoryBlockDevice::new(16 << 20));
        let bdev = BackingDevice::format(mem.clone(), opts(1), &config).await.unwrap();

        assert_eq!(bdev.geometry().units, 16);
        assert_eq!(bdev.geometry().reserved_units, 1);
        assert_eq!(bdev.usable_size(), 15 << 20);
        assert_eq!(bdev.free_bytes(), bdev.usable_size());

        let mut extents = Vec::new();
        while let Some(extent) = bdev.alloc_extent().await.unwrap() {
            extents.push(extent);
        }
        assert_eq!(extents.len(), 15);
        assert_eq!(extents[0].ptr.block(), 256);
        assert_eq!(bdev.free_bytes(), 0);

        bdev.release(extents[3].ptr.block()).await.unwrap();
        assert_eq!(bdev.free_bytes(), 1 << 20);
        assert!(bdev.release(extents[3].ptr.block()).await.is_err());
        assert!(bdev.release(0).await.is_err());
    }

    #[tokio::test]
    async fn test_reload_counts_free_space() {
        let config = small_config();
        let mem = Arc::new(MemoryBlockDevice::new(16 << 20));
        let bdev = BackingDevice::format(mem.clone(), opts(2), &config).await.unwrap();
        for _ in 0..4 {
            bdev.alloc_extent().await.unwrap().unwrap();
        }

        let again = BackingDevice::load(mem.clone(), &config).await.unwrap();
        assert_eq!(again.bid(), 2);
        assert_eq!(again.free_bytes(), 11 << 20);
        assert!(again.is_master());
    }

    #[tokio::test]
    async fn test_failed_index_write_rolls_back() {
        let config = small_config();
        let mem = Arc::new(MemoryBlockDevice::new(16 << 20));
        let bdev = BackingDevice::format(mem.clone(), opts(1), &config).await.unwrap();

        mem.fail_writes_in(1..2);
        let res = bdev.alloc_extent().await;
        assert!(matches!(res, Err(Error::Media(_))));
        assert_eq!(bdev.free_bytes(), 15 << 20);

        mem.clear_faults();
        let extent = bdev.alloc_extent().await.unwrap().unwrap();
        assert_eq!(extent.ptr.block(), 256);
    }

    #[tokio::test]
    async fn test_allocation_waits_for_discard() {
        let config = small_config();
        let mem = Arc::new(MemoryBlockDevice::new(16 << 20).with_discard(true));
        let bdev = BackingDevice::format(mem.clone(), opts(1), &config).await.unwrap();

        let mut extents = Vec::new();
        while let Some(extent) = bdev.alloc_extent().await.unwrap() {
            extents.push(extent);
        }

        mem.set_discard_delay(Some(Duration::from_millis(100)));
        let victim = extents[5].ptr.block();
        bdev.release(victim).await.unwrap();
        assert_eq!(bdev.pending_discards(), 1);
        assert_eq!(mem.discard_count(), 0);

        let again = bdev.alloc_extent().await.unwrap().unwrap();
        assert_eq!(again.ptr.block(), victim);
        assert_eq!(mem.discard_count(), 1);
        bdev.wait_discards().await;
        assert_eq!(bdev.pending_discards(), 0);
    }

    #[tokio::test]
    async fn test_legacy_product_tag_fixup() {
        let config = small_config();
        let mem = Arc::new(MemoryBlockDevice::new(16 << 20));
        let bdev = BackingDevice::format(mem.clone(), opts(1), &config).await.unwrap();
        let mut header = bdev.header();
        header.product_tag = [0; 4];
        mem.write_block(0, &header.encode().unwrap()).await.unwrap();

        let loaded = BackingDevice::load(mem.clone(), &config).await.unwrap();
        assert_eq!(&loaded.header().product_tag, PRODUCT_TAG);
        let raw = mem.snapshot_block(0);
        assert!(!DeviceHeader::decode(&raw, 0).unwrap().needs_product_tag_fixup());
    }

    #[tokio::test]
    async fn test_rejects_small_device_and_bad_header() {
        let config = small_config();
        let mem = Arc::new(MemoryBlockDevice::new(4 << 20));
        assert!(BackingDevice::format(mem, opts(1), &config).await.is_err());

        let mem = Arc::new(MemoryBlockDevice::new(16 << 20));
        BackingDevice::format(mem.clone(), opts(1), &config).await.unwrap();
        mem.corrupt_byte(1, 40);
        assert!(matches!(
            BackingDevice::load(mem, &config).await,
            Err(Error::Checksum { block: 1 })
        ));
    }
}
