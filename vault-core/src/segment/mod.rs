//! Segment/extent allocator of a tape partition
//!
//! A partition grows one allocation unit ("segment") at a time, separately
//! for metadata (lookup units and block maps) and for data. Every segment
//! is recorded in a segment map page (tmap) in the partition's home unit,
//! which is persisted before the segment is handed out. Segment ids are
//! dense, so `id / TMAP_SLOTS` and `id % TMAP_SLOTS` locate the slot
//! without scanning.

mod tmap;

pub use self::tmap::{PartitionHeader, SegmentMapPage, TMAP_SLOTS};

use std::collections::HashMap;
use std::sync::Arc;

use crate::alloc::DeviceRegistry;
use crate::blockdev::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::format::BlockPtr;
use crate::io::{self, DeviceHandle, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Meta,
    Data,
}

/// Allocation position inside one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentCursor {
    pub segment_id: u32,
    /// First block of the segment
    pub ptr: BlockPtr,
    /// Next free block
    pub b_cur: u64,
    /// One past the last block
    pub b_end: u64,
}

impl SegmentCursor {
    pub fn remaining(&self) -> u64 {
        self.b_end.saturating_sub(self.b_cur)
    }

    /// Claim `blocks` contiguous blocks, if the segment has room
    pub fn take(&mut self, blocks: u64) -> Option<BlockPtr> {
        if blocks > self.remaining() {
            return None;
        }
        let ptr = BlockPtr::new(self.ptr.bid(), self.b_cur);
        self.b_cur += blocks;
        Some(ptr)
    }
}

/// Tmaps needed for a partition of `size` bytes: (meta, data)
pub fn map_layout(size: u64, unit_size: u64) -> (u32, u32) {
    let units = size.div_ceil(unit_size);
    let data = std::cmp::max(1, units.div_ceil(TMAP_SLOTS as u64)) as u32;
    let meta = std::cmp::max(1, data / 4);
    (meta, data)
}

/// The segment maps of one partition and the extents they record
pub struct SegmentTable {
    registry: Arc<DeviceRegistry>,
    workers: Arc<WorkerPool>,
    home: BlockPtr,
    header: PartitionHeader,
    unit_blocks: u64,
    tmaps: HashMap<(SegmentKind, u32), SegmentMapPage>,
    /// Bytes held by recorded segments
    used: u64,
}

impl SegmentTable {
    /// Allocate and initialise the home unit of a new partition
    pub async fn create(
        registry: Arc<DeviceRegistry>,
        workers: Arc<WorkerPool>,
        pool_id: u32,
        id: u32,
        size: u64,
        worm: bool,
    ) -> Result<Self> {
        let unit_size = registry.unit_size();
        let unit_blocks = unit_size / BLOCK_SIZE as u64;
        let (meta_maps, data_maps) = map_layout(size, unit_size);
        let pages = 1 + meta_maps as u64 + data_maps as u64;
        if size == 0 || pages > unit_blocks {
            return Err(Error::InvalidArgument(format!(
                "partition size {} needs {} tmap pages, unit holds {}",
                size, pages, unit_blocks
            )));
        }

        let pool = registry.pool(pool_id)?;
        let header = PartitionHeader {
            id,
            size,
            pool_id,
            worm: worm || pool.is_worm(),
            created_at: chrono::Utc::now().timestamp(),
            meta_maps,
            data_maps,
        };
        let extent = registry.allocate(pool_id).await?;
        let home = extent.ptr;

        let init = async {
            let handle = registry.handle(home.bid())?;
            io::zero_range(&workers, &handle, home.block(), pages).await?;
            io::write_page(&workers, &handle, home.block(), header.encode()?).await
        };
        if let Err(e) = init.await {
            log::warn!("SegmentTable::create: initialising home unit {} failed: {}", home, e);
            if let Err(release) = registry.release(home).await {
                log::error!("SegmentTable::create: leaking unit {}: {}", home, release);
            }
            return Err(e);
        }

        log::info!(
            "SEGMENT_TABLE: created partition {} ({} bytes) at {} - {} meta and {} data tmaps",
            id,
            size,
            home,
            meta_maps,
            data_maps
        );
        Ok(Self {
            registry,
            workers,
            home,
            header,
            unit_blocks,
            tmaps: HashMap::new(),
            used: 0,
        })
    }

    /// Open the partition whose home unit starts at `home`
    pub async fn load(registry: Arc<DeviceRegistry>, workers: Arc<WorkerPool>, home: BlockPtr) -> Result<Self> {
        let handle = registry.handle(home.bid())?;
        let page = io::read_page(&workers, &handle, home.block()).await?;
        let header = PartitionHeader::decode(&page, home.block())?;
        let unit_blocks = registry.unit_size() / BLOCK_SIZE as u64;
        if 1 + header.meta_maps as u64 + header.data_maps as u64 > unit_blocks {
            return Err(Error::Format(format!(
                "partition at {} has more tmaps than a unit holds",
                home
            )));
        }

        let mut table = Self {
            registry,
            workers,
            home,
            header,
            unit_blocks,
            tmaps: HashMap::new(),
            used: 0,
        };
        table.used = table.usage().await?;
        log::info!(
            "SEGMENT_TABLE: loaded partition {} at {} - {} bytes in use",
            table.header.id,
            home,
            table.used
        );
        Ok(table)
    }

    pub fn home(&self) -> BlockPtr {
        self.home
    }

    pub fn header(&self) -> &PartitionHeader {
        &self.header
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub fn unit_blocks(&self) -> u64 {
        self.unit_blocks
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn handle(&self, bid: u32) -> Result<DeviceHandle> {
        self.registry.handle(bid)
    }

    fn max_maps(&self, kind: SegmentKind) -> u32 {
        match kind {
            SegmentKind::Meta => self.header.meta_maps,
            SegmentKind::Data => self.header.data_maps,
        }
    }

    fn tmap_block(&self, kind: SegmentKind, map_id: u32) -> u64 {
        let base = match kind {
            SegmentKind::Meta => 1,
            SegmentKind::Data => 1 + self.header.meta_maps as u64,
        };
        self.home.block() + base + map_id as u64
    }

    async fn tmap(&mut self, kind: SegmentKind, map_id: u32) -> Result<&mut SegmentMapPage> {
        if !self.tmaps.contains_key(&(kind, map_id)) {
            let block = self.tmap_block(kind, map_id);
            let handle = self.handle(self.home.bid())?;
            let page = io::read_page(&self.workers, &handle, block).await?;
            let tmap = SegmentMapPage::decode(&page, block)?;
            self.tmaps.insert((kind, map_id), tmap);
        }
        self.tmaps
            .get_mut(&(kind, map_id))
            .ok_or_else(|| Error::Format(format!("tmap {:?}/{} not resident", kind, map_id)))
    }

    async fn persist_tmap(&mut self, kind: SegmentKind, map_id: u32) -> Result<()> {
        let page = self.tmap(kind, map_id).await?.encode();
        let handle = self.handle(self.home.bid())?;
        io::write_page(&self.workers, &handle, self.tmap_block(kind, map_id), page).await
    }

    /// Recompute the bytes held by recorded segments
    pub async fn usage(&mut self) -> Result<u64> {
        let mut slots = 0u64;
        for kind in [SegmentKind::Meta, SegmentKind::Data] {
            for map_id in 0..self.max_maps(kind) {
                slots += self.tmap(kind, map_id).await?.used_slots() as u64;
            }
        }
        Ok(slots * self.registry.unit_size())
    }

    /// Recorded segments of `kind`
    pub async fn segment_count(&mut self, kind: SegmentKind) -> Result<u32> {
        let mut count = 0;
        for map_id in 0..self.max_maps(kind) {
            count += self.tmap(kind, map_id).await?.used_slots() as u32;
        }
        Ok(count)
    }

    /// Move `cursor` to the next segment of `kind`, allocating it if needed.
    ///
    /// A fresh extent is usable only once its tmap slot is persisted; if
    /// that write fails the slot is cleared and the extent released.
    pub async fn alloc_segment(&mut self, kind: SegmentKind, cursor: &mut Option<SegmentCursor>) -> Result<()> {
        let next = cursor.map(|c| c.segment_id + 1).unwrap_or(0);
        let (map_id, slot) = (next / TMAP_SLOTS as u32, next as usize % TMAP_SLOTS);
        if map_id >= self.max_maps(kind) {
            log::warn!(
                "SegmentTable::alloc_segment: partition {} out of {:?} segment slots",
                self.header.id,
                kind
            );
            return Err(Error::VolumeOverflow);
        }

        let existing = self.tmap(kind, map_id).await?.get(slot);
        if !existing.is_null() {
            log::debug!("SegmentTable::alloc_segment: reusing {:?} segment {} at {}", kind, next, existing);
            *cursor = Some(self.cursor_at(next, existing));
            return Ok(());
        }

        let extent = self.registry.allocate(self.header.pool_id).await?;
        let recorded = async {
            if kind == SegmentKind::Meta && next == 0 {
                let handle = self.handle(extent.bid())?;
                io::zero_range(&self.workers, &handle, extent.block_start(), 1).await?;
            }
            self.tmap(kind, map_id).await?.set(slot, extent.ptr);
            self.persist_tmap(kind, map_id).await
        };
        if let Err(e) = recorded.await {
            log::warn!(
                "SegmentTable::alloc_segment: recording {:?} segment {} failed: {}",
                kind,
                next,
                e
            );
            if let Some(tmap) = self.tmaps.get_mut(&(kind, map_id)) {
                tmap.set(slot, BlockPtr::NULL);
            }
            if let Err(release) = self.registry.release(extent.ptr).await {
                log::error!("SegmentTable::alloc_segment: leaking unit {}: {}", extent.ptr, release);
            }
            return Err(e);
        }

        self.used += self.registry.unit_size();
        log::debug!(
            "SegmentTable::alloc_segment: partition {} {:?} segment {} at {}",
            self.header.id,
            kind,
            next,
            extent.ptr
        );
        *cursor = Some(self.cursor_at(next, extent.ptr));
        Ok(())
    }

    fn cursor_at(&self, segment_id: u32, ptr: BlockPtr) -> SegmentCursor {
        SegmentCursor {
            segment_id,
            ptr,
            b_cur: ptr.block(),
            b_end: ptr.block() + self.unit_blocks,
        }
    }

    /// Cursor at the start of recorded segment `id`
    pub async fn lookup_segment(&mut self, kind: SegmentKind, id: u32) -> Result<SegmentCursor> {
        let map_id = id / TMAP_SLOTS as u32;
        if map_id >= self.max_maps(kind) {
            return Err(Error::Format(format!("{:?} segment {} out of range", kind, id)));
        }
        let ptr = self.tmap(kind, map_id).await?.get(id as usize % TMAP_SLOTS);
        if ptr.is_null() {
            return Err(Error::Format(format!(
                "{:?} segment {} of partition {} is not mapped",
                kind, id, self.header.id
            )));
        }
        Ok(self.cursor_at(id, ptr))
    }

    /// Release every segment of `kind` after `from` (or from `from` itself
    /// when `inclusive`), zeroing and persisting the touched slots.
    pub async fn eod_segments(&mut self, kind: SegmentKind, from: u32, inclusive: bool) -> Result<()> {
        let start = if inclusive { from } else { from + 1 };
        let mut released = 0u32;
        let mut first_err = None;
        let mut map_id = start / TMAP_SLOTS as u32;
        let mut slot = start as usize % TMAP_SLOTS;

        'maps: while map_id < self.max_maps(kind) {
            let mut extents = Vec::new();
            {
                let tmap = self.tmap(kind, map_id).await?;
                while slot < TMAP_SLOTS {
                    let ptr = tmap.get(slot);
                    if ptr.is_null() {
                        break;
                    }
                    extents.push((slot, ptr));
                    slot += 1;
                }
            }
            if extents.is_empty() {
                break;
            }
            let dense_end = slot < TMAP_SLOTS;

            {
                let tmap = self.tmap(kind, map_id).await?;
                for (slot, _) in &extents {
                    tmap.set(*slot, BlockPtr::NULL);
                }
            }
            if let Err(e) = self.persist_tmap(kind, map_id).await {
                if let Some(tmap) = self.tmaps.get_mut(&(kind, map_id)) {
                    for (slot, ptr) in &extents {
                        tmap.set(*slot, *ptr);
                    }
                }
                return Err(e);
            }
            for (_, ptr) in &extents {
                // slots are already cleared, so the rest is released regardless
                if let Err(e) = self.registry.release(*ptr).await {
                    log::error!(
                        "SegmentTable::eod_segments: partition {} failed to release {}: {}",
                        self.header.id,
                        ptr,
                        e
                    );
                    first_err.get_or_insert(e);
                } else {
                    released += 1;
                }
                self.used = self.used.saturating_sub(self.registry.unit_size());
            }
            if dense_end {
                break 'maps;
            }
            map_id += 1;
            slot = 0;
        }

        if released > 0 {
            log::info!(
                "SEGMENT_TABLE: partition {} released {} {:?} segments from {}",
                self.header.id,
                released,
                kind,
                start
            );
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Release every segment and then the home unit
    pub async fn release_all(mut self) -> Result<()> {
        self.eod_segments(SegmentKind::Meta, 0, true).await?;
        self.eod_segments(SegmentKind::Data, 0, true).await?;
        let handle = self.handle(self.home.bid())?;
        io::zero_range(&self.workers, &handle, self.home.block(), 1).await?;
        self.registry.release(self.home).await?;
        log::info!("SEGMENT_TABLE: deleted partition {} at {}", self.header.id, self.home);
        Ok(())
    }
}

impl std::fmt::Debug for SegmentTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentTable")
            .field("partition", &self.header.id)
            .field("home", &self.home)
            .field("used", &self.used)
            .finish()
    }
}
