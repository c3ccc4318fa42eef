//! Tape partition: position, direction and buffering over the chain of
//! lookup units and block maps
//!
//! A partition is driven by one caller at a time. Switching between reading
//! and writing is a full barrier: buffered writes are persisted (data, then
//! block maps, then lookup units) before a read or reposition, and queued
//! reads are drained before a write.
//!
//! Resident block maps form a window of consecutive maps in chain order;
//! `cur` indexes the map holding the position. Maps in front of `cur` are
//! dropped once clean, maps behind it are read ahead.

mod position;
mod read;
mod write;

use std::collections::VecDeque;
use std::sync::Arc;

use super::blk_map::BlockMap;
use super::lookup::{LookupChain, MapRef};
use crate::config::PartitionConfig;
use crate::engine::Engine;
use crate::error::{Condition, Error, Result};
use crate::format::BlockPtr;
use crate::io::{BlockCodec, WorkerPool};
use crate::segment::{SegmentCursor, SegmentKind, SegmentTable};

pub use super::blk_map::SpaceCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// How a write is buffered and stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Keep data in memory until a threshold forces it out
    pub buffered: bool,
    /// Run data blocks through the engine codec
    pub compress: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            buffered: true,
            compress: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Blocks or marks written
    pub blocks: u32,
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    pub data: Vec<u8>,
    /// Data blocks transferred
    pub blocks: u32,
    pub condition: Option<Condition>,
    /// On-disk bytes of the compressed blocks read
    pub compressed_bytes: u64,
}

/// Target of a LOCATE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locate {
    /// Logical block id
    Block(u64),
    /// Right after the n-th filemark (0 based)
    File(u64),
    /// End of recorded data
    Eod,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocateOutcome {
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpaceOutcome {
    /// Units not spaced over
    pub residual: u64,
    pub condition: Option<Condition>,
}

/// READ POSITION data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionInfo {
    pub bop: bool,
    /// Inside the early warning zone
    pub eop: bool,
    pub block: u64,
    pub file: u64,
    pub set: u64,
    pub buffered_blocks: u64,
    pub buffered_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStats {
    pub id: u32,
    pub home: BlockPtr,
    pub size: u64,
    /// Bytes of allocated segments
    pub allocated: u64,
    /// Bytes consumed by content
    pub used: u64,
    pub worm: bool,
    pub direction: Direction,
    pub resident_maps: usize,
    pub resident_units: usize,
    pub read_cached: u64,
    pub pending_bytes: u64,
}

/// One virtual tape
pub struct TapePartition {
    segs: SegmentTable,
    config: PartitionConfig,
    workers: Arc<WorkerPool>,
    codec: Option<Arc<dyn BlockCodec>>,
    chain: LookupChain,
    maps: VecDeque<BlockMap>,
    cur: usize,
    meta_cursor: Option<SegmentCursor>,
    data_cursor: Option<SegmentCursor>,
    /// Segment cursors match the end of recorded content
    segments_synced: bool,
    direction: Direction,
    pending_bytes: u64,
    pending_blocks: u64,
    read_cached: u64,
}

impl TapePartition {
    /// Create an empty partition of `size` bytes in pool `pool_id`
    pub async fn new(engine: &Engine, pool_id: u32, id: u32, size: u64, worm: bool) -> Result<Self> {
        let segs = SegmentTable::create(
            engine.registry().clone(),
            engine.workers().clone(),
            pool_id,
            id,
            size,
            worm,
        )
        .await?;
        Ok(Self::assemble(engine, segs, LookupChain::empty(), true))
    }

    /// Open the partition whose home unit is at `home`, positioned at BOP
    pub async fn load(engine: &Engine, home: BlockPtr) -> Result<Self> {
        let mut segs = SegmentTable::load(engine.registry().clone(), engine.workers().clone(), home).await?;
        let chain = if segs.segment_count(SegmentKind::Meta).await? > 0 {
            let first = segs.lookup_segment(SegmentKind::Meta, 0).await?;
            LookupChain::load(&segs, first.ptr).await?
        } else {
            LookupChain::empty()
        };
        let mut partition = Self::assemble(engine, segs, chain, false);
        partition.position_bop().await?;
        log::info!(
            "TAPE_PARTITION: loaded partition {} from {}{}",
            partition.id(),
            home,
            if partition.chain.is_empty() { " (blank)" } else { "" }
        );
        Ok(partition)
    }

    fn assemble(engine: &Engine, segs: SegmentTable, chain: LookupChain, synced: bool) -> Self {
        Self {
            segs,
            config: engine.config().partition.clone(),
            workers: engine.workers().clone(),
            codec: engine.codec(),
            chain,
            maps: VecDeque::new(),
            cur: 0,
            meta_cursor: None,
            data_cursor: None,
            segments_synced: synced,
            direction: Direction::Read,
            pending_bytes: 0,
            pending_blocks: 0,
            read_cached: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.segs.header().id
    }

    /// Locator of the partition's home unit
    pub fn home(&self) -> BlockPtr {
        self.segs.home()
    }

    pub fn size(&self) -> u64 {
        self.segs.header().size
    }

    pub fn is_worm(&self) -> bool {
        self.segs.header().worm
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bytes consumed by content: allocated segments minus what is still
    /// free behind the segment cursors
    pub fn used_bytes(&self) -> u64 {
        let spare: u64 = [self.meta_cursor, self.data_cursor]
            .iter()
            .flatten()
            .map(|c| c.remaining() * crate::blockdev::BLOCK_SIZE as u64)
            .sum();
        self.segs.used().saturating_sub(spare)
    }

    pub fn stats(&self) -> PartitionStats {
        PartitionStats {
            id: self.id(),
            home: self.home(),
            size: self.size(),
            allocated: self.segs.used(),
            used: self.used_bytes(),
            worm: self.is_worm(),
            direction: self.direction,
            resident_maps: self.maps.len(),
            resident_units: self.chain.resident(),
            read_cached: self.read_cached,
            pending_bytes: self.pending_bytes,
        }
    }

    fn cur_map(&self) -> Option<&BlockMap> {
        self.maps.get(self.cur)
    }

    fn cur_map_mut(&mut self) -> Result<&mut BlockMap> {
        self.maps
            .get_mut(self.cur)
            .ok_or_else(|| Error::Format("no block map at the current position".into()))
    }

    /// Whether the position is the end of recorded data
    pub fn at_eod(&self) -> Result<bool> {
        match self.cur_map() {
            None => Ok(true),
            Some(map) => Ok(map.cursor.is_none() && self.chain.is_last(map.mref)?),
        }
    }

    /// Logical id of the position
    pub fn current_lid(&self) -> u64 {
        self.cur_map().map(|m| m.current_lid()).unwrap_or(0)
    }

    async fn load_map(&self, r: MapRef) -> Result<BlockMap> {
        let entry = self.chain.entry(r)?;
        let ids = self.chain.ids_start(r)?;
        let handle = self.segs.handle(entry.location.bid())?;
        BlockMap::load_map(&self.workers, &handle, r, entry.location, ids).await
    }

    fn load_map_deferred(&self, r: MapRef) -> Result<BlockMap> {
        let entry = self.chain.entry(r)?;
        let ids = self.chain.ids_start(r)?;
        let handle = self.segs.handle(entry.location.bid())?;
        Ok(BlockMap::load_deferred(&self.workers, &handle, r, entry.location, ids))
    }

    /// Replace the window with the map at `r`, cursor at its start. Only
    /// valid once buffered writes are flushed.
    async fn reset_window(&mut self, r: MapRef) -> Result<()> {
        let map = match self.maps.iter().position(|m| m.mref == r) {
            Some(i) => {
                let mut map = self.maps.remove(i).ok_or_else(|| Error::Format("window slot vanished".into()))?;
                map.ensure_loaded().await?;
                map
            }
            None => self.load_map(r).await?,
        };
        for mut dropped in self.maps.drain(..) {
            self.read_cached = self.read_cached.saturating_sub(dropped.drop_read_cache());
        }
        self.maps.push_back(map);
        self.cur = 0;
        let map = self.cur_map_mut()?;
        map.set_cursor(0);
        Ok(())
    }

    /// Move to the start of the next map; false at the end of the chain
    async fn next_map(&mut self) -> Result<bool> {
        let mref = match self.cur_map() {
            Some(map) => map.mref,
            None => return Ok(false),
        };
        if self.cur + 1 >= self.maps.len() {
            let next = match self.chain.next_ref(&self.segs, mref).await? {
                Some(next) => next,
                None => return Ok(false),
            };
            let map = self.load_map(next).await?;
            self.maps.push_back(map);
        }
        self.cur += 1;
        let map = self.cur_map_mut()?;
        map.ensure_loaded().await?;
        map.set_cursor(0);
        Ok(true)
    }

    /// Move to the end of the previous map; false at the start of the chain
    async fn prev_map(&mut self) -> Result<bool> {
        let mref = match self.cur_map() {
            Some(map) => map.mref,
            None => return Ok(false),
        };
        if self.cur == 0 {
            let prev = match self.chain.prev_ref(&self.segs, mref).await? {
                Some(prev) => prev,
                None => return Ok(false),
            };
            let map = self.load_map(prev).await?;
            self.maps.push_front(map);
        } else {
            self.cur -= 1;
        }
        let map = self.cur_map_mut()?;
        map.ensure_loaded().await?;
        map.cursor = None;
        Ok(true)
    }

    /// Make sure an entry is under the cursor, crossing into following
    /// maps as needed; false at the end of data
    async fn settle(&mut self) -> Result<bool> {
        loop {
            match self.cur_map() {
                None => return Ok(false),
                Some(map) if map.cursor.is_some() => return Ok(true),
                Some(_) => {
                    if !self.next_map().await? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Drop clean maps in front of the position
    fn trim_window(&mut self) {
        while self.cur > 0 {
            let Some(front) = self.maps.front() else { break };
            if front.needs_flush() || front.entries().iter().any(|e| e.has_pending_write()) {
                break;
            }
            if let Some(mut front) = self.maps.pop_front() {
                self.read_cached = self.read_cached.saturating_sub(front.drop_read_cache());
            }
            self.cur -= 1;
        }
        if let Some(map) = self.cur_map() {
            let unit = map.mref.unit;
            self.chain.release_before(unit);
        }
    }

    /// Point the segment cursors at the end of the content in front of the
    /// position
    async fn sync_segments(&mut self) -> Result<()> {
        if self.segments_synced {
            return Ok(());
        }
        let (meta, resume) = match self.cur_map() {
            None => (None, None),
            Some(map) => (Some((map.segment_id, map.location)), map.data_resume()),
        };

        self.meta_cursor = match meta {
            Some((segment_id, location)) => {
                let mut cursor = self.segs.lookup_segment(SegmentKind::Meta, segment_id).await?;
                cursor.b_cur = location.block() + 1;
                Some(cursor)
            }
            None => None,
        };
        self.data_cursor = match resume {
            Some((segment_id, ptr)) if !ptr.is_null() => {
                let mut cursor = self.segs.lookup_segment(SegmentKind::Data, segment_id).await?;
                cursor.b_cur = ptr.block();
                Some(cursor)
            }
            _ => None,
        };
        log::debug!(
            "TapePartition::sync_segments: partition {} meta {:?} data {:?}",
            self.id(),
            self.meta_cursor.map(|c| (c.segment_id, c.b_cur)),
            self.data_cursor.map(|c| (c.segment_id, c.b_cur))
        );
        self.segments_synced = true;
        Ok(())
    }

    /// Persist everything and release caches
    pub async fn close(mut self) -> Result<()> {
        self.flush_writes().await?;
        self.flush_reads().await?;
        let pool = self.segs.registry().pool(self.segs.header().pool_id)?;
        for bdev in pool.devices() {
            bdev.device().sync().await?;
        }
        log::info!("TAPE_PARTITION: closed partition {}", self.id());
        Ok(())
    }

    /// Release every segment and the home unit
    pub async fn delete(mut self) -> Result<()> {
        self.flush_reads().await?;
        let id = self.id();
        self.maps.clear();
        self.segs.release_all().await?;
        log::info!("TAPE_PARTITION: deleted partition {}", id);
        Ok(())
    }
}

impl std::fmt::Debug for TapePartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapePartition")
            .field("id", &self.id())
            .field("home", &self.home())
            .field("lid", &self.current_lid())
            .field("direction", &self.direction)
            .finish()
    }
}
