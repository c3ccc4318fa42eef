//! Write path: staging, capacity checks, overwrite and flushing

use std::collections::HashMap;
use std::sync::Arc;

use super::{Direction, TapePartition, WriteOptions, WriteOutcome};
use crate::blockdev::BLOCK_SIZE;
use crate::error::{Condition, Error, Result};
use crate::format::BlockPtr;
use crate::io::{wait_all, DeviceHandle, IoBatch, IoDirection, IoRequest};
use crate::segment::SegmentKind;
use crate::tape::blk_map::BlockMap;
use crate::tape::entry::{BlockEntry, EntryBits, EntryData, EntryKind, CSIZE_UNIT, MAX_BLOCK_SIZE};
use crate::tape::lookup::IdsStart;

impl TapePartition {
    /// Check a write of `blocks` blocks of `block_size` bytes at the
    /// position. Returns `EarlyWarning` when the write lands in the reserve
    /// at the end of the partition.
    pub fn validate_write(&self, block_size: u32, blocks: u32) -> Result<Option<Condition>> {
        if self.is_worm() && !self.at_eod()? {
            log::warn!(
                "TapePartition::validate_write: partition {} is WORM, write at {} refused",
                self.id(),
                self.current_lid()
            );
            return Err(Error::WormViolation);
        }
        let need = blocks as u64 * (block_size as u64).next_multiple_of(BLOCK_SIZE as u64);
        // staged blocks already hold their place behind the data cursor
        let total = self.used_bytes() + need;
        if total + self.config.early_warning_size < self.size() {
            Ok(None)
        } else if total < self.size() {
            Ok(Some(Condition::EarlyWarning))
        } else {
            log::info!(
                "TapePartition::validate_write: partition {} full ({} of {} bytes)",
                self.id(),
                total,
                self.size()
            );
            Err(Error::VolumeOverflow)
        }
    }

    /// Write `data` as blocks of `block_size` bytes, or as a single block
    /// when `block_size` is 0
    pub async fn write(&mut self, data: &[u8], block_size: u32, opts: WriteOptions) -> Result<WriteOutcome> {
        let block_size = if block_size == 0 { data.len() as u32 } else { block_size };
        if data.is_empty() || data.len() > u32::MAX as usize {
            return Err(Error::InvalidArgument(format!("write of {} bytes", data.len())));
        }
        if block_size == 0 || block_size > MAX_BLOCK_SIZE || data.len() % block_size as usize != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} bytes are not whole blocks of {}",
                data.len(),
                block_size
            )));
        }
        let blocks = (data.len() / block_size as usize) as u32;
        if (block_size as u64).div_ceil(BLOCK_SIZE as u64) > self.segs.unit_blocks() {
            return Err(Error::InvalidArgument(format!(
                "block size {} exceeds a segment",
                block_size
            )));
        }

        self.pre_write().await?;
        self.prepare_append().await?;
        let condition = self.validate_write(block_size, blocks)?;

        for chunk in data.chunks(block_size as usize) {
            self.stage_block(chunk, opts.compress).await?;
        }
        if !opts.buffered || self.pending_bytes >= self.config.cached_writes_max {
            self.flush_writes().await?;
        }
        Ok(WriteOutcome { blocks, condition })
    }

    /// Write `count` filemarks, or setmarks. Buffered data is flushed; a
    /// count of 0 only flushes.
    pub async fn write_filemarks(&mut self, count: u32, setmark: bool) -> Result<WriteOutcome> {
        self.pre_write().await?;
        if count == 0 {
            self.flush_writes().await?;
            return Ok(WriteOutcome::default());
        }
        self.prepare_append().await?;
        let condition = self.validate_write(0, count)?;

        let kind = if setmark { EntryKind::Setmark } else { EntryKind::Filemark };
        for _ in 0..count {
            let (segment_id, resume) = match &self.data_cursor {
                Some(c) => (c.segment_id, BlockPtr::new(c.ptr.bid(), c.b_cur)),
                None => (0, BlockPtr::NULL),
            };
            self.insert_entry(BlockEntry::mark(kind, resume, segment_id)).await?;
        }
        log::debug!(
            "TapePartition::write_filemarks: partition {} wrote {} {:?} at {}",
            self.id(),
            count,
            kind,
            self.current_lid()
        );
        self.flush_writes().await?;
        Ok(WriteOutcome { blocks: count, condition })
    }

    /// Erase from the position to the end of data
    pub async fn erase(&mut self) -> Result<()> {
        self.pre_write().await?;
        if self.at_eod()? {
            return Ok(());
        }
        if self.is_worm() {
            log::warn!("TapePartition::erase: partition {} is WORM", self.id());
            return Err(Error::WormViolation);
        }
        self.write_eod().await?;
        self.flush_writes().await
    }

    pub(super) async fn pre_write(&mut self) -> Result<()> {
        if self.direction == Direction::Read {
            self.flush_reads().await?;
            self.direction = Direction::Write;
        }
        Ok(())
    }

    /// Make the position the end of data, truncating what follows
    async fn prepare_append(&mut self) -> Result<()> {
        if !self.at_eod()? {
            if self.is_worm() {
                log::warn!(
                    "TapePartition::prepare_append: partition {} is WORM, overwrite at {} refused",
                    self.id(),
                    self.current_lid()
                );
                return Err(Error::WormViolation);
            }
            self.write_eod().await?;
        }
        self.sync_segments().await
    }

    /// Truncate block map, lookup chain and segments at the position
    pub(super) async fn write_eod(&mut self) -> Result<()> {
        let lid = self.current_lid();
        let cur = self.cur;
        let map = self.cur_map_mut()?;
        map.ensure_loaded().await?;
        let dropped = map.truncate_at_cursor();
        let mref = map.mref;
        let (fids, sids) = map.mark_counts();
        let empty = map.is_empty();

        for mut later in self.maps.drain(cur + 1..) {
            self.read_cached = self.read_cached.saturating_sub(later.drop_read_cache());
        }
        self.chain.write_eod(mref)?;
        self.chain.set_marks(mref, fids, sids)?;

        if empty && self.chain.first_ref() != Some(mref) {
            let prev = self
                .chain
                .remove_last_map(&self.segs, mref)
                .await?
                .ok_or_else(|| Error::Format("lookup chain lost its first map".into()))?;
            self.maps.pop_back();
            if self.cur > 0 {
                self.cur -= 1;
            } else {
                let map = self.load_map(prev).await?;
                self.maps.push_back(map);
            }
            let map = self.cur_map_mut()?;
            map.ensure_loaded().await?;
            map.cursor = None;
        }

        self.segments_synced = false;
        self.sync_segments().await?;
        match self.meta_cursor {
            Some(c) => self.segs.eod_segments(SegmentKind::Meta, c.segment_id, false).await?,
            None => self.segs.eod_segments(SegmentKind::Meta, 0, true).await?,
        }
        match self.data_cursor {
            Some(c) => self.segs.eod_segments(SegmentKind::Data, c.segment_id, false).await?,
            None => self.segs.eod_segments(SegmentKind::Data, 0, true).await?,
        }
        log::info!(
            "TAPE_PARTITION: partition {} truncated at {} ({} entries dropped from the map)",
            self.id(),
            lid,
            dropped
        );
        Ok(())
    }

    /// Compress and place one data block, then add it to the current map
    async fn stage_block(&mut self, chunk: &[u8], compress: bool) -> Result<()> {
        let esize = chunk.len() as u32;
        let raw_blocks = (esize as u64).div_ceil(BLOCK_SIZE as u64);
        let mut payload = None;
        let mut csize = 0;
        if let (true, Some(codec)) = (compress, self.codec.clone()) {
            if let Some(frame) = self.workers.compress(codec, chunk.to_vec()).await? {
                let units = (frame.len() as u32).div_ceil(CSIZE_UNIT);
                let frame_blocks = ((units * CSIZE_UNIT) as u64).div_ceil(BLOCK_SIZE as u64);
                if units <= EntryBits::max_csize() && frame_blocks <= raw_blocks {
                    csize = units;
                    payload = Some(frame);
                }
            }
        }
        let mut payload = payload.unwrap_or_else(|| chunk.to_vec());
        payload.resize(payload.len().next_multiple_of(BLOCK_SIZE), 0);
        let blocks = (payload.len() / BLOCK_SIZE) as u64;

        let (ptr, segment_id) = self.take_data_blocks(blocks).await?;
        let mut entry = BlockEntry::data(ptr, segment_id, esize, csize);
        entry.data = EntryData::Staged(payload);
        self.insert_entry(entry).await?;
        self.pending_bytes += blocks * BLOCK_SIZE as u64;
        self.pending_blocks += 1;

        let staged: u64 = self
            .cur_map()
            .map(|m| {
                m.entries()
                    .iter()
                    .filter(|e| matches!(e.data, EntryData::Staged(_)))
                    .map(|e| e.disk_blocks() * BLOCK_SIZE as u64)
                    .sum()
            })
            .unwrap_or(0);
        if staged >= self.config.map_cached_writes_max {
            self.start_map_writes(self.cur)?;
        }
        Ok(())
    }

    async fn take_data_blocks(&mut self, blocks: u64) -> Result<(BlockPtr, u32)> {
        if let Some(cursor) = self.data_cursor.as_mut() {
            if let Some(ptr) = cursor.take(blocks) {
                return Ok((ptr, cursor.segment_id));
            }
        }
        self.segs.alloc_segment(SegmentKind::Data, &mut self.data_cursor).await?;
        let cursor = self
            .data_cursor
            .as_mut()
            .ok_or_else(|| Error::Format("data segment cursor unset".into()))?;
        let ptr = cursor.take(blocks).ok_or_else(|| {
            Error::InvalidArgument(format!("{} blocks do not fit in a segment", blocks))
        })?;
        Ok((ptr, cursor.segment_id))
    }

    async fn take_meta_page(&mut self) -> Result<(BlockPtr, u32)> {
        if let Some(cursor) = self.meta_cursor.as_mut() {
            if let Some(ptr) = cursor.take(1) {
                return Ok((ptr, cursor.segment_id));
            }
        }
        self.segs.alloc_segment(SegmentKind::Meta, &mut self.meta_cursor).await?;
        let cursor = self
            .meta_cursor
            .as_mut()
            .ok_or_else(|| Error::Format("metadata segment cursor unset".into()))?;
        let ptr = cursor
            .take(1)
            .ok_or_else(|| Error::Format("fresh metadata segment is full".into()))?;
        Ok((ptr, cursor.segment_id))
    }

    /// Append at the end of data, starting a new map when the current one
    /// is full or out of mark slots
    async fn insert_entry(&mut self, entry: BlockEntry) -> Result<()> {
        let kind = entry.kind;
        let need_map = match self.cur_map() {
            None => true,
            Some(map) => !map.can_insert(kind),
        };
        if need_map {
            self.new_map_for_write().await?;
        }
        let map = self.cur_map_mut()?;
        map.push_entry(entry)?;
        if kind.is_mark() {
            let (fids, sids) = map.mark_counts();
            let mref = map.mref;
            self.chain.set_marks(mref, fids, sids)?;
        }
        Ok(())
    }

    async fn new_map_for_write(&mut self) -> Result<()> {
        let ids = match self.cur_map() {
            Some(map) => {
                let (fids, sids) = map.mark_counts();
                IdsStart {
                    lid: map.ids.lid + map.len() as u64,
                    fid: map.ids.fid + fids as u64,
                    sid: map.ids.sid + sids as u64,
                }
            }
            None => IdsStart::default(),
        };
        if self.chain.last_is_full() {
            let (location, _) = self.take_meta_page().await?;
            self.chain.add_unit(location)?;
        }
        let (location, segment_id) = self.take_meta_page().await?;
        let mref = self.chain.append_map(location, ids.lid)?;
        log::debug!(
            "TapePartition::new_map_for_write: partition {} map at {} from lid {}",
            self.id(),
            location,
            ids.lid
        );
        self.maps.push_back(BlockMap::new_map(mref, location, segment_id, ids));
        self.cur = self.maps.len() - 1;
        Ok(())
    }

    fn handle_for(&self, handles: &mut HashMap<u32, DeviceHandle>, bid: u32) -> Result<DeviceHandle> {
        if let Some(handle) = handles.get(&bid) {
            return Ok(handle.clone());
        }
        let handle = self.segs.handle(bid)?;
        handles.insert(bid, handle.clone());
        Ok(handle)
    }

    /// Queue the staged data of map `index` for writing without waiting
    fn start_map_writes(&mut self, index: usize) -> Result<()> {
        let mut handles = HashMap::new();
        let mut batch = IoBatch::new(IoDirection::Write, &self.workers);
        let mut staged = Vec::new();
        if let Some(map) = self.maps.get(index) {
            for (i, entry) in map.entries().iter().enumerate() {
                if let EntryData::Staged(payload) = &entry.data {
                    let handle = self.handle_for(&mut handles, entry.block.bid())?;
                    for (n, page) in payload.chunks(BLOCK_SIZE).enumerate() {
                        batch.add_page(&handle, entry.block.block() + n as u64, page.to_vec());
                    }
                    staged.push(i);
                }
            }
        }
        if staged.is_empty() {
            return Ok(());
        }
        let request = batch.submit();
        if let Some(map) = self.maps.get_mut(index) {
            for i in staged {
                if let Some(entry) = map.entry_mut(i) {
                    entry.data = EntryData::Writing(request.clone());
                }
            }
        }
        Ok(())
    }

    /// Cut the content back to the first block whose write failed. Blocks
    /// written before it are kept; it and everything after it are gone, so
    /// no entry is left waiting on the failed request.
    async fn drop_failed_tail(&mut self) -> Result<()> {
        let mut failed = None;
        for (mi, map) in self.maps.iter_mut().enumerate() {
            for (ei, entry) in map.entries_mut().enumerate() {
                if failed.is_some() {
                    break;
                }
                let write_failed = match &entry.data {
                    EntryData::Writing(request) => request.has_failed(),
                    _ => continue,
                };
                if write_failed {
                    failed = Some((mi, ei));
                } else {
                    entry.data = EntryData::None;
                }
            }
        }
        self.pending_bytes = 0;
        self.pending_blocks = 0;
        let Some((mi, ei)) = failed else { return Ok(()) };

        self.cur = mi;
        self.cur_map_mut()?.set_cursor(ei);
        self.segments_synced = false;
        self.write_eod().await?;
        log::warn!(
            "TapePartition::drop_failed_tail: partition {} now ends at {}",
            self.id(),
            self.current_lid()
        );
        Ok(())
    }

    /// Persist buffered data, then block maps, then lookup units
    pub async fn flush_writes(&mut self) -> Result<()> {
        for index in 0..self.maps.len() {
            self.start_map_writes(index)?;
        }
        let mut inflight: Vec<Arc<IoRequest>> = Vec::new();
        for map in &self.maps {
            for entry in map.entries() {
                if let EntryData::Writing(request) = &entry.data {
                    if !inflight.iter().any(|r| Arc::ptr_eq(r, request)) {
                        inflight.push(request.clone());
                    }
                }
            }
        }
        if wait_all(&inflight).await {
            log::error!("TapePartition::flush_writes: data write failed on partition {}", self.id());
            if let Err(err) = self.drop_failed_tail().await {
                log::error!(
                    "TapePartition::flush_writes: partition {} could not drop unwritten blocks: {}",
                    self.id(),
                    err
                );
            }
            return Err(Error::media(format!("data write failed on partition {}", self.id())));
        }
        for map in self.maps.iter_mut() {
            for entry in map.entries_mut() {
                if matches!(entry.data, EntryData::Writing(_)) {
                    entry.data = EntryData::None;
                }
            }
        }

        let mut handles = HashMap::new();
        let mut batch = IoBatch::new(IoDirection::Write, &self.workers);
        let mut flushed = Vec::new();
        for (i, map) in self.maps.iter().enumerate() {
            if map.needs_flush() {
                let handle = self.handle_for(&mut handles, map.location.bid())?;
                batch.add_page(&handle, map.location.block(), map.encode());
                flushed.push(i);
            }
        }
        if !flushed.is_empty() {
            if batch.submit().wait().await {
                log::error!("TapePartition::flush_writes: block map write failed on partition {}", self.id());
                return Err(Error::media(format!("block map write failed on partition {}", self.id())));
            }
            for i in &flushed {
                if let Some(map) = self.maps.get_mut(*i) {
                    map.mark_clean();
                }
            }
        }

        let units = self.chain.flush(&self.segs).await?;
        if self.pending_blocks > 0 || !flushed.is_empty() || units > 0 {
            log::debug!(
                "TapePartition::flush_writes: partition {} wrote {} blocks, {} maps, {} lookup units",
                self.id(),
                self.pending_blocks,
                flushed.len(),
                units
            );
        }
        self.pending_bytes = 0;
        self.pending_blocks = 0;
        self.trim_window();
        Ok(())
    }
}
