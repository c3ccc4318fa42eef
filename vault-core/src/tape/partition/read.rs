//! Read path and read-ahead

use std::sync::Arc;

use super::{Direction, ReadOutcome, TapePartition};
use crate::blockdev::BLOCK_SIZE;
use crate::error::{Condition, Error, Result};
use crate::io::{decompress_block, wait_all, IoBatch, IoDirection, IoRequest};
use crate::tape::entry::{EntryData, EntryKind};

impl TapePartition {
    /// Read up to `num_blocks` blocks of `block_size` bytes (fixed mode) or
    /// one block of at most `block_size` bytes (variable mode).
    ///
    /// A tape-mark ends the read after positioning past it; a block of a
    /// different size ends it with `LengthMismatch`.
    pub async fn read(&mut self, block_size: u32, num_blocks: u32, fixed: bool) -> Result<ReadOutcome> {
        self.pre_read().await?;
        let wanted = if fixed { num_blocks } else { 1 };
        let mut out = ReadOutcome::default();

        for _ in 0..wanted {
            if !self.settle().await? {
                out.condition = Some(Condition::EndOfData);
                break;
            }
            let kind = self
                .cur_map()
                .and_then(|m| m.current_entry())
                .map(|e| e.kind)
                .ok_or_else(|| Error::Format("no entry under the cursor".into()))?;
            if kind.is_mark() {
                self.cur_map_mut()?.advance();
                out.condition = Some(match kind {
                    EntryKind::Setmark => Condition::Setmark,
                    _ => Condition::Filemark,
                });
                break;
            }

            self.readahead().await?;
            let (bytes, compressed) = self.fetch_current().await?;
            self.cur_map_mut()?.advance();
            out.blocks += 1;
            out.compressed_bytes += compressed;
            if bytes.len() != block_size as usize {
                let keep = bytes.len().min(block_size as usize);
                out.data.extend_from_slice(&bytes[..keep]);
                out.condition = Some(Condition::LengthMismatch {
                    actual: bytes.len() as u32,
                });
                break;
            }
            out.data.extend_from_slice(&bytes);
        }

        self.trim_window();
        log::trace!(
            "TapePartition::read: partition {} read {} blocks ({:?}) now at {}",
            self.id(),
            out.blocks,
            out.condition,
            self.current_lid()
        );
        Ok(out)
    }

    pub(super) async fn pre_read(&mut self) -> Result<()> {
        if self.direction == Direction::Write {
            self.flush_writes().await?;
            self.direction = Direction::Read;
        }
        Ok(())
    }

    /// Bytes of the entry under the cursor, decompressed; also returns the
    /// on-disk size when the block was compressed
    async fn fetch_current(&mut self) -> Result<(Vec<u8>, u64)> {
        let (data, block, blocks, esize, compressed) = {
            let map = self.cur_map_mut()?;
            let index = map
                .cursor
                .ok_or_else(|| Error::Format("no entry under the cursor".into()))?;
            let entry = map
                .entry_mut(index)
                .ok_or_else(|| Error::Format(format!("entry {} missing", index)))?;
            (
                std::mem::take(&mut entry.data),
                entry.block,
                entry.disk_blocks(),
                entry.esize,
                entry.is_compressed().then(|| entry.disk_size()),
            )
        };
        let cached = blocks * BLOCK_SIZE as u64;

        let mut raw = match data {
            EntryData::Cached(bytes) => {
                self.read_cached = self.read_cached.saturating_sub(cached);
                bytes
            }
            EntryData::Reading(request, slots) => {
                self.read_cached = self.read_cached.saturating_sub(cached);
                collect_pages(&request, &slots, block).await?
            }
            EntryData::Staged(bytes) => bytes,
            EntryData::Writing(_) | EntryData::None => {
                let handle = self.segs.handle(block.bid())?;
                let mut batch = IoBatch::new(IoDirection::Read, &self.workers);
                let slots: Vec<usize> = (0..blocks).map(|n| batch.add_read(&handle, block.block() + n)).collect();
                let request = batch.submit();
                collect_pages(&request, &slots, block).await?
            }
        };

        match compressed {
            Some(disk_size) => {
                raw.truncate(disk_size as usize);
                let bytes = decompress_block(&raw)?;
                if bytes.len() != esize as usize {
                    return Err(Error::Compression(format!(
                        "block at {} expanded to {} bytes, expected {}",
                        block,
                        bytes.len(),
                        esize
                    )));
                }
                Ok((bytes, disk_size))
            }
            None => {
                raw.truncate(esize as usize);
                Ok((raw, 0))
            }
        }
    }

    /// Keep the read pipeline full: once cached bytes fall to the low
    /// watermark, load following maps and queue data reads up to the high
    /// watermark
    pub(super) async fn readahead(&mut self) -> Result<()> {
        if self.read_cached > self.config.read_cache_min {
            return Ok(());
        }

        while self.maps.len().saturating_sub(self.cur + 1) < self.config.map_readahead {
            let Some(last) = self.maps.back().map(|m| m.mref) else { break };
            match self.chain.next_ref(&self.segs, last).await? {
                Some(next) => {
                    let map = self.load_map_deferred(next)?;
                    self.maps.push_back(map);
                }
                None => break,
            }
        }

        let mut batch = IoBatch::new(IoDirection::Read, &self.workers);
        let mut queued = Vec::new();
        let mut budget = self.config.read_cache_max.saturating_sub(self.read_cached);
        'maps: for mi in self.cur..self.maps.len() {
            {
                let map = &mut self.maps[mi];
                if map.is_pending() {
                    if !map.load_ready() {
                        break;
                    }
                    map.ensure_loaded().await?;
                }
            }
            let map = &self.maps[mi];
            let start = if mi == self.cur { map.cursor_index() } else { 0 };
            for (ei, entry) in map.entries().iter().enumerate().skip(start) {
                if entry.kind != EntryKind::Data || !matches!(entry.data, EntryData::None) {
                    continue;
                }
                let bytes = entry.disk_blocks() * BLOCK_SIZE as u64;
                if bytes > budget {
                    break 'maps;
                }
                let handle = self.segs.handle(entry.block.bid())?;
                let slots: Vec<usize> = (0..entry.disk_blocks())
                    .map(|n| batch.add_read(&handle, entry.block.block() + n))
                    .collect();
                budget -= bytes;
                queued.push((mi, ei, slots, bytes));
            }
        }
        if queued.is_empty() {
            return Ok(());
        }

        let request = batch.submit();
        for (mi, ei, slots, bytes) in queued {
            if let Some(entry) = self.maps.get_mut(mi).and_then(|m| m.entry_mut(ei)) {
                entry.data = EntryData::Reading(request.clone(), slots);
                self.read_cached += bytes;
            }
        }
        log::trace!(
            "TapePartition::readahead: partition {} has {} bytes cached",
            self.id(),
            self.read_cached
        );
        Ok(())
    }

    /// Let queued reads and deferred map loads finish, then drop the read
    /// cache and the maps read ahead
    pub async fn flush_reads(&mut self) -> Result<()> {
        let mut inflight: Vec<Arc<IoRequest>> = Vec::new();
        for map in &self.maps {
            if let Some(request) = map.pending_request() {
                inflight.push(request);
            }
            for entry in map.entries() {
                if let EntryData::Reading(request, _) = &entry.data {
                    if !inflight.iter().any(|r| Arc::ptr_eq(r, request)) {
                        inflight.push(request.clone());
                    }
                }
            }
        }
        if wait_all(&inflight).await {
            log::debug!("TapePartition::flush_reads: a read-ahead request failed, dropping it");
        }
        for map in self.maps.iter_mut() {
            map.drop_read_cache();
        }
        let keep = self.cur + 1;
        while self.maps.len() > keep {
            match self.maps.back() {
                Some(map) if !map.needs_flush() => {
                    self.maps.pop_back();
                }
                _ => break,
            }
        }
        self.read_cached = 0;
        Ok(())
    }
}

async fn collect_pages(request: &IoRequest, slots: &[usize], block: crate::format::BlockPtr) -> Result<Vec<u8>> {
    if request.wait().await {
        return Err(Error::media(format!("data read at {} failed", block)));
    }
    let mut raw = Vec::with_capacity(slots.len() * BLOCK_SIZE);
    for slot in slots {
        let page = request
            .take_page(*slot)
            .ok_or_else(|| Error::media(format!("data read at {} returned no data", block)))?;
        raw.extend_from_slice(&page);
    }
    Ok(raw)
}
