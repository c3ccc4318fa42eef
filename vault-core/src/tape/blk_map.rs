//! Block maps: pages of up to [`BLOCK_MAP_ENTRIES`] tape entries
//!
//! A map page holds packed entries from offset 0 and a trailer with the
//! owning metadata segment, the entry count and the page checksum.

use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;

use super::entry::{BlockEntry, EntryData, EntryKind, RAW_ENTRY_SIZE};
use super::lookup::{IdsStart, MapRef, MAX_MAP_MARKS};
use crate::error::{Error, Result};
use crate::format::{seal_page, verify_page, zero_page, BlockPtr};
use crate::io::{DeviceHandle, IoBatch, IoDirection, IoRequest, WorkerPool};

/// Entries in one block map
pub const BLOCK_MAP_ENTRIES: usize = 255;

const TRAILER: usize = 4080;

/// Load state of a map
#[derive(Debug)]
pub enum MapState {
    /// Matches its page on disk
    Loaded,
    /// Metadata read in flight; the slot indexes into the request
    ReadPending(Arc<IoRequest>, usize),
    /// Changed since it was loaded
    Dirty,
    /// Never written
    New,
}

/// Spacing unit of a SPACE operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCode {
    Blocks,
    Filemarks,
    Setmarks,
    EndOfData,
}

/// Where a space inside one map stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceStop {
    /// Count satisfied
    Done,
    /// Stopped on a mark the code does not cross
    Mark(EntryKind),
    /// Map boundary reached with count left
    Boundary,
}

/// An in-memory block map
#[derive(Debug)]
pub struct BlockMap {
    pub mref: MapRef,
    pub location: BlockPtr,
    /// Metadata segment holding the page
    pub segment_id: u32,
    pub ids: IdsStart,
    entries: Vec<BlockEntry>,
    /// Next entry to read; `None` is the end of the map
    pub cursor: Option<usize>,
    state: MapState,
}

impl BlockMap {
    /// A fresh map whose first entry will get logical id `ids.lid`
    pub fn new_map(mref: MapRef, location: BlockPtr, segment_id: u32, ids: IdsStart) -> Self {
        Self {
            mref,
            location,
            segment_id,
            ids,
            entries: Vec::new(),
            cursor: None,
            state: MapState::New,
        }
    }

    /// Read and decode the map page at `location`
    pub async fn load_map(
        workers: &Arc<WorkerPool>,
        handle: &DeviceHandle,
        mref: MapRef,
        location: BlockPtr,
        ids: IdsStart,
    ) -> Result<Self> {
        let mut map = Self::load_deferred(workers, handle, mref, location, ids);
        map.ensure_loaded().await?;
        Ok(map)
    }

    /// Start reading the map page without waiting for it
    pub fn load_deferred(
        workers: &Arc<WorkerPool>,
        handle: &DeviceHandle,
        mref: MapRef,
        location: BlockPtr,
        ids: IdsStart,
    ) -> Self {
        let mut batch = IoBatch::new(IoDirection::Read, workers);
        let slot = batch.add_read(handle, location.block());
        let request = batch.submit();
        Self {
            mref,
            location,
            segment_id: 0,
            ids,
            entries: Vec::new(),
            cursor: None,
            state: MapState::ReadPending(request, slot),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, MapState::ReadPending(..))
    }

    /// Whether a deferred load can be finished without waiting
    pub fn load_ready(&self) -> bool {
        match &self.state {
            MapState::ReadPending(request, _) => request.is_done(),
            _ => true,
        }
    }

    /// The request of a deferred load still in flight
    pub fn pending_request(&self) -> Option<Arc<IoRequest>> {
        match &self.state {
            MapState::ReadPending(request, _) => Some(request.clone()),
            _ => None,
        }
    }

    /// Wait for a deferred load to finish and decode the page. A pending
    /// read is waited for, never issued again.
    pub async fn ensure_loaded(&mut self) -> Result<()> {
        let (request, slot) = match &self.state {
            MapState::ReadPending(request, slot) => (request.clone(), *slot),
            _ => return Ok(()),
        };
        if request.wait().await {
            return Err(Error::media(format!("block map read at {} failed", self.location)));
        }
        let page = request
            .take_page(slot)
            .ok_or_else(|| Error::media(format!("block map read at {} returned no data", self.location)))?;
        self.decode(&page)?;
        self.state = MapState::Loaded;
        if !self.entries.is_empty() {
            self.cursor = Some(0);
        }
        Ok(())
    }

    fn decode(&mut self, page: &[u8]) -> Result<()> {
        verify_page(page, self.location.block())?;
        let t = &page[TRAILER..];
        let segment_id = LittleEndian::read_u32(&t[0..4]);
        let nr_entries = LittleEndian::read_u16(&t[4..6]) as usize;
        if nr_entries > BLOCK_MAP_ENTRIES {
            return Err(Error::Format(format!(
                "block map at {} claims {} entries",
                self.location, nr_entries
            )));
        }
        self.segment_id = segment_id;
        self.entries = page[..nr_entries * RAW_ENTRY_SIZE]
            .chunks_exact(RAW_ENTRY_SIZE)
            .map(BlockEntry::decode)
            .collect();
        log::trace!("BlockMap::decode: {} entries at {}", nr_entries, self.location);
        Ok(())
    }

    /// Page image with the current entries
    pub fn encode(&self) -> Vec<u8> {
        let mut page = zero_page();
        for (i, entry) in self.entries.iter().enumerate() {
            entry.encode(&mut page[i * RAW_ENTRY_SIZE..(i + 1) * RAW_ENTRY_SIZE]);
        }
        let t = &mut page[TRAILER..];
        LittleEndian::write_u32(&mut t[0..4], self.segment_id);
        LittleEndian::write_u16(&mut t[4..6], self.entries.len() as u16);
        seal_page(&mut page);
        page
    }

    pub fn needs_flush(&self) -> bool {
        matches!(self.state, MapState::Dirty | MapState::New)
    }

    pub fn mark_clean(&mut self) {
        if self.needs_flush() {
            self.state = MapState::Loaded;
        }
    }

    fn mark_dirty(&mut self) {
        if matches!(self.state, MapState::Loaded) {
            self.state = MapState::Dirty;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= BLOCK_MAP_ENTRIES
    }

    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    pub fn entry_mut(&mut self, index: usize) -> Option<&mut BlockEntry> {
        self.entries.get_mut(index)
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut BlockEntry> {
        self.entries.iter_mut()
    }

    /// Filemarks and setmarks in the map
    pub fn mark_counts(&self) -> (u8, u8) {
        let mut counts = (0u8, 0u8);
        for entry in &self.entries {
            match entry.kind {
                EntryKind::Filemark => counts.0 += 1,
                EntryKind::Setmark => counts.1 += 1,
                EntryKind::Data => {}
            }
        }
        counts
    }

    /// Whether an entry of `kind` still fits
    pub fn can_insert(&self, kind: EntryKind) -> bool {
        if self.is_full() {
            return false;
        }
        let (fids, sids) = self.mark_counts();
        match kind {
            EntryKind::Data => true,
            EntryKind::Filemark => fids < MAX_MAP_MARKS,
            EntryKind::Setmark => sids < MAX_MAP_MARKS,
        }
    }

    /// Append at the end of the map; the cursor stays at the end
    pub fn push_entry(&mut self, entry: BlockEntry) -> Result<()> {
        if !self.can_insert(entry.kind) {
            return Err(Error::Format(format!("block map at {} cannot take more entries", self.location)));
        }
        self.entries.push(entry);
        self.cursor = None;
        self.mark_dirty();
        Ok(())
    }

    /// Index of the cursor, counting the end of the map as `len()`
    pub fn cursor_index(&self) -> usize {
        self.cursor.unwrap_or(self.entries.len())
    }

    pub fn set_cursor(&mut self, index: usize) {
        self.cursor = if index < self.entries.len() { Some(index) } else { None };
    }

    pub fn current_lid(&self) -> u64 {
        self.ids.lid + self.cursor_index() as u64
    }

    /// Filemarks and setmarks in front of the cursor, tape-wide
    pub fn current_ids(&self) -> (u64, u64) {
        let mut fid = self.ids.fid;
        let mut sid = self.ids.sid;
        for entry in &self.entries[..self.cursor_index()] {
            match entry.kind {
                EntryKind::Filemark => fid += 1,
                EntryKind::Setmark => sid += 1,
                EntryKind::Data => {}
            }
        }
        (fid, sid)
    }

    pub fn current_entry(&self) -> Option<&BlockEntry> {
        self.cursor.and_then(|i| self.entries.get(i))
    }

    pub fn advance(&mut self) {
        if let Some(i) = self.cursor {
            self.set_cursor(i + 1);
        }
    }

    /// Position at `lid`, clamped to the end of the map
    pub fn locate(&mut self, lid: u64) {
        let index = lid.saturating_sub(self.ids.lid) as usize;
        self.set_cursor(index);
    }

    /// Position right after the `fid`-th filemark of the tape. Returns
    /// false if the map holds no such filemark.
    pub fn locate_file(&mut self, fid: u64) -> bool {
        let mut seen = self.ids.fid;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.kind == EntryKind::Filemark {
                if seen == fid {
                    self.set_cursor(i + 1);
                    return true;
                }
                seen += 1;
            }
        }
        false
    }

    /// Space forward from the cursor, decrementing `count` as units are
    /// crossed. A stopping mark is crossed.
    pub fn space_forward(&mut self, code: SpaceCode, count: &mut u64) -> SpaceStop {
        while *count > 0 {
            let Some(entry) = self.current_entry() else {
                return SpaceStop::Boundary;
            };
            let kind = entry.kind;
            self.advance();
            match (code, kind) {
                (SpaceCode::Blocks, EntryKind::Data)
                | (SpaceCode::Filemarks, EntryKind::Filemark)
                | (SpaceCode::Setmarks, EntryKind::Setmark) => *count -= 1,
                (SpaceCode::Blocks, mark) => return SpaceStop::Mark(mark),
                (SpaceCode::Filemarks, EntryKind::Setmark) => return SpaceStop::Mark(EntryKind::Setmark),
                _ => {}
            }
        }
        SpaceStop::Done
    }

    /// Space backward from the cursor. A stopping mark is left under the
    /// cursor.
    pub fn space_backward(&mut self, code: SpaceCode, count: &mut u64) -> SpaceStop {
        while *count > 0 {
            let index = self.cursor_index();
            if index == 0 {
                return SpaceStop::Boundary;
            }
            let kind = self.entries[index - 1].kind;
            self.set_cursor(index - 1);
            match (code, kind) {
                (SpaceCode::Blocks, EntryKind::Data)
                | (SpaceCode::Filemarks, EntryKind::Filemark)
                | (SpaceCode::Setmarks, EntryKind::Setmark) => *count -= 1,
                (SpaceCode::Blocks, mark) => return SpaceStop::Mark(mark),
                (SpaceCode::Filemarks, EntryKind::Setmark) => return SpaceStop::Mark(EntryKind::Setmark),
                _ => {}
            }
        }
        SpaceStop::Done
    }

    /// Where data continues after the content in front of the cursor; the
    /// entry under the cursor when there is one. `None` for an empty map.
    pub fn data_resume(&self) -> Option<(u32, BlockPtr)> {
        match self.cursor {
            Some(i) => self.entries.get(i).map(|e| (e.segment_id, e.block)),
            None => self.entries.last().map(|e| (e.segment_id, e.data_end())),
        }
    }

    /// Drop every entry from the cursor on. Returns the dropped entries.
    pub fn truncate_at_cursor(&mut self) -> usize {
        let index = self.cursor_index();
        let dropped = self.entries.len() - index;
        if dropped > 0 {
            self.entries.truncate(index);
            self.mark_dirty();
        }
        self.cursor = None;
        dropped
    }

    /// Release read buffers and queued reads; returns the bytes released
    pub fn drop_read_cache(&mut self) -> u64 {
        let mut released = 0;
        for entry in &mut self.entries {
            if matches!(entry.data, EntryData::Cached(_) | EntryData::Reading(..)) {
                released += entry.disk_blocks() * crate::blockdev::BLOCK_SIZE as u64;
                entry.data = EntryData::None;
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> BlockMap {
        let mref = MapRef {
            unit: BlockPtr::new(1, 10),
            index: 0,
        };
        BlockMap::new_map(mref, BlockPtr::new(1, 11), 0, IdsStart { lid: 100, fid: 4, sid: 1 })
    }

    fn data(block: u64) -> BlockEntry {
        BlockEntry::data(BlockPtr::new(1, block), 2, 4096, 0)
    }

    fn fm() -> BlockEntry {
        BlockEntry::mark(EntryKind::Filemark, BlockPtr::NULL, 0)
    }

    #[test]
    fn test_encode_decode_page() {
        let mut m = map();
        m.segment_id = 3;
        m.push_entry(data(500)).unwrap();
        m.push_entry(fm()).unwrap();
        let page = m.encode();
        assert_eq!(LittleEndian::read_u32(&page[TRAILER..]), 3);
        assert_eq!(LittleEndian::read_u16(&page[TRAILER + 4..]), 2);

        let mut back = map();
        back.decode(&page).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.segment_id, 3);
        assert_eq!(back.entries()[1].kind, EntryKind::Filemark);

        let mut bad = page.clone();
        bad[3] ^= 0x10;
        assert!(matches!(back.decode(&bad), Err(Error::Checksum { block: 11 })));
    }

    #[test]
    fn test_mark_limit_forces_new_map() {
        let mut m = map();
        for _ in 0..MAX_MAP_MARKS {
            m.push_entry(fm()).unwrap();
        }
        assert!(!m.can_insert(EntryKind::Filemark));
        assert!(m.can_insert(EntryKind::Setmark));
        assert!(m.push_entry(fm()).is_err());
        while m.can_insert(EntryKind::Data) {
            m.push_entry(data(1)).unwrap();
        }
        assert_eq!(m.len(), BLOCK_MAP_ENTRIES);
    }

    #[test]
    fn test_locate_and_ids() {
        let mut m = map();
        m.push_entry(data(1)).unwrap();
        m.push_entry(fm()).unwrap();
        m.push_entry(data(2)).unwrap();
        m.push_entry(fm()).unwrap();

        m.locate(102);
        assert_eq!(m.cursor, Some(2));
        assert_eq!(m.current_ids(), (5, 1));
        m.locate(900);
        assert_eq!(m.cursor, None);
        assert_eq!(m.current_lid(), 104);

        // tape-wide filemark 5 is the second one in this map
        assert!(m.locate_file(5));
        assert_eq!(m.cursor, None);
        assert!(m.locate_file(4));
        assert_eq!(m.cursor, Some(2));
        assert!(!m.locate_file(6));
    }

    #[test]
    fn test_space_stops() {
        let mut m = map();
        m.push_entry(data(1)).unwrap();
        m.push_entry(data(2)).unwrap();
        m.push_entry(fm()).unwrap();
        m.push_entry(data(3)).unwrap();
        m.set_cursor(0);

        let mut count = 5;
        assert_eq!(m.space_forward(SpaceCode::Blocks, &mut count), SpaceStop::Mark(EntryKind::Filemark));
        assert_eq!(count, 3);
        assert_eq!(m.cursor, Some(3));

        let mut count = 2;
        assert_eq!(m.space_backward(SpaceCode::Blocks, &mut count), SpaceStop::Mark(EntryKind::Filemark));
        assert_eq!(m.cursor, Some(2));
        assert_eq!(count, 2);

        let mut count = 1;
        assert_eq!(m.space_forward(SpaceCode::Filemarks, &mut count), SpaceStop::Done);
        assert_eq!(m.cursor, Some(3));
        let mut count = 2;
        assert_eq!(m.space_forward(SpaceCode::Blocks, &mut count), SpaceStop::Boundary);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_truncate_and_resume() {
        let mut m = map();
        m.push_entry(data(10)).unwrap();
        m.push_entry(BlockEntry::data(BlockPtr::new(1, 11), 2, 9000, 0)).unwrap();
        m.push_entry(fm()).unwrap();
        m.mark_clean();

        m.set_cursor(1);
        assert_eq!(m.data_resume(), Some((2, BlockPtr::new(1, 11))));
        assert_eq!(m.truncate_at_cursor(), 2);
        assert!(m.needs_flush());
        assert_eq!(m.data_resume(), Some((2, BlockPtr::new(1, 11))));
        assert_eq!(m.truncate_at_cursor(), 0);

        m.set_cursor(0);
        m.truncate_at_cursor();
        assert_eq!(m.data_resume(), None);
    }
}
