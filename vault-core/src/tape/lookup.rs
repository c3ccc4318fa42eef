//! Lookup index: a linked chain of pages pointing at block maps
//!
//! Every unit records, for up to [`LOOKUP_ENTRIES`] block maps, the logical
//! id of the map's first entry, the filemarks and setmarks in the map, and
//! the map's page. Unit headers carry the running totals at the start of the
//! unit so whole units can be skipped while locating.
//!
//! The chain is kept as an arena of resident units in chain order. The first
//! unit stays resident; others are loaded on demand through the persisted
//! links and dropped once the position moves past them.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::format::{is_zero_page, seal_page, verify_page, zero_page, BlockPtr, FormatError};
use crate::io;
use crate::segment::SegmentTable;

/// Block maps referenced by one unit
pub const LOOKUP_ENTRIES: usize = 253;

/// Filemarks (and, separately, setmarks) one block map may hold
pub const MAX_MAP_MARKS: u8 = 15;

const ENTRY_BYTES: usize = 16;
const TRAILER: usize = LOOKUP_ENTRIES * ENTRY_BYTES;
const LID_MASK: u64 = (1 << 56) - 1;

/// One block map as seen from the lookup index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupEntry {
    /// Logical id of the map's first entry
    pub lid: u64,
    pub fids: u8,
    pub sids: u8,
    pub location: BlockPtr,
}

impl LookupEntry {
    fn encode(&self, out: &mut [u8]) {
        let info = (self.lid & LID_MASK) | ((self.fids as u64 & 0xf) << 56) | ((self.sids as u64 & 0xf) << 60);
        LittleEndian::write_u64(&mut out[..8], info);
        LittleEndian::write_u64(&mut out[8..16], self.location.raw());
    }

    fn decode(raw: &[u8]) -> Self {
        let info = LittleEndian::read_u64(&raw[..8]);
        Self {
            lid: info & LID_MASK,
            fids: ((info >> 56) & 0xf) as u8,
            sids: ((info >> 60) & 0xf) as u8,
            location: BlockPtr::from_raw(LittleEndian::read_u64(&raw[8..16])),
        }
    }
}

/// Position of a block map within the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRef {
    pub unit: BlockPtr,
    pub index: usize,
}

/// Running totals in front of a block map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdsStart {
    pub lid: u64,
    pub fid: u64,
    pub sid: u64,
}

/// One page of the chain
#[derive(Debug, Clone)]
pub struct LookupUnit {
    pub location: BlockPtr,
    pub next: BlockPtr,
    pub prev: BlockPtr,
    pub l_ids_start: u64,
    pub f_ids_start: u64,
    pub s_ids_start: u64,
    pub entries: Vec<LookupEntry>,
    pub dirty: bool,
}

impl LookupUnit {
    pub fn new(location: BlockPtr, prev: BlockPtr, start: IdsStart) -> Self {
        Self {
            location,
            next: BlockPtr::NULL,
            prev,
            l_ids_start: start.lid,
            f_ids_start: start.fid,
            s_ids_start: start.sid,
            entries: Vec::new(),
            dirty: true,
        }
    }

    pub fn decode(page: &[u8], location: BlockPtr) -> std::result::Result<Self, FormatError> {
        verify_page(page, location.block())?;
        let t = &page[TRAILER..];
        let map_nrs = LittleEndian::read_u16(&t[32..34]) as usize;
        if map_nrs > LOOKUP_ENTRIES {
            return Err(FormatError::InvalidField("lookup map count"));
        }
        let entries = page[..map_nrs * ENTRY_BYTES]
            .chunks_exact(ENTRY_BYTES)
            .map(LookupEntry::decode)
            .collect();
        Ok(Self {
            location,
            next: BlockPtr::from_raw(LittleEndian::read_u64(&t[0..8])),
            prev: BlockPtr::from_raw(LittleEndian::read_u64(&t[8..16])),
            l_ids_start: LittleEndian::read_u64(&t[16..24]),
            f_ids_start: LittleEndian::read_u32(&t[24..28]) as u64,
            s_ids_start: LittleEndian::read_u32(&t[28..32]) as u64,
            entries,
            dirty: false,
        })
    }

    /// Serialize the unit; the running filemark and setmark totals must fit
    /// their 32-bit on-disk fields
    pub fn encode(&self) -> std::result::Result<Vec<u8>, FormatError> {
        let f_ids_start = u32::try_from(self.f_ids_start).map_err(|_| FormatError::InvalidField("lookup filemark total"))?;
        let s_ids_start = u32::try_from(self.s_ids_start).map_err(|_| FormatError::InvalidField("lookup setmark total"))?;
        let mut page = zero_page();
        for (i, entry) in self.entries.iter().enumerate() {
            entry.encode(&mut page[i * ENTRY_BYTES..(i + 1) * ENTRY_BYTES]);
        }
        let t = &mut page[TRAILER..];
        LittleEndian::write_u64(&mut t[0..8], self.next.raw());
        LittleEndian::write_u64(&mut t[8..16], self.prev.raw());
        LittleEndian::write_u64(&mut t[16..24], self.l_ids_start);
        LittleEndian::write_u32(&mut t[24..28], f_ids_start);
        LittleEndian::write_u32(&mut t[28..32], s_ids_start);
        LittleEndian::write_u16(&mut t[32..34], self.entries.len() as u16);
        seal_page(&mut page);
        Ok(page)
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= LOOKUP_ENTRIES
    }

    /// Totals in front of entry `index`
    pub fn ids_start(&self, index: usize) -> IdsStart {
        let mut start = IdsStart {
            lid: self.l_ids_start,
            fid: self.f_ids_start,
            sid: self.s_ids_start,
        };
        for entry in &self.entries[..index.min(self.entries.len())] {
            start.fid += entry.fids as u64;
            start.sid += entry.sids as u64;
        }
        if let Some(entry) = self.entries.get(index) {
            start.lid = entry.lid;
        }
        start
    }

    /// Totals after the last entry; the logical id is that of the last map's start
    fn ids_end(&self) -> IdsStart {
        self.ids_start(self.entries.len())
    }
}

/// The resident part of a partition's lookup chain
#[derive(Debug, Default)]
pub struct LookupChain {
    units: Vec<LookupUnit>,
}

impl LookupChain {
    /// Chain of a partition without content
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the first unit from `location`; a never-written page means the
    /// partition has no content
    pub async fn load(segs: &SegmentTable, location: BlockPtr) -> Result<Self> {
        let page = read_unit_page(segs, location).await?;
        if is_zero_page(&page) {
            return Ok(Self::empty());
        }
        let unit = LookupUnit::decode(&page, location)?;
        log::debug!(
            "LookupChain::load: first unit at {} with {} maps",
            location,
            unit.entries.len()
        );
        Ok(Self { units: vec![unit] })
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn resident(&self) -> usize {
        self.units.len()
    }

    pub fn first_ref(&self) -> Option<MapRef> {
        let first = self.units.first()?;
        if first.entries.is_empty() {
            return None;
        }
        Some(MapRef {
            unit: first.location,
            index: 0,
        })
    }

    fn pos(&self, location: BlockPtr) -> Option<usize> {
        self.units.iter().position(|u| u.location == location)
    }

    pub fn unit(&self, location: BlockPtr) -> Result<&LookupUnit> {
        self.pos(location)
            .map(|i| &self.units[i])
            .ok_or_else(|| Error::Format(format!("lookup unit {} not resident", location)))
    }

    fn unit_mut(&mut self, location: BlockPtr) -> Result<&mut LookupUnit> {
        let i = self
            .pos(location)
            .ok_or_else(|| Error::Format(format!("lookup unit {} not resident", location)))?;
        Ok(&mut self.units[i])
    }

    pub fn entry(&self, r: MapRef) -> Result<LookupEntry> {
        self.unit(r.unit)?
            .entries
            .get(r.index)
            .copied()
            .ok_or_else(|| Error::Format(format!("lookup entry {} of {} missing", r.index, r.unit)))
    }

    /// Totals in front of the map at `r`
    pub fn ids_start(&self, r: MapRef) -> Result<IdsStart> {
        Ok(self.unit(r.unit)?.ids_start(r.index))
    }

    /// Make the unit at `location` resident, next to its neighbour `near`
    async fn ensure_unit(&mut self, segs: &SegmentTable, location: BlockPtr, after: bool, near: BlockPtr) -> Result<()> {
        if self.pos(location).is_some() {
            return Ok(());
        }
        let page = read_unit_page(segs, location).await?;
        let unit = LookupUnit::decode(&page, location)?;
        let anchor = self.pos(near).unwrap_or(0);
        let at = if after { anchor + 1 } else { anchor };
        log::trace!("LookupChain: loaded unit {} ({} maps)", location, unit.entries.len());
        self.units.insert(at.min(self.units.len()), unit);
        Ok(())
    }

    /// The map following `r`, loading the next unit if needed
    pub async fn next_ref(&mut self, segs: &SegmentTable, r: MapRef) -> Result<Option<MapRef>> {
        let unit = self.unit(r.unit)?;
        if r.index + 1 < unit.entries.len() {
            return Ok(Some(MapRef {
                unit: r.unit,
                index: r.index + 1,
            }));
        }
        let next = unit.next;
        if next.is_null() {
            return Ok(None);
        }
        self.ensure_unit(segs, next, true, r.unit).await?;
        if self.unit(next)?.entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(MapRef { unit: next, index: 0 }))
    }

    /// The map preceding `r`, loading the previous unit if needed
    pub async fn prev_ref(&mut self, segs: &SegmentTable, r: MapRef) -> Result<Option<MapRef>> {
        if r.index > 0 {
            return Ok(Some(MapRef {
                unit: r.unit,
                index: r.index - 1,
            }));
        }
        let prev = self.unit(r.unit)?.prev;
        if prev.is_null() {
            return Ok(None);
        }
        self.ensure_unit(segs, prev, false, r.unit).await?;
        let len = self.unit(prev)?.entries.len();
        if len == 0 {
            return Err(Error::Format(format!("lookup unit {} has no maps", prev)));
        }
        Ok(Some(MapRef {
            unit: prev,
            index: len - 1,
        }))
    }

    /// Whether `r` is the last map of the chain
    pub fn is_last(&self, r: MapRef) -> Result<bool> {
        let unit = self.unit(r.unit)?;
        Ok(r.index + 1 >= unit.entries.len() && unit.next.is_null())
    }

    /// Logical ids held by the map at `r`, known only when a map follows it
    pub async fn map_lids(&mut self, segs: &SegmentTable, r: MapRef) -> Result<Option<u64>> {
        let lid = self.entry(r)?.lid;
        match self.next_ref(segs, r).await? {
            Some(next) => Ok(Some(self.entry(next)?.lid - lid)),
            None => Ok(None),
        }
    }

    /// The map holding logical id `lid`, or the last map when `lid` is at
    /// or past the end of recorded content
    pub async fn locate_entry(&mut self, segs: &SegmentTable, lid: u64) -> Result<Option<MapRef>> {
        let mut unit = match self.units.first() {
            Some(first) => first.location,
            None => return Ok(None),
        };
        // start from the furthest resident unit that does not pass the target
        for resident in &self.units {
            if resident.l_ids_start <= lid && !resident.entries.is_empty() {
                unit = resident.location;
            }
        }
        loop {
            let next = self.unit(unit)?.next;
            if next.is_null() {
                break;
            }
            self.ensure_unit(segs, next, true, unit).await?;
            let next_unit = self.unit(next)?;
            if next_unit.entries.is_empty() || next_unit.l_ids_start > lid {
                break;
            }
            unit = next;
        }
        let entries = &self.unit(unit)?.entries;
        if entries.is_empty() {
            return Ok(None);
        }
        let index = entries
            .iter()
            .rposition(|e| e.lid <= lid)
            .unwrap_or(0);
        Ok(Some(MapRef { unit, index }))
    }

    /// The map holding the `fid`-th filemark (0 based), with the filemark
    /// count in front of it; `None` if fewer filemarks are recorded
    pub async fn locate_file_entry(&mut self, segs: &SegmentTable, fid: u64) -> Result<Option<(MapRef, u64)>> {
        let mut unit = match self.units.first() {
            Some(first) => first.location,
            None => return Ok(None),
        };
        for resident in &self.units {
            if resident.f_ids_start <= fid && !resident.entries.is_empty() {
                unit = resident.location;
            }
        }
        loop {
            let next = self.unit(unit)?.next;
            if next.is_null() {
                break;
            }
            self.ensure_unit(segs, next, true, unit).await?;
            let next_unit = self.unit(next)?;
            if next_unit.entries.is_empty() || next_unit.f_ids_start > fid {
                break;
            }
            unit = next;
        }
        let u = self.unit(unit)?;
        let mut before = u.f_ids_start;
        for (index, entry) in u.entries.iter().enumerate() {
            if before + entry.fids as u64 > fid {
                return Ok(Some((MapRef { unit, index }, before)));
            }
            before += entry.fids as u64;
        }
        Ok(None)
    }

    /// Start a new unit at `location` after the current last one
    pub fn add_unit(&mut self, location: BlockPtr) -> Result<()> {
        let (prev, start) = match self.units.last_mut() {
            Some(last) => {
                if !last.next.is_null() {
                    return Err(Error::Format(format!(
                        "lookup unit {} is not the end of the chain",
                        last.location
                    )));
                }
                last.next = location;
                last.dirty = true;
                let mut start = last.ids_end();
                start.lid = last.entries.last().map(|e| e.lid).unwrap_or(last.l_ids_start);
                (last.location, start)
            }
            None => (BlockPtr::NULL, IdsStart::default()),
        };
        log::debug!("LookupChain::add_unit: unit at {} after {}", location, prev);
        self.units.push(LookupUnit::new(location, prev, start));
        Ok(())
    }

    /// Whether the last resident unit is the end of the chain and full
    pub fn last_is_full(&self) -> bool {
        self.units.last().map(|u| u.is_full()).unwrap_or(true)
    }

    /// Record a new block map starting at `lid` at the end of the chain
    pub fn append_map(&mut self, location: BlockPtr, lid: u64) -> Result<MapRef> {
        let last = self
            .units
            .last_mut()
            .ok_or_else(|| Error::Format("lookup chain has no units".into()))?;
        if last.is_full() || !last.next.is_null() {
            return Err(Error::Format(format!("lookup unit {} cannot take a map", last.location)));
        }
        if last.entries.is_empty() {
            last.l_ids_start = lid;
        }
        last.entries.push(LookupEntry {
            lid,
            fids: 0,
            sids: 0,
            location,
        });
        last.dirty = true;
        Ok(MapRef {
            unit: last.location,
            index: last.entries.len() - 1,
        })
    }

    /// Update the mark counts of the map at `r`
    pub fn set_marks(&mut self, r: MapRef, fids: u8, sids: u8) -> Result<()> {
        let unit = self.unit_mut(r.unit)?;
        let entry = unit
            .entries
            .get_mut(r.index)
            .ok_or_else(|| Error::Format(format!("lookup entry {} of {} missing", r.index, r.unit)))?;
        if entry.fids != fids || entry.sids != sids {
            entry.fids = fids.min(MAX_MAP_MARKS);
            entry.sids = sids.min(MAX_MAP_MARKS);
            unit.dirty = true;
        }
        Ok(())
    }

    /// Make the map at `r` the end of the chain, dropping every later map
    /// and unit. Returns whether anything was cut.
    pub fn write_eod(&mut self, r: MapRef) -> Result<bool> {
        let at = self
            .pos(r.unit)
            .ok_or_else(|| Error::Format(format!("lookup unit {} not resident", r.unit)))?;
        let unit = &mut self.units[at];
        let mut cut = false;
        if unit.entries.len() > r.index + 1 {
            unit.entries.truncate(r.index + 1);
            cut = true;
        }
        if !unit.next.is_null() {
            unit.next = BlockPtr::NULL;
            cut = true;
        }
        if cut {
            unit.dirty = true;
            self.units.truncate(at + 1);
        }
        Ok(cut)
    }

    /// Remove the last map `r` of the chain, and its unit if that empties
    /// it (the first unit is kept). Returns the map now at the end.
    ///
    /// The previous unit is made resident before anything changes, so a
    /// failed load leaves the chain as it was.
    pub async fn remove_last_map(&mut self, segs: &SegmentTable, r: MapRef) -> Result<Option<MapRef>> {
        if !self.is_last(r)? {
            return Err(Error::Format(format!("map {} of {} is not the last", r.index, r.unit)));
        }
        let (prev, only_map) = {
            let unit = self.unit(r.unit)?;
            (unit.prev, unit.entries.len() == 1)
        };
        if only_map && !prev.is_null() {
            self.ensure_unit(segs, prev, false, r.unit).await?;
        }

        let unit = self.unit_mut(r.unit)?;
        unit.entries.pop();
        unit.dirty = true;
        if !unit.entries.is_empty() {
            return Ok(Some(MapRef {
                unit: r.unit,
                index: unit.entries.len() - 1,
            }));
        }
        if prev.is_null() {
            return Ok(None);
        }
        if let Some(at) = self.pos(r.unit) {
            self.units.remove(at);
        }
        let prev_unit = self.unit_mut(prev)?;
        prev_unit.next = BlockPtr::NULL;
        prev_unit.dirty = true;
        let index = prev_unit.entries.len().saturating_sub(1);
        Ok(Some(MapRef { unit: prev, index }))
    }

    /// Drop clean units between the first one and `keep`
    pub fn release_before(&mut self, keep: BlockPtr) {
        let Some(at) = self.pos(keep) else { return };
        let mut index = 0;
        let before = self.units.len();
        self.units.retain(|u| {
            let i = index;
            index += 1;
            i == 0 || i >= at || u.dirty
        });
        if self.units.len() != before {
            log::trace!("LookupChain::release_before: dropped {} units", before - self.units.len());
        }
    }

    /// Write dirty units, later units first so a link is only persisted
    /// once the unit it points to is on disk
    pub async fn flush(&mut self, segs: &SegmentTable) -> Result<usize> {
        let mut written = 0;
        for unit in self.units.iter_mut().rev() {
            if !unit.dirty {
                continue;
            }
            let handle = segs.handle(unit.location.bid())?;
            io::write_page(segs.workers(), &handle, unit.location.block(), unit.encode()?).await?;
            unit.dirty = false;
            written += 1;
        }
        Ok(written)
    }

    pub fn has_dirty(&self) -> bool {
        self.units.iter().any(|u| u.dirty)
    }
}

async fn read_unit_page(segs: &SegmentTable, location: BlockPtr) -> Result<Vec<u8>> {
    let handle = segs.handle(location.bid())?;
    io::read_page(segs.workers(), &handle, location.block()).await
}
