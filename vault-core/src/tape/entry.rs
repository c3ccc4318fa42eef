//! Block entries and their packed on-disk form
//!
//! Each entry is 16 bytes on disk: the block pointer of its data followed
//! by an [`EntryBits`] word.

use std::sync::Arc;

use crate::blockdev::BLOCK_SIZE;
use crate::format::BlockPtr;
use crate::io::IoRequest;

/// Bytes of one packed entry
pub const RAW_ENTRY_SIZE: usize = 16;

/// Largest uncompressed block a tape can hold
pub const MAX_BLOCK_SIZE: u32 = (1 << 24) - 1;

/// Granularity of the compressed size field
pub const CSIZE_UNIT: u32 = 512;

const SEGMENT_BITS: u32 = 22;
const DATA_SHIFT: u32 = 22;
const ESIZE_SHIFT: u32 = 23;
const ESIZE_BITS: u32 = 24;
const CSIZE_SHIFT: u32 = 47;
const CSIZE_BITS: u32 = 15;

const fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

/// Packed entry descriptor.
///
/// | bits   | field                                          |
/// |--------|------------------------------------------------|
/// | 0..21  | data segment id                                |
/// | 22     | data block (1) or tape-mark (0)                |
/// | 23..46 | uncompressed size in bytes                     |
/// | 47..61 | compressed size in 512 byte units, 0 when raw; |
/// |        | for tape-marks 0 is a filemark, 1 a setmark    |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryBits(u64);

impl EntryBits {
    pub fn from_raw(raw: u64) -> Self {
        EntryBits(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn segment_id(self) -> u32 {
        (self.0 & mask(SEGMENT_BITS)) as u32
    }

    pub fn set_segment_id(&mut self, id: u32) {
        self.0 = (self.0 & !mask(SEGMENT_BITS)) | (id as u64 & mask(SEGMENT_BITS));
    }

    pub fn is_data(self) -> bool {
        self.0 & (1 << DATA_SHIFT) != 0
    }

    pub fn set_data(&mut self, data: bool) {
        if data {
            self.0 |= 1 << DATA_SHIFT;
        } else {
            self.0 &= !(1 << DATA_SHIFT);
        }
    }

    pub fn esize(self) -> u32 {
        ((self.0 >> ESIZE_SHIFT) & mask(ESIZE_BITS)) as u32
    }

    pub fn set_esize(&mut self, size: u32) {
        self.0 = (self.0 & !(mask(ESIZE_BITS) << ESIZE_SHIFT))
            | ((size as u64 & mask(ESIZE_BITS)) << ESIZE_SHIFT);
    }

    pub fn csize(self) -> u32 {
        ((self.0 >> CSIZE_SHIFT) & mask(CSIZE_BITS)) as u32
    }

    pub fn set_csize(&mut self, units: u32) {
        self.0 = (self.0 & !(mask(CSIZE_BITS) << CSIZE_SHIFT))
            | ((units as u64 & mask(CSIZE_BITS)) << CSIZE_SHIFT);
    }

    /// Largest value the compressed size field can hold, in units
    pub fn max_csize() -> u32 {
        mask(CSIZE_BITS) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Data,
    Filemark,
    Setmark,
}

impl EntryKind {
    pub fn is_mark(self) -> bool {
        self != EntryKind::Data
    }
}

/// Payload state of an entry
#[derive(Debug, Default)]
pub enum EntryData {
    #[default]
    None,
    /// Page padded bytes waiting to be written
    Staged(Vec<u8>),
    /// Submitted write
    Writing(Arc<IoRequest>),
    /// Queued read; the slots index into the request
    Reading(Arc<IoRequest>, Vec<usize>),
    /// Fetched on-disk bytes
    Cached(Vec<u8>),
}

/// One tape record
#[derive(Debug)]
pub struct BlockEntry {
    pub kind: EntryKind,
    /// Data location; for tape-marks the data cursor when the mark was written
    pub block: BlockPtr,
    /// Uncompressed size
    pub esize: u32,
    /// Compressed size in 512 byte units, 0 when stored raw
    pub csize: u32,
    pub segment_id: u32,
    pub data: EntryData,
}

impl BlockEntry {
    pub fn data(block: BlockPtr, segment_id: u32, esize: u32, csize: u32) -> Self {
        Self {
            kind: EntryKind::Data,
            block,
            esize,
            csize,
            segment_id,
            data: EntryData::None,
        }
    }

    pub fn mark(kind: EntryKind, resume: BlockPtr, segment_id: u32) -> Self {
        debug_assert!(kind.is_mark());
        Self {
            kind,
            block: resume,
            esize: 0,
            csize: 0,
            segment_id,
            data: EntryData::None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.kind == EntryKind::Data && self.csize > 0
    }

    /// Bytes occupied on disk before page padding
    pub fn disk_size(&self) -> u64 {
        match self.kind {
            EntryKind::Data if self.csize > 0 => (self.csize * CSIZE_UNIT) as u64,
            EntryKind::Data => self.esize as u64,
            _ => 0,
        }
    }

    /// Pages occupied on disk
    pub fn disk_blocks(&self) -> u64 {
        self.disk_size().div_ceil(BLOCK_SIZE as u64)
    }

    /// Where data written after this entry continues
    pub fn data_end(&self) -> BlockPtr {
        if self.block.is_null() {
            return BlockPtr::NULL;
        }
        self.block.offset(self.disk_blocks())
    }

    pub fn bits(&self) -> EntryBits {
        let mut bits = EntryBits::default();
        bits.set_segment_id(self.segment_id);
        match self.kind {
            EntryKind::Data => {
                bits.set_data(true);
                bits.set_esize(self.esize);
                bits.set_csize(self.csize);
            }
            EntryKind::Filemark => bits.set_csize(0),
            EntryKind::Setmark => bits.set_csize(1),
        }
        bits
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.block.raw().to_le_bytes());
        out[8..16].copy_from_slice(&self.bits().raw().to_le_bytes());
    }

    pub fn decode(raw: &[u8]) -> Self {
        let block = BlockPtr::from_raw(u64::from_le_bytes(*arrayref::array_ref!(raw, 0, 8)));
        let bits = EntryBits::from_raw(u64::from_le_bytes(*arrayref::array_ref!(raw, 8, 8)));
        if bits.is_data() {
            Self::data(block, bits.segment_id(), bits.esize(), bits.csize())
        } else {
            let kind = if bits.csize() == 0 {
                EntryKind::Filemark
            } else {
                EntryKind::Setmark
            };
            Self::mark(kind, block, bits.segment_id())
        }
    }

    /// Whether a staged payload or a write still in flight belongs to the entry
    pub fn has_pending_write(&self) -> bool {
        matches!(self.data, EntryData::Staged(_) | EntryData::Writing(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_fields_are_independent() {
        let mut bits = EntryBits::default();
        bits.set_segment_id(0x3f_ffff);
        bits.set_esize(MAX_BLOCK_SIZE);
        bits.set_csize(EntryBits::max_csize());
        bits.set_data(true);
        assert_eq!(bits.segment_id(), 0x3f_ffff);
        assert_eq!(bits.esize(), MAX_BLOCK_SIZE);
        assert_eq!(bits.csize(), 0x7fff);
        assert!(bits.is_data());
        // bits 62 and 63 stay clear
        assert_eq!(bits.raw() >> 62, 0);

        bits.set_esize(4096);
        bits.set_data(false);
        assert_eq!(bits.esize(), 4096);
        assert_eq!(bits.segment_id(), 0x3f_ffff);
        assert!(!bits.is_data());
        assert_eq!(bits.raw() & (1 << 22), 0);
    }

    #[test]
    fn test_entry_layout() {
        let entry = BlockEntry::data(BlockPtr::new(2, 300), 5, 10_000, 4);
        assert_eq!(entry.disk_size(), 2048);
        assert_eq!(entry.disk_blocks(), 1);
        assert_eq!(entry.data_end(), BlockPtr::new(2, 301));

        let mut raw = [0u8; RAW_ENTRY_SIZE];
        entry.encode(&mut raw);
        let bits = u64::from_le_bytes(*arrayref::array_ref!(raw, 8, 8));
        assert_eq!(bits & 0x3f_ffff, 5);
        assert_eq!((bits >> 23) & 0xff_ffff, 10_000);
        assert_eq!((bits >> 47) & 0x7fff, 4);

        let back = BlockEntry::decode(&raw);
        assert_eq!(back.kind, EntryKind::Data);
        assert_eq!(back.block, entry.block);
        assert!(back.is_compressed());
    }

    #[test]
    fn test_tape_marks() {
        let mut raw = [0u8; RAW_ENTRY_SIZE];
        BlockEntry::mark(EntryKind::Setmark, BlockPtr::new(1, 64), 3).encode(&mut raw);
        let mark = BlockEntry::decode(&raw);
        assert_eq!(mark.kind, EntryKind::Setmark);
        assert_eq!(mark.disk_blocks(), 0);
        assert_eq!(mark.data_end(), BlockPtr::new(1, 64));

        BlockEntry::mark(EntryKind::Filemark, BlockPtr::NULL, 0).encode(&mut raw);
        let mark = BlockEntry::decode(&raw);
        assert_eq!(mark.kind, EntryKind::Filemark);
        assert!(mark.data_end().is_null());
    }
}
