//! Segment map pages and the partition header of the tmaps home unit

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::format::{is_zero_page, seal_page, verify_page, zero_page, BlockPtr, FormatError};

/// Extent slots in one segment map page
pub const TMAP_SLOTS: usize = 511;

const PARTITION_MAGIC: &[u8; 8] = b"TVPART\x00\x00";

/// Fixed array of extent pointers, one per segment id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMapPage {
    slots: Vec<BlockPtr>,
}

impl Default for SegmentMapPage {
    fn default() -> Self {
        Self {
            slots: vec![BlockPtr::NULL; TMAP_SLOTS],
        }
    }
}

impl SegmentMapPage {
    /// Parse a page read from `block`; a never-written page is empty
    pub fn decode(page: &[u8], block: u64) -> Result<Self, FormatError> {
        if is_zero_page(page) {
            return Ok(Self::default());
        }
        verify_page(page, block)?;
        let slots = page[..TMAP_SLOTS * 8]
            .chunks_exact(8)
            .map(|raw| BlockPtr::from_raw(u64::from_le_bytes(*arrayref::array_ref!(raw, 0, 8))))
            .collect();
        Ok(Self { slots })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut page = zero_page();
        for (i, ptr) in self.slots.iter().enumerate() {
            page[i * 8..i * 8 + 8].copy_from_slice(&ptr.raw().to_le_bytes());
        }
        seal_page(&mut page);
        page
    }

    pub fn get(&self, slot: usize) -> BlockPtr {
        self.slots[slot]
    }

    pub fn set(&mut self, slot: usize, ptr: BlockPtr) {
        self.slots[slot] = ptr;
    }

    /// Recorded extents
    pub fn used_slots(&self) -> usize {
        self.slots.iter().filter(|p| !p.is_null()).count()
    }
}

/// Page 0 of a partition's home unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHeader {
    pub id: u32,
    /// Capacity in bytes
    pub size: u64,
    pub pool_id: u32,
    pub worm: bool,
    pub created_at: i64,
    pub meta_maps: u32,
    pub data_maps: u32,
}

impl PartitionHeader {
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let mut page = zero_page();
        {
            let mut cursor = Cursor::new(&mut page[..]);
            cursor.write_all(PARTITION_MAGIC)?;
            cursor.write_u32::<LittleEndian>(self.id)?;
            cursor.write_u32::<LittleEndian>(self.pool_id)?;
            cursor.write_u64::<LittleEndian>(self.size)?;
            cursor.write_u32::<LittleEndian>(self.worm as u32)?;
            cursor.write_u32::<LittleEndian>(self.meta_maps)?;
            cursor.write_u32::<LittleEndian>(self.data_maps)?;
            cursor.write_u32::<LittleEndian>(0)?;
            cursor.write_i64::<LittleEndian>(self.created_at)?;
        }
        seal_page(&mut page);
        Ok(page)
    }

    pub fn decode(page: &[u8], block: u64) -> Result<Self, FormatError> {
        if page.len() < 8 || &page[..8] != PARTITION_MAGIC {
            return Err(FormatError::InvalidMagic);
        }
        verify_page(page, block)?;
        let mut cursor = Cursor::new(&page[8..]);
        let id = cursor.read_u32::<LittleEndian>()?;
        let pool_id = cursor.read_u32::<LittleEndian>()?;
        let size = cursor.read_u64::<LittleEndian>()?;
        let worm = cursor.read_u32::<LittleEndian>()? != 0;
        let meta_maps = cursor.read_u32::<LittleEndian>()?;
        let data_maps = cursor.read_u32::<LittleEndian>()?;
        let mut pad = [0u8; 4];
        cursor.read_exact(&mut pad)?;
        let created_at = cursor.read_i64::<LittleEndian>()?;
        if meta_maps == 0 || data_maps == 0 {
            return Err(FormatError::InvalidField("segment map count"));
        }
        Ok(Self {
            id,
            size,
            pool_id,
            worm,
            created_at,
            meta_maps,
            data_maps,
        })
    }
}
