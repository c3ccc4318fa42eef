//! Backing device header (block 0 of every device)

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use super::{fill_field, seal_page, verify_page, zero_page, FormatError};

/// Magic tag of a formatted backing device
const DEVICE_MAGIC: &[u8; 8] = b"TAPEVLT\x00";
/// Product tag written by current formatters
pub const PRODUCT_TAG: &[u8; 4] = b"VTL\x00";

/// Device holds the pool-wide metadata
pub const DEV_FLAG_MASTER: u32 = 1 << 0;
/// Device belongs to a WORM pool
pub const DEV_FLAG_WORM: u32 = 1 << 1;
/// Released extents are discarded on the device
pub const DEV_FLAG_UNMAP: u32 = 1 << 2;

/// Identity, geometry and pool membership of a backing device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHeader {
    pub vendor: [u8; 8],
    pub product: [u8; 16],
    pub serial: [u8; 32],
    pub product_tag: [u8; 4],
    /// Device id, unique across the registry
    pub bid: u32,
    pub flags: u32,
    /// log2 of the allocation unit in bytes
    pub unit_shift: u32,
    /// Bytes available for allocation
    pub usable_size: u64,
    /// First allocatable block
    pub b_start: u64,
    /// One past the last allocatable block
    pub b_end: u64,
    pub pool_id: u32,
    pub pool_name: [u8; 40],
    /// Shared by every device formatted into the same pool
    pub relation_id: [u8; 40],
    /// Unix timestamp of the format
    pub created_at: i64,
}

impl DeviceHeader {
    /// A header with a random serial number and the current timestamp
    pub fn new(bid: u32, pool_id: u32, pool_name: &str) -> Result<Self, FormatError> {
        let mut raw = [0u8; 16];
        getrandom::getrandom(&mut raw)
            .map_err(|_| FormatError::InvalidField("serial number entropy"))?;
        let mut serial = [0u8; 32];
        for (i, b) in raw.iter().enumerate() {
            let hex = format!("{:02X}", b);
            serial[i * 2..i * 2 + 2].copy_from_slice(hex.as_bytes());
        }

        let mut header = Self {
            vendor: [0; 8],
            product: [0; 16],
            serial,
            product_tag: *PRODUCT_TAG,
            bid,
            flags: 0,
            unit_shift: 0,
            usable_size: 0,
            b_start: 0,
            b_end: 0,
            pool_id,
            pool_name: [0; 40],
            relation_id: [0; 40],
            created_at: chrono::Utc::now().timestamp(),
        };
        fill_field(&mut header.vendor, b"TAPEVLT");
        fill_field(&mut header.product, b"VDISK");
        fill_field(&mut header.pool_name, pool_name.as_bytes());
        Ok(header)
    }

    pub fn is_master(&self) -> bool {
        self.flags & DEV_FLAG_MASTER != 0
    }

    pub fn is_worm(&self) -> bool {
        self.flags & DEV_FLAG_WORM != 0
    }

    pub fn unmap_enabled(&self) -> bool {
        self.flags & DEV_FLAG_UNMAP != 0
    }

    /// Headers written before product tags existed carry zeroes there
    pub fn needs_product_tag_fixup(&self) -> bool {
        self.product_tag.iter().all(|&b| b == 0)
    }

    /// Serialize into a sealed page
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let mut page = zero_page();
        {
            let mut cursor = Cursor::new(&mut page[..]);
            cursor.write_all(DEVICE_MAGIC)?;
            cursor.write_all(&self.vendor)?;
            cursor.write_all(&self.product)?;
            cursor.write_all(&self.serial)?;
            cursor.write_all(&self.product_tag)?;
            cursor.write_u32::<LittleEndian>(self.bid)?;
            cursor.write_u32::<LittleEndian>(self.flags)?;
            cursor.write_u32::<LittleEndian>(self.unit_shift)?;
            cursor.write_u32::<LittleEndian>(0)?;
            cursor.write_u64::<LittleEndian>(self.usable_size)?;
            cursor.write_u64::<LittleEndian>(self.b_start)?;
            cursor.write_u64::<LittleEndian>(self.b_end)?;
            cursor.write_u32::<LittleEndian>(self.pool_id)?;
            cursor.write_all(&self.pool_name)?;
            cursor.write_all(&self.relation_id)?;
            cursor.write_i64::<LittleEndian>(self.created_at)?;
        }
        seal_page(&mut page);
        Ok(page)
    }

    /// Parse and validate the header page read from `block`
    pub fn decode(page: &[u8], block: u64) -> Result<Self, FormatError> {
        if page.len() < 8 || &page[..8] != DEVICE_MAGIC {
            return Err(FormatError::InvalidMagic);
        }
        verify_page(page, block)?;

        let mut cursor = Cursor::new(&page[8..]);
        let mut vendor = [0u8; 8];
        cursor.read_exact(&mut vendor)?;
        let mut product = [0u8; 16];
        cursor.read_exact(&mut product)?;
        let mut serial = [0u8; 32];
        cursor.read_exact(&mut serial)?;
        let mut product_tag = [0u8; 4];
        cursor.read_exact(&mut product_tag)?;
        let bid = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        let unit_shift = cursor.read_u32::<LittleEndian>()?;
        let _pad = cursor.read_u32::<LittleEndian>()?;
        let usable_size = cursor.read_u64::<LittleEndian>()?;
        let b_start = cursor.read_u64::<LittleEndian>()?;
        let b_end = cursor.read_u64::<LittleEndian>()?;
        let pool_id = cursor.read_u32::<LittleEndian>()?;
        let mut pool_name = [0u8; 40];
        cursor.read_exact(&mut pool_name)?;
        let mut relation_id = [0u8; 40];
        cursor.read_exact(&mut relation_id)?;
        let created_at = cursor.read_i64::<LittleEndian>()?;

        if bid == 0 || bid > super::MAX_DEVICE_ID {
            return Err(FormatError::InvalidField("device id"));
        }
        if b_start > b_end {
            return Err(FormatError::InvalidField("device bounds"));
        }

        Ok(Self {
            vendor,
            product,
            serial,
            product_tag,
            bid,
            flags,
            unit_shift,
            usable_size,
            b_start,
            b_end,
            pool_id,
            pool_name,
            relation_id,
            created_at,
        })
    }
}
