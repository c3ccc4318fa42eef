//! tapevault on-disk format primitives
//!
//! Every persisted structure occupies exactly one 4096-byte page whose last
//! four bytes hold a CRC32 of everything before them. Physical locations are
//! stored as a single packed [`BlockPtr`].

mod header;

use std::fmt;
use std::io;
use thiserror::Error;

use crate::blockdev::BLOCK_SIZE;

pub use self::header::{DeviceHeader, DEV_FLAG_MASTER, DEV_FLAG_UNMAP, DEV_FLAG_WORM, PRODUCT_TAG};

/// Size of every on-disk page
pub const PAGE_SIZE: usize = BLOCK_SIZE;
/// Offset of the trailing checksum inside a page
pub const CSUM_OFFSET: usize = PAGE_SIZE - 4;

/// Bits of a [`BlockPtr`] holding the in-device block number
const BLOCK_BITS: u32 = 52;
const BLOCK_MASK: u64 = (1 << BLOCK_BITS) - 1;
/// Largest device id a [`BlockPtr`] can carry
pub const MAX_DEVICE_ID: u32 = (1 << (64 - BLOCK_BITS)) - 1;

/// Error type for on-disk structure validation
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid magic number")]
    InvalidMagic,
    #[error("Checksum mismatch in page at block {block}")]
    Checksum { block: u64 },
    #[error("Invalid field {0}")]
    InvalidField(&'static str),
}

/// CRC32 of the data region of a page
pub fn page_checksum(page: &[u8]) -> u32 {
    crc32fast::hash(&page[..CSUM_OFFSET])
}

/// Store the checksum trailer of `page`
pub fn seal_page(page: &mut [u8]) {
    let csum = page_checksum(page);
    page[CSUM_OFFSET..PAGE_SIZE].copy_from_slice(&csum.to_le_bytes());
}

/// Check the checksum trailer of a page read from `block`
pub fn verify_page(page: &[u8], block: u64) -> Result<(), FormatError> {
    if page.len() != PAGE_SIZE {
        return Err(FormatError::InvalidField("page length"));
    }
    let stored = u32::from_le_bytes(*arrayref::array_ref!(page, CSUM_OFFSET, 4));
    if stored != page_checksum(page) {
        log::warn!(
            "FORMAT: checksum mismatch at block {} (stored {:#010x}, computed {:#010x})",
            block,
            stored,
            page_checksum(page)
        );
        return Err(FormatError::Checksum { block });
    }
    Ok(())
}

/// Whether a page was never written
pub fn is_zero_page(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

/// A freshly zeroed page buffer
pub fn zero_page() -> Vec<u8> {
    vec![0u8; PAGE_SIZE]
}

/// Packed physical location: device id in the top 12 bits, 4 KiB block
/// number in the low 52. Zero is the null pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockPtr(u64);

impl BlockPtr {
    pub const NULL: BlockPtr = BlockPtr(0);

    pub fn new(bid: u32, block: u64) -> Self {
        debug_assert!(bid <= MAX_DEVICE_ID);
        debug_assert!(block <= BLOCK_MASK);
        BlockPtr(((bid as u64) << BLOCK_BITS) | (block & BLOCK_MASK))
    }

    pub fn from_raw(raw: u64) -> Self {
        BlockPtr(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn bid(self) -> u32 {
        (self.0 >> BLOCK_BITS) as u32
    }

    pub fn block(self) -> u64 {
        self.0 & BLOCK_MASK
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Same device, `blocks` further along
    pub fn offset(self, blocks: u64) -> Self {
        BlockPtr::new(self.bid(), self.block() + blocks)
    }
}

impl fmt::Debug for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockPtr({}:{})", self.bid(), self.block())
    }
}

impl fmt::Display for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bid(), self.block())
    }
}

impl std::str::FromStr for BlockPtr {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bid, block) = s
            .split_once(':')
            .ok_or(FormatError::InvalidField("block pointer"))?;
        let bid: u32 = bid
            .parse()
            .map_err(|_| FormatError::InvalidField("block pointer device id"))?;
        let block: u64 = block
            .parse()
            .map_err(|_| FormatError::InvalidField("block pointer block"))?;
        if bid == 0 || bid > MAX_DEVICE_ID || block > BLOCK_MASK {
            return Err(FormatError::InvalidField("block pointer range"));
        }
        Ok(BlockPtr::new(bid, block))
    }
}

/// Copy `src` into a fixed, zero padded field
pub(crate) fn fill_field(dst: &mut [u8], src: &[u8]) {
    dst.fill(0);
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}

/// Text of a zero padded field
pub fn field_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
