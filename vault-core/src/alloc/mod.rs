//! Free-space allocator
//!
//! Each backing device keeps a persistent bitmap of fixed-size allocation
//! units split into index pages. Devices are grouped into pools that rotate
//! allocations across their members. [`DeviceRegistry`] owns every pool and
//! device and is the entry point for `allocate`/`release`.

mod bdev;
mod index_page;
mod pool;
mod registry;

pub use self::bdev::{BackingDevice, DeviceGeometry, FormatOptions};
pub use self::index_page::{FreeBit, IndexPage, UnmapTracker, INDEX_BITMAP_BYTES, UNITS_PER_INDEX};
pub use self::pool::{DevicePool, PoolStats};
pub use self::registry::DeviceRegistry;

use crate::format::BlockPtr;

/// One allocation unit handed out by the allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    /// Device and first block of the unit
    pub ptr: BlockPtr,
    /// Length in 4 KiB blocks
    pub blocks: u64,
}

impl Extent {
    pub fn bid(&self) -> u32 {
        self.ptr.bid()
    }

    pub fn block_start(&self) -> u64 {
        self.ptr.block()
    }

    /// One past the last block
    pub fn block_end(&self) -> u64 {
        self.ptr.block() + self.blocks
    }

    pub fn range(&self) -> ExtentRange {
        ExtentRange {
            device: self.bid(),
            block_start: self.block_start(),
            block_end: self.block_end(),
        }
    }

    /// Whether the two extents share a block on the same device
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.range().overlaps(&other.range())
    }
}

/// Half-open block range on one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtentRange {
    pub device: u32,
    pub block_start: u64,
    pub block_end: u64,
}

impl ExtentRange {
    pub fn len(&self) -> u64 {
        self.block_end.saturating_sub(self.block_start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, device: u32, block: u64) -> bool {
        self.device == device && self.block_start <= block && block < self.block_end
    }

    pub fn overlaps(&self, other: &ExtentRange) -> bool {
        self.device == other.device && self.block_start < other.block_end && other.block_start < self.block_end
    }
}
