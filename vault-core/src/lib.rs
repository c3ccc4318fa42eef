//! TapeVault Core - persistence engine for a virtual tape library
//!
//! Backing devices are grouped into pools and handed out in fixed-size
//! allocation units. A tape partition owns a set of units, records its
//! blocks and tape-marks in block maps, and finds those maps through a
//! chain of lookup pages. Data and metadata are written in batches by a
//! shared pool of background workers.

#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod blockdev;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod io;
pub mod segment;
pub mod tape;

pub use crate::alloc::{BackingDevice, DevicePool, DeviceRegistry, Extent, ExtentRange, PoolStats};
pub use crate::config::EngineConfig;
pub use crate::engine::Engine;
pub use crate::error::{Condition, Error, Result};
pub use crate::format::BlockPtr;
pub use crate::tape::{
    Locate, PartitionStats, PositionInfo, ReadOutcome, SpaceCode, TapePartition, WriteOptions, WriteOutcome,
};

/// Common imports for engine users
pub mod prelude {
    pub use crate::blockdev::{BlockDevice, FileBackedBlockDevice, MemoryBlockDevice};
    pub use crate::config::EngineConfig;
    pub use crate::engine::Engine;
    pub use crate::error::{Condition, Error, Result};
    pub use crate::format::BlockPtr;
    pub use crate::tape::{Locate, SpaceCode, TapePartition, WriteOptions};
}
