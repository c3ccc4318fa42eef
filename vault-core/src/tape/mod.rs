//! Virtual tape layer
//!
//! Tape content is an ordered sequence of entries (data blocks, filemarks
//! and setmarks) stored in block maps. A chain of lookup units indexes the
//! block maps so a position can be found without reading the whole tape.

pub mod blk_map;
pub mod entry;
pub mod lookup;
mod partition;

pub use self::blk_map::{BlockMap, SpaceCode, BLOCK_MAP_ENTRIES};
pub use self::entry::{BlockEntry, EntryBits, EntryKind, MAX_BLOCK_SIZE};
pub use self::lookup::{LookupChain, LookupUnit, MapRef, LOOKUP_ENTRIES, MAX_MAP_MARKS};
pub use self::partition::{
    Direction, Locate, LocateOutcome, PartitionStats, PositionInfo, ReadOutcome, SpaceOutcome,
    TapePartition, WriteOptions, WriteOutcome,
};
