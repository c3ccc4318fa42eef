//! I/O batching, background workers and block codecs

mod batch;
pub mod compress;
mod workers;

pub use self::batch::{
    read_page, wait_all, write_page, zero_range, DeviceHandle, IoBatch, IoDirection, IoRequest,
};
pub use self::compress::{codec_for, compress_block, decompress_block, BlockCodec};
pub use self::workers::{IoStats, WorkerPool};
