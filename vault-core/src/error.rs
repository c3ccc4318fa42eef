//! Error and control-condition types shared across the engine

use thiserror::Error;

use crate::blockdev::BlockDeviceError;
use crate::format::FormatError;

/// Faults surfaced by allocator, segment and tape operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Media error: {0}")]
    Media(String),
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("Checksum mismatch in page at block {block}")]
    Checksum { block: u64 },
    #[error("On-disk format error: {0}")]
    Format(String),
    #[error("No free extents left in pool {0}")]
    CapacityExhausted(u32),
    #[error("Overwrite of WORM content refused")]
    WormViolation,
    #[error("Write would overflow the volume")]
    VolumeOverflow,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Backing device {0} not found")]
    DeviceNotFound(u32),
    #[error("Pool {0} not found")]
    PoolNotFound(u32),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Engine is shutting down")]
    Shutdown,
}

impl Error {
    /// Errors the tape emulation layer reports as a generic medium error
    pub fn is_medium_error(&self) -> bool {
        matches!(
            self,
            Error::Media(_) | Error::BlockDevice(_) | Error::Checksum { .. } | Error::Format(_)
        )
    }

    pub(crate) fn media(msg: impl Into<String>) -> Self {
        Error::Media(msg.into())
    }
}

impl From<FormatError> for Error {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::Checksum { block } => Error::Checksum { block },
            FormatError::Io(e) => Error::Media(e.to_string()),
            other => Error::Format(other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Media(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Control outcomes of tape operations.
///
/// These are not faults: they travel alongside whatever data an operation
/// legitimately produced before hitting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// No recorded content past the position
    EndOfData,
    /// Spacing backwards ran into the beginning of the partition
    BeginningOfMedia,
    /// A filemark stopped the operation
    Filemark,
    /// A setmark stopped the operation
    Setmark,
    /// The block on tape is not the requested size
    LengthMismatch { actual: u32 },
    /// The partition is close to full; the write still succeeded
    EarlyWarning,
}
