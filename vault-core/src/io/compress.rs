//! Block codecs used for optional data compression
//!
//! Compressed blocks are stored framed as
//! `[tag u8][pad 3][original len u32 LE][payload len u32 LE]` followed by the
//! codec output, so a reader can pick the codec without knowing the engine
//! configuration the block was written with. Frames are page padded on disk.

use std::sync::Arc;

use crate::config::CompressionConfig;
use crate::error::{Error, Result};

/// Bytes in front of every compressed payload
pub const FRAME_HEADER: usize = 12;

pub const TAG_LZ4: u8 = 1;
pub const TAG_ZSTD: u8 = 2;

/// A pluggable block (de)compressor
pub trait BlockCodec: Send + Sync + 'static {
    /// Tag recorded in the frame header
    fn tag(&self) -> u8;

    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8], original_len: usize) -> Result<Vec<u8>>;
}

#[cfg(feature = "compression")]
pub use self::codecs::{Lz4Codec, ZstdCodec};

#[cfg(feature = "compression")]
mod codecs {
    use super::*;

    /// LZ4 block format through `lz4_flex`
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Lz4Codec;

    impl BlockCodec for Lz4Codec {
        fn tag(&self) -> u8 {
            TAG_LZ4
        }

        fn name(&self) -> &'static str {
            "lz4"
        }

        fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
            Ok(lz4_flex::block::compress(data))
        }

        fn decompress(&self, data: &[u8], original_len: usize) -> Result<Vec<u8>> {
            lz4_flex::block::decompress(data, original_len)
                .map_err(|e| Error::Compression(format!("lz4: {}", e)))
        }
    }

    /// Zstandard at a fixed level
    #[derive(Debug, Clone, Copy)]
    pub struct ZstdCodec {
        pub level: i32,
    }

    impl Default for ZstdCodec {
        fn default() -> Self {
            Self { level: 3 }
        }
    }

    impl BlockCodec for ZstdCodec {
        fn tag(&self) -> u8 {
            TAG_ZSTD
        }

        fn name(&self) -> &'static str {
            "zstd"
        }

        fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
            zstd::bulk::compress(data, self.level)
                .map_err(|e| Error::Compression(format!("zstd: {}", e)))
        }

        fn decompress(&self, data: &[u8], original_len: usize) -> Result<Vec<u8>> {
            zstd::bulk::decompress(data, original_len)
                .map_err(|e| Error::Compression(format!("zstd: {}", e)))
        }
    }
}

/// The codec selected by the configuration, if any
pub fn codec_for(config: CompressionConfig) -> Option<Arc<dyn BlockCodec>> {
    match config {
        CompressionConfig::None => None,
        #[cfg(feature = "compression")]
        CompressionConfig::Lz4 => Some(Arc::new(Lz4Codec)),
        #[cfg(feature = "compression")]
        CompressionConfig::Zstd { level } => Some(Arc::new(ZstdCodec { level })),
        #[cfg(not(feature = "compression"))]
        _ => {
            log::warn!("COMPRESSION: codec {:?} not built in, storing blocks raw", config);
            None
        }
    }
}

/// Compress and frame `data`; `None` if the frame would not be smaller
pub fn compress_block(codec: &dyn BlockCodec, data: &[u8]) -> Result<Option<Vec<u8>>> {
    if data.is_empty() || data.len() > u32::MAX as usize {
        return Ok(None);
    }
    let payload = codec.compress(data)?;
    if payload.len() + FRAME_HEADER >= data.len() {
        log::trace!(
            "compress_block: {} did not shrink {} bytes ({} framed)",
            codec.name(),
            data.len(),
            payload.len() + FRAME_HEADER
        );
        return Ok(None);
    }
    let mut framed = Vec::with_capacity(FRAME_HEADER + payload.len());
    framed.push(codec.tag());
    framed.extend_from_slice(&[0u8; 3]);
    framed.extend_from_slice(&(data.len() as u32).to_le_bytes());
    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    framed.extend_from_slice(&payload);
    Ok(Some(framed))
}

/// Undo [`compress_block`]; anything after the payload is padding
pub fn decompress_block(framed: &[u8]) -> Result<Vec<u8>> {
    if framed.len() < FRAME_HEADER {
        return Err(Error::Compression("truncated frame".into()));
    }
    let tag = framed[0];
    let original_len = u32::from_le_bytes(*arrayref::array_ref!(framed, 4, 4)) as usize;
    let payload_len = u32::from_le_bytes(*arrayref::array_ref!(framed, 8, 4)) as usize;
    if FRAME_HEADER + payload_len > framed.len() {
        return Err(Error::Compression("truncated frame".into()));
    }
    let payload = &framed[FRAME_HEADER..FRAME_HEADER + payload_len];
    let data = match tag {
        #[cfg(feature = "compression")]
        TAG_LZ4 => Lz4Codec.decompress(payload, original_len)?,
        #[cfg(feature = "compression")]
        TAG_ZSTD => ZstdCodec::default().decompress(payload, original_len)?,
        other => {
            return Err(Error::Compression(format!("unknown codec tag {}", other)));
        }
    };
    if data.len() != original_len {
        return Err(Error::Compression(format!(
            "expanded to {} bytes, frame says {}",
            data.len(),
            original_len
        )));
    }
    Ok(data)
}
