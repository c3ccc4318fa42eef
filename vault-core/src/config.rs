//! Engine configuration
//!
//! All tunables live in [`EngineConfig`]; every section has defaults matching
//! a production appliance and can be overridden from a JSON file.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Allocator geometry and device handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AllocatorConfig {
    /// log2 of the allocation unit size in bytes (26 = 64 MiB)
    pub unit_shift: u32,
    /// Devices smaller than this are refused at format time
    pub min_device_size: u64,
    /// Index pages kept resident per device
    pub index_cache_pages: usize,
    /// Rewrite an all-zero product tag when a device header is loaded
    pub fix_legacy_product_tag: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            unit_shift: 26,
            min_device_size: 4 << 30,
            index_cache_pages: 8,
            fix_legacy_product_tag: true,
        }
    }
}

impl AllocatorConfig {
    /// Allocation unit size in bytes
    pub fn unit_size(&self) -> u64 {
        1u64 << self.unit_shift
    }
}

/// I/O batching and background workers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IoConfig {
    /// Tasks draining each worker queue
    pub worker_threads: usize,
    /// Largest device request built from coalesced pages, in bytes
    pub max_run_bytes: usize,
    /// Largest device request built from coalesced pages, in pages
    pub max_run_pages: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_run_bytes: 512 * 1024,
            max_run_pages: 128,
        }
    }
}

/// Tape partition buffering and capacity thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PartitionConfig {
    /// Buffered write bytes that force a flush of the partition
    pub cached_writes_max: u64,
    /// Buffered bytes in one block map that start its data writes early
    pub map_cached_writes_max: u64,
    /// Read-ahead starts when cached read bytes fall to this level
    pub read_cache_min: u64,
    /// Read-ahead never caches more than this
    pub read_cache_max: u64,
    /// Block maps loaded ahead of the read position
    pub map_readahead: usize,
    /// Reserve before the end of the partition that triggers early warning
    pub early_warning_size: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            cached_writes_max: 4 << 20,
            map_cached_writes_max: 1 << 20,
            read_cache_min: 4 << 20,
            read_cache_max: 16 << 20,
            map_readahead: 4,
            early_warning_size: 32 << 20,
        }
    }
}

/// Codec applied to data blocks when a write asks for compression
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "codec", rename_all = "lowercase")]
pub enum CompressionConfig {
    None,
    Lz4,
    Zstd { level: i32 },
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig::Lz4
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub allocator: AllocatorConfig,
    pub io: IoConfig,
    pub partition: PartitionConfig,
    pub compression: CompressionConfig,
}

impl EngineConfig {
    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Parse a JSON configuration
    pub fn from_json(text: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject settings the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        let a = &self.allocator;
        if !(16..=40).contains(&a.unit_shift) {
            return Err(Error::Config(format!(
                "unit_shift {} outside 16..=40",
                a.unit_shift
            )));
        }
        if a.min_device_size < 4 * a.unit_size() {
            return Err(Error::Config(
                "min_device_size must hold at least four allocation units".into(),
            ));
        }
        if a.index_cache_pages == 0 {
            return Err(Error::Config("index_cache_pages must be non-zero".into()));
        }
        if self.io.worker_threads == 0 {
            return Err(Error::Config("worker_threads must be non-zero".into()));
        }
        if self.io.max_run_pages == 0 || self.io.max_run_bytes < crate::blockdev::BLOCK_SIZE {
            return Err(Error::Config("I/O runs must hold at least one page".into()));
        }
        let p = &self.partition;
        if p.read_cache_min > p.read_cache_max {
            return Err(Error::Config(
                "read_cache_min must not exceed read_cache_max".into(),
            ));
        }
        if p.map_readahead == 0 {
            return Err(Error::Config("map_readahead must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.allocator.unit_size(), 64 << 20);
        assert_eq!(config.partition.cached_writes_max, 4 << 20);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = EngineConfig::from_json(
            r#"{ "allocator": { "unit_shift": 20, "min_device_size": 16777216 },
                 "compression": { "codec": "zstd", "level": 3 } }"#,
        )
        .unwrap();
        assert_eq!(config.allocator.unit_shift, 20);
        assert_eq!(config.allocator.index_cache_pages, 8);
        assert_eq!(config.io, IoConfig::default());
        assert_eq!(config.compression, CompressionConfig::Zstd { level: 3 });

        let text = config.to_json().unwrap();
        assert_eq!(EngineConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(EngineConfig::from_json(r#"{ "allocator": { "unit_shift": 8 } }"#).is_err());
        assert!(EngineConfig::from_json(
            r#"{ "partition": { "read_cache_min": 10, "read_cache_max": 5 } }"#
        )
        .is_err());
    }
}
