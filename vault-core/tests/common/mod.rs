#![allow(dead_code)]

use std::sync::Arc;

use tapevault::blockdev::MemoryBlockDevice;
use tapevault::config::{AllocatorConfig, CompressionConfig, EngineConfig, PartitionConfig};
use tapevault::Engine;

pub const MIB: u64 = 1 << 20;
pub const POOL: u32 = 1;

/// 1 MiB units, small caches and a 1 MiB early-warning reserve
pub fn test_config() -> EngineConfig {
    EngineConfig {
        allocator: AllocatorConfig {
            unit_shift: 20,
            min_device_size: 8 * MIB,
            ..AllocatorConfig::default()
        },
        partition: PartitionConfig {
            cached_writes_max: 256 * 1024,
            map_cached_writes_max: 64 * 1024,
            read_cache_min: 64 * 1024,
            read_cache_max: 256 * 1024,
            map_readahead: 2,
            early_warning_size: MIB,
        },
        compression: CompressionConfig::Lz4,
        ..EngineConfig::default()
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Engine with one pool backed by a single in-memory device
pub async fn engine_with_device(size: u64) -> (Arc<Engine>, Arc<MemoryBlockDevice>) {
    init_logging();
    let engine = Engine::start(test_config()).expect("engine start");
    engine.registry().create_pool(POOL, "tapes", false).expect("create pool");
    let mem = Arc::new(MemoryBlockDevice::new(size));
    engine
        .registry()
        .format_device(POOL, mem.clone(), 1, true, false)
        .await
        .expect("format device");
    (engine, mem)
}

/// Reopen the devices of a stopped engine in a fresh one
pub async fn restart(engine: Arc<Engine>, devices: &[Arc<MemoryBlockDevice>]) -> Arc<Engine> {
    engine.shutdown().await.expect("shutdown");
    let engine = Engine::start(test_config()).expect("engine restart");
    for mem in devices {
        engine.registry().load_device(mem.clone()).await.expect("load device");
    }
    engine
}

/// Deterministic block content: every byte derives from the block number
pub fn pattern(block: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (block as usize * 31 + i * 7) as u8).collect()
}

pub fn blocks(first: u64, count: u64, len: usize) -> Vec<u8> {
    (first..first + count).flat_map(|b| pattern(b, len)).collect()
}
