//! Free-space accounting across pools, devices and partitions

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures::future::join_all;
use tapevault::blockdev::MemoryBlockDevice;
use tapevault::{Error, Extent, Locate, WriteOptions};

#[tokio::test]
async fn test_concurrent_allocation_never_hands_out_a_unit_twice() {
    let (engine, _first) = engine_with_device(32 * MIB).await;
    let second = Arc::new(MemoryBlockDevice::new(32 * MIB));
    engine
        .registry()
        .format_device(POOL, second, 2, false, false)
        .await
        .unwrap();
    let registry = engine.registry().clone();
    let free_before = registry.pool_stats(POOL).unwrap().free;

    let tasks = (0..8).map(|_| {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut got = Vec::new();
            for _ in 0..4 {
                got.push(registry.allocate(POOL).await.unwrap());
            }
            got
        })
    });
    let extents: Vec<Extent> = join_all(tasks)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();
    assert_eq!(extents.len(), 32);

    let starts: HashSet<_> = extents.iter().map(|e| e.ptr).collect();
    assert_eq!(starts.len(), 32);
    for (i, a) in extents.iter().enumerate() {
        for b in &extents[i + 1..] {
            assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
        }
    }
    // both devices took part
    assert_eq!(extents.iter().map(|e| e.bid()).collect::<HashSet<_>>().len(), 2);
    assert_eq!(registry.pool_stats(POOL).unwrap().free, free_before - 32 * MIB);

    for released in join_all(extents.iter().map(|e| registry.release(e.ptr))).await {
        released.unwrap();
    }
    assert_eq!(registry.pool_stats(POOL).unwrap().free, free_before);
}

#[tokio::test]
async fn test_pool_exhaustion() {
    let (engine, _mem) = engine_with_device(8 * MIB).await;
    let registry = engine.registry();
    let mut extents = Vec::new();
    let err = loop {
        match registry.allocate(POOL).await {
            Ok(extent) => extents.push(extent),
            Err(e) => break e,
        }
        assert!(extents.len() <= 8);
    };
    assert!(matches!(err, Error::CapacityExhausted(POOL)), "unexpected error {:?}", err);
    assert_eq!(registry.pool_stats(POOL).unwrap().free, 0);

    registry.release(extents[0].ptr).await.unwrap();
    let again = registry.allocate(POOL).await.unwrap();
    assert_eq!(again, extents[0]);
}

#[tokio::test]
async fn test_partition_delete_returns_every_unit() {
    let (engine, _mem) = engine_with_device(64 * MIB).await;
    let registry = engine.registry().clone();
    let free_before = registry.pool_stats(POOL).unwrap().free;

    let mut tape = engine.create_partition(POOL, 1, 16 * MIB, false).await.unwrap();
    tape.write(&blocks(0, 700, 4096), 4096, WriteOptions::default()).await.unwrap();
    tape.write_filemarks(1, false).await.unwrap();
    // home unit, one metadata segment and three data segments
    assert_eq!(registry.pool_stats(POOL).unwrap().free, free_before - 5 * MIB);

    tape.locate(Locate::Block(100)).await.unwrap();
    tape.erase().await.unwrap();
    assert_eq!(registry.pool_stats(POOL).unwrap().free, free_before - 3 * MIB);

    tape.delete().await.unwrap();
    registry.wait_discards().await;
    assert_eq!(registry.pool_stats(POOL).unwrap().free, free_before);
}

#[tokio::test]
async fn test_reused_units_wait_for_their_discard() {
    init_logging();
    let engine = tapevault::Engine::start(test_config()).unwrap();
    engine.registry().create_pool(POOL, "tapes", false).unwrap();
    let mem = Arc::new(MemoryBlockDevice::new(8 * MIB).with_discard(true));
    engine
        .registry()
        .format_device(POOL, mem.clone(), 1, true, true)
        .await
        .unwrap();
    mem.set_discard_delay(Some(Duration::from_millis(20)));

    let mut first = engine.create_partition(POOL, 1, 6 * MIB, false).await.unwrap();
    first.write(&blocks(0, 600, 4096), 4096, WriteOptions::default()).await.unwrap();
    first.write_filemarks(0, false).await.unwrap();
    first.delete().await.unwrap();

    // the second partition needs units whose discard may still be running
    let mut second = engine.create_partition(POOL, 2, 6 * MIB, false).await.unwrap();
    second.write(&blocks(1000, 600, 4096), 4096, WriteOptions::default()).await.unwrap();
    second.locate(Locate::Block(0)).await.unwrap();
    let out = second.read(4096, 600, true).await.unwrap();
    assert_eq!(out.data, blocks(1000, 600, 4096));

    engine.registry().wait_discards().await;
    assert_eq!(mem.discard_conflicts(), 0);
    assert!(mem.discard_count() > 0);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_partition_create_leaks_nothing() {
    let (engine, mem) = engine_with_device(16 * MIB).await;
    let free_before = engine.registry().pool_stats(POOL).unwrap().free;

    // every unit is unwritable, index pages still work
    mem.fail_writes_in(256..4096);
    assert!(engine.create_partition(POOL, 1, 8 * MIB, false).await.is_err());
    mem.clear_faults();
    assert_eq!(engine.registry().pool_stats(POOL).unwrap().free, free_before);

    assert!(matches!(
        engine.create_partition(9, 1, 8 * MIB, false).await,
        Err(Error::PoolNotFound(9))
    ));
}
