//! End-to-end behaviour of tape partitions on in-memory devices

mod common;

use common::*;
#[cfg(feature = "compression")]
use rand::{rngs::StdRng, RngCore, SeedableRng};
use tapevault::segment::{SegmentKind, SegmentTable};
use tapevault::tape::Direction;
use tapevault::{Condition, Error, Locate, SpaceCode, WriteOptions};

const UNBUFFERED: WriteOptions = WriteOptions {
    buffered: false,
    compress: false,
};

#[tokio::test]
async fn test_round_trip_with_marks() {
    let (engine, _mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 1, 16 * MIB, false).await.unwrap();

    let out = tape.write(&blocks(0, 3, 4096), 4096, WriteOptions::default()).await.unwrap();
    assert_eq!(out.blocks, 3);
    assert_eq!(out.condition, None);
    tape.write_filemarks(1, false).await.unwrap();
    tape.write(&pattern(10, 1000), 0, WriteOptions::default()).await.unwrap();
    tape.write(&pattern(11, 5000), 0, WriteOptions::default()).await.unwrap();
    tape.write_filemarks(1, true).await.unwrap();

    let pos = tape.read_position();
    assert_eq!((pos.block, pos.file, pos.set), (7, 1, 1));
    assert_eq!(pos.buffered_blocks, 0);

    tape.locate(Locate::Block(0)).await.unwrap();
    assert!(tape.read_position().bop);

    let out = tape.read(4096, 3, true).await.unwrap();
    assert_eq!(out.blocks, 3);
    assert_eq!(out.condition, None);
    assert_eq!(out.data, blocks(0, 3, 4096));
    assert_eq!(tape.direction(), Direction::Read);

    let out = tape.read(4096, 1, true).await.unwrap();
    assert_eq!(out.blocks, 0);
    assert_eq!(out.condition, Some(Condition::Filemark));
    assert_eq!(tape.current_lid(), 4);

    let out = tape.read(1000, 1, false).await.unwrap();
    assert_eq!(out.data, pattern(10, 1000));
    assert_eq!(out.condition, None);

    let out = tape.read(1000, 1, false).await.unwrap();
    assert_eq!(out.condition, Some(Condition::LengthMismatch { actual: 5000 }));
    assert_eq!(out.data, pattern(11, 5000)[..1000].to_vec());
    assert_eq!(tape.current_lid(), 6);

    let out = tape.read(1000, 1, false).await.unwrap();
    assert_eq!(out.condition, Some(Condition::Setmark));
    let out = tape.read(1000, 1, false).await.unwrap();
    assert_eq!(out.condition, Some(Condition::EndOfData));
    assert_eq!(out.blocks, 0);
    assert!(tape.at_eod().unwrap());

    tape.close().await.unwrap();
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_locate_targets() {
    let (engine, _mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 1, 16 * MIB, false).await.unwrap();
    tape.write(&blocks(0, 3, 4096), 4096, WriteOptions::default()).await.unwrap();
    tape.write_filemarks(1, false).await.unwrap();
    tape.write(&pattern(10, 1000), 0, WriteOptions::default()).await.unwrap();
    tape.write_filemarks(1, false).await.unwrap();

    // a file locate lands right after the filemark
    let out = tape.locate(Locate::File(0)).await.unwrap();
    assert_eq!(out.condition, None);
    assert_eq!(tape.current_lid(), 4);
    assert_eq!(tape.read(1000, 1, false).await.unwrap().data, pattern(10, 1000));

    tape.locate(Locate::File(1)).await.unwrap();
    assert_eq!(tape.current_lid(), 6);
    assert!(tape.at_eod().unwrap());

    let out = tape.locate(Locate::File(2)).await.unwrap();
    assert_eq!(out.condition, Some(Condition::EndOfData));
    assert_eq!(tape.current_lid(), 6);

    let out = tape.locate(Locate::Block(100)).await.unwrap();
    assert_eq!(out.condition, Some(Condition::EndOfData));
    assert_eq!(tape.current_lid(), 6);

    tape.locate(Locate::Block(2)).await.unwrap();
    assert_eq!(tape.read(4096, 1, true).await.unwrap().data, pattern(2, 4096));

    tape.locate(Locate::Eod).await.unwrap();
    assert_eq!(tape.read_position().block, 6);
}

#[tokio::test]
async fn test_space_semantics() {
    let (engine, _mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 1, 16 * MIB, false).await.unwrap();
    for file in 0..3u64 {
        tape.write(&blocks(file * 4, 3, 4096), 4096, WriteOptions::default()).await.unwrap();
        if file < 2 {
            tape.write_filemarks(1, false).await.unwrap();
        }
    }
    // 0-2 data, 3 filemark, 4-6 data, 7 filemark, 8-10 data, EOD at 11
    assert_eq!(tape.current_lid(), 11);

    tape.locate(Locate::Block(0)).await.unwrap();
    let out = tape.space(SpaceCode::Filemarks, 1).await.unwrap();
    assert_eq!((out.residual, out.condition), (0, None));
    assert_eq!(tape.current_lid(), 4);
    assert_eq!(tape.read_position().file, 1);

    // forward over blocks crosses the filemark that stops it
    let out = tape.space(SpaceCode::Blocks, 5).await.unwrap();
    assert_eq!((out.residual, out.condition), (2, Some(Condition::Filemark)));
    assert_eq!(tape.current_lid(), 8);

    // backward leaves the position in front of it
    let out = tape.space(SpaceCode::Blocks, -1).await.unwrap();
    assert_eq!((out.residual, out.condition), (1, Some(Condition::Filemark)));
    assert_eq!(tape.current_lid(), 7);

    let out = tape.space(SpaceCode::Filemarks, -1).await.unwrap();
    assert_eq!((out.residual, out.condition), (0, None));
    assert_eq!(tape.current_lid(), 3);

    tape.locate(Locate::Block(8)).await.unwrap();
    let out = tape.space(SpaceCode::Blocks, 100).await.unwrap();
    assert_eq!((out.residual, out.condition), (97, Some(Condition::EndOfData)));
    assert_eq!(tape.current_lid(), 11);

    let out = tape.space(SpaceCode::Blocks, -100).await.unwrap();
    assert_eq!((out.residual, out.condition), (97, Some(Condition::Filemark)));
    assert_eq!(tape.current_lid(), 7);

    let out = tape.space(SpaceCode::Setmarks, 1).await.unwrap();
    assert_eq!((out.residual, out.condition), (1, Some(Condition::EndOfData)));

    tape.locate(Locate::Block(0)).await.unwrap();
    let out = tape.space(SpaceCode::Filemarks, -1).await.unwrap();
    assert_eq!((out.residual, out.condition), (1, Some(Condition::BeginningOfMedia)));
    assert_eq!(tape.current_lid(), 0);

    let out = tape.space(SpaceCode::EndOfData, 0).await.unwrap();
    assert_eq!(out.condition, None);
    assert_eq!(tape.current_lid(), 11);

    // zero count is a no-op
    let out = tape.space(SpaceCode::Blocks, 0).await.unwrap();
    assert_eq!((out.residual, out.condition), (0, None));
    assert_eq!(tape.current_lid(), 11);
}

#[tokio::test]
async fn test_many_maps_read_and_space() {
    let (engine, _mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 1, 16 * MIB, false).await.unwrap();
    tape.write(&blocks(0, 600, 512), 512, WriteOptions::default()).await.unwrap();
    assert_eq!(tape.current_lid(), 600);

    tape.locate(Locate::Block(0)).await.unwrap();
    let out = tape.read(512, 1, true).await.unwrap();
    assert_eq!(out.data, pattern(0, 512));
    let stats = tape.stats();
    assert!(stats.read_cached > 0);
    assert!(stats.read_cached <= 256 * 1024);

    let out = tape.read(512, 599, true).await.unwrap();
    assert_eq!(out.blocks, 599);
    assert_eq!(out.data, blocks(1, 599, 512));

    tape.locate(Locate::Block(400)).await.unwrap();
    assert_eq!(tape.stats().read_cached, 0);
    assert_eq!(tape.read(512, 1, true).await.unwrap().data, pattern(400, 512));

    tape.locate(Locate::Block(0)).await.unwrap();
    let out = tape.space(SpaceCode::Blocks, 300).await.unwrap();
    assert_eq!((out.residual, out.condition), (0, None));
    assert_eq!(tape.current_lid(), 300);

    let out = tape.space(SpaceCode::Blocks, -299).await.unwrap();
    assert_eq!((out.residual, out.condition), (0, None));
    assert_eq!(tape.current_lid(), 1);
    assert_eq!(tape.read(512, 1, true).await.unwrap().data, pattern(1, 512));
}

#[tokio::test]
async fn test_filemarks_across_maps() {
    let (engine, _mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 1, 16 * MIB, false).await.unwrap();
    // one block then one filemark, twenty times: block i at 2i, filemark i at 2i + 1
    for i in 0..20u64 {
        tape.write(&pattern(i, 4096), 4096, WriteOptions::default()).await.unwrap();
        tape.write_filemarks(1, false).await.unwrap();
    }
    assert_eq!(tape.read_position().file, 20);

    tape.locate(Locate::File(17)).await.unwrap();
    assert_eq!(tape.current_lid(), 36);
    assert_eq!(tape.read(4096, 1, true).await.unwrap().data, pattern(18, 4096));

    tape.locate(Locate::File(14)).await.unwrap();
    assert_eq!(tape.current_lid(), 30);
    let out = tape.space(SpaceCode::Filemarks, 3).await.unwrap();
    assert_eq!((out.residual, out.condition), (0, None));
    assert_eq!(tape.current_lid(), 36);
    assert_eq!(tape.read_position().file, 18);

    // nineteen filemarks lie in front of lid 39
    tape.locate(Locate::Block(39)).await.unwrap();
    let out = tape.space(SpaceCode::Filemarks, -19).await.unwrap();
    assert_eq!((out.residual, out.condition), (0, None));
    assert_eq!(tape.current_lid(), 1);

    tape.locate(Locate::Block(39)).await.unwrap();
    let out = tape.space(SpaceCode::Filemarks, -20).await.unwrap();
    assert_eq!((out.residual, out.condition), (1, Some(Condition::BeginningOfMedia)));
    assert_eq!(tape.current_lid(), 0);
}

#[tokio::test]
async fn test_overwrite_truncates() {
    let (engine, mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 1, 16 * MIB, false).await.unwrap();
    tape.write(&blocks(0, 10, 4096), 4096, WriteOptions::default()).await.unwrap();
    tape.write_filemarks(1, false).await.unwrap();

    tape.locate(Locate::Block(5)).await.unwrap();
    tape.write(&pattern(99, 4096), 4096, UNBUFFERED).await.unwrap();
    assert_eq!(tape.current_lid(), 6);
    assert_eq!(tape.read_position().file, 0);

    tape.locate(Locate::Eod).await.unwrap();
    assert_eq!(tape.current_lid(), 6);
    tape.locate(Locate::Block(4)).await.unwrap();
    let out = tape.read(4096, 3, true).await.unwrap();
    assert_eq!(out.blocks, 2);
    assert_eq!(out.condition, Some(Condition::EndOfData));
    let mut expected = pattern(4, 4096);
    expected.extend(pattern(99, 4096));
    assert_eq!(out.data, expected);

    // truncation survives a reload
    let home = tape.home();
    tape.close().await.unwrap();
    let engine = restart(engine, &[mem]).await;
    let mut tape = engine.load_partition(home).await.unwrap();
    tape.locate(Locate::Eod).await.unwrap();
    assert_eq!(tape.current_lid(), 6);
}

#[tokio::test]
async fn test_erase_and_repeated_eod() {
    let (engine, _mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 1, 16 * MIB, false).await.unwrap();
    tape.write(&blocks(0, 5, 4096), 4096, WriteOptions::default()).await.unwrap();
    let before = tape.stats().allocated;

    tape.locate(Locate::Block(2)).await.unwrap();
    tape.erase().await.unwrap();
    assert_eq!(tape.current_lid(), 2);
    // erasing at the end of data again changes nothing
    tape.erase().await.unwrap();
    assert_eq!(tape.current_lid(), 2);
    assert_eq!(tape.stats().allocated, before);

    tape.locate(Locate::Block(0)).await.unwrap();
    tape.erase().await.unwrap();
    assert!(tape.at_eod().unwrap());
    // erased to BOP: data segments are gone, the first map stays
    assert!(tape.stats().allocated < before);
    let out = tape.read(4096, 1, true).await.unwrap();
    assert_eq!(out.condition, Some(Condition::EndOfData));

    tape.write(&pattern(7, 4096), 4096, UNBUFFERED).await.unwrap();
    tape.locate(Locate::Block(0)).await.unwrap();
    assert_eq!(tape.read(4096, 1, true).await.unwrap().data, pattern(7, 4096));
}

#[tokio::test]
async fn test_worm_refuses_overwrite() {
    let (engine, _mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 1, 16 * MIB, true).await.unwrap();
    assert!(tape.is_worm());
    tape.write(&blocks(0, 2, 4096), 4096, WriteOptions::default()).await.unwrap();
    tape.write_filemarks(1, false).await.unwrap();

    tape.locate(Locate::Block(0)).await.unwrap();
    assert!(matches!(
        tape.write(&pattern(9, 4096), 4096, WriteOptions::default()).await,
        Err(Error::WormViolation)
    ));
    assert!(matches!(tape.erase().await, Err(Error::WormViolation)));
    assert!(matches!(tape.write_filemarks(1, false).await, Err(Error::WormViolation)));

    // content is untouched and appending at EOD still works
    assert_eq!(tape.read(4096, 2, true).await.unwrap().data, blocks(0, 2, 4096));
    tape.locate(Locate::Eod).await.unwrap();
    tape.write(&pattern(9, 4096), 4096, UNBUFFERED).await.unwrap();
    assert_eq!(tape.current_lid(), 4);
}

#[tokio::test]
async fn test_early_warning_then_overflow() {
    let (engine, _mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 1, 4 * MIB, false).await.unwrap();
    let chunk = blocks(0, 16, 4096);

    let mut written = 0u64;
    let mut warned = false;
    let overflow = loop {
        assert!(written < 1024, "partition never filled up");
        match tape.write(&chunk, 4096, WriteOptions::default()).await {
            Ok(out) => {
                written += out.blocks as u64;
                if out.condition == Some(Condition::EarlyWarning) {
                    warned = true;
                } else {
                    assert!(!warned, "early warning must persist once reached");
                }
            }
            Err(e) => break e,
        }
    };
    assert!(matches!(overflow, Error::VolumeOverflow));
    assert!(warned);
    assert!(tape.read_position().eop);
    assert!(tape.used_bytes() <= tape.size());

    tape.locate(Locate::Block(0)).await.unwrap();
    let out = tape.read(4096, written as u32, true).await.unwrap();
    assert_eq!(out.blocks as u64, written);
}

#[tokio::test]
async fn test_persistence_across_restart() {
    let (engine, mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 7, 16 * MIB, false).await.unwrap();
    tape.write(&blocks(0, 300, 4096), 4096, WriteOptions::default()).await.unwrap();
    tape.write_filemarks(2, false).await.unwrap();
    tape.write(&pattern(500, 3000), 0, WriteOptions::default()).await.unwrap();
    let home = tape.home();
    let used = tape.used_bytes();
    tape.close().await.unwrap();

    let engine = restart(engine, &[mem]).await;
    let mut tape = engine.load_partition(home).await.unwrap();
    assert_eq!(tape.id(), 7);
    assert_eq!(tape.size(), 16 * MIB);
    assert_eq!(tape.current_lid(), 0);

    let out = tape.read(4096, 300, true).await.unwrap();
    assert_eq!(out.data, blocks(0, 300, 4096));
    assert_eq!(tape.read(4096, 1, true).await.unwrap().condition, Some(Condition::Filemark));
    assert_eq!(tape.read(4096, 1, true).await.unwrap().condition, Some(Condition::Filemark));
    assert_eq!(tape.read(3000, 1, false).await.unwrap().data, pattern(500, 3000));

    // appending continues the logical ids and the space accounting
    tape.locate(Locate::Eod).await.unwrap();
    assert_eq!(tape.current_lid(), 303);
    tape.write(&pattern(600, 4096), 4096, UNBUFFERED).await.unwrap();
    assert_eq!(tape.used_bytes(), used + 4096);
    tape.locate(Locate::Block(303)).await.unwrap();
    assert_eq!(tape.read(4096, 1, true).await.unwrap().data, pattern(600, 4096));
}

#[tokio::test]
async fn test_blank_partition_reload() {
    let (engine, mem) = engine_with_device(64 * MIB).await;
    let tape = engine.create_partition(POOL, 3, 8 * MIB, false).await.unwrap();
    let home = tape.home();
    tape.close().await.unwrap();

    let engine = restart(engine, &[mem]).await;
    let mut tape = engine.load_partition(home).await.unwrap();
    assert!(tape.at_eod().unwrap());
    let out = tape.read(4096, 1, true).await.unwrap();
    assert_eq!(out.condition, Some(Condition::EndOfData));
    let out = tape.space(SpaceCode::Blocks, 1).await.unwrap();
    assert_eq!(out.condition, Some(Condition::EndOfData));
    assert_eq!(tape.read_position().block, 0);
}

#[tokio::test]
async fn test_corrupted_header_is_reported() {
    let (engine, mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 1, 8 * MIB, false).await.unwrap();
    tape.write(&pattern(0, 4096), 4096, UNBUFFERED).await.unwrap();
    let home = tape.home();
    tape.close().await.unwrap();

    mem.corrupt_byte(home.block(), 20);
    let engine = restart(engine, &[mem]).await;
    let err = engine.load_partition(home).await.unwrap_err();
    assert!(matches!(err, Error::Checksum { .. }), "unexpected error {:?}", err);
    assert!(err.is_medium_error());
}

#[tokio::test]
async fn test_failed_data_write_is_a_medium_error() {
    let (engine, mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 1, 8 * MIB, false).await.unwrap();
    tape.write(&pattern(0, 4096), 4096, UNBUFFERED).await.unwrap();

    mem.fail_writes_after(0);
    let err = tape.write(&blocks(1, 3, 4096), 4096, UNBUFFERED).await.unwrap_err();
    assert!(err.is_medium_error(), "unexpected error {:?}", err);
    // the unwritten blocks are gone, nothing is left buffered
    let pos = tape.read_position();
    assert_eq!(pos.block, 1);
    assert_eq!((pos.buffered_blocks, pos.buffered_bytes), (0, 0));
    assert!(tape.at_eod().unwrap());

    // once the device recovers the partition is usable again
    mem.clear_faults();
    tape.write(&pattern(9, 4096), 4096, UNBUFFERED).await.unwrap();
    tape.flush_writes().await.unwrap();
    tape.locate(Locate::Block(0)).await.unwrap();
    let out = tape.read(4096, 3, true).await.unwrap();
    assert_eq!(out.blocks, 2);
    assert_eq!(out.condition, Some(Condition::EndOfData));
    let mut expected = pattern(0, 4096);
    expected.extend(pattern(9, 4096));
    assert_eq!(out.data, expected);

    let home = tape.home();
    tape.close().await.unwrap();
    let engine = restart(engine, &[mem]).await;
    let mut tape = engine.load_partition(home).await.unwrap();
    tape.locate(Locate::Eod).await.unwrap();
    assert_eq!(tape.current_lid(), 2);
    tape.locate(Locate::Block(1)).await.unwrap();
    assert_eq!(tape.read(4096, 1, true).await.unwrap().data, pattern(9, 4096));
}

#[tokio::test]
async fn test_overwrite_past_the_second_lookup_unit() {
    let (engine, mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 1, 16 * MIB, false).await.unwrap();
    // 15 filemarks per map and 253 maps per unit: map 506, the first of the
    // third unit, starts at lid 7590
    tape.write_filemarks(7600, false).await.unwrap();
    assert_eq!(tape.current_lid(), 7600);

    tape.locate(Locate::Block(7590)).await.unwrap();
    tape.write(&pattern(1, 4096), 4096, UNBUFFERED).await.unwrap();
    assert_eq!(tape.current_lid(), 7591);
    assert_eq!(tape.read_position().file, 7590);

    tape.locate(Locate::Eod).await.unwrap();
    assert_eq!(tape.current_lid(), 7591);
    tape.locate(Locate::Block(7589)).await.unwrap();
    assert_eq!(tape.read(4096, 1, true).await.unwrap().condition, Some(Condition::Filemark));
    assert_eq!(tape.read(4096, 1, true).await.unwrap().data, pattern(1, 4096));
    assert_eq!(tape.read(4096, 1, true).await.unwrap().condition, Some(Condition::EndOfData));

    // truncating again further back, from a map deep in the second unit
    tape.locate(Locate::File(4000)).await.unwrap();
    assert_eq!(tape.current_lid(), 4001);
    tape.erase().await.unwrap();
    assert!(tape.at_eod().unwrap());

    let home = tape.home();
    tape.close().await.unwrap();
    let engine = restart(engine, &[mem]).await;
    let mut tape = engine.load_partition(home).await.unwrap();
    tape.locate(Locate::Eod).await.unwrap();
    assert_eq!(tape.current_lid(), 4001);
    assert_eq!(tape.read_position().file, 4001);
    let out = tape.space(SpaceCode::Filemarks, -4001).await.unwrap();
    assert_eq!((out.residual, out.condition), (0, None));
    assert_eq!(tape.current_lid(), 0);
}

#[tokio::test]
async fn test_corrupted_map_and_lookup_pages_are_reported() {
    let (engine, mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 1, 16 * MIB, false).await.unwrap();
    // three block maps of 255 entries behind one lookup unit
    tape.write(&blocks(0, 600, 4096), 4096, WriteOptions::default()).await.unwrap();
    let home = tape.home();
    tape.close().await.unwrap();

    // the first metadata page holds the lookup unit, the maps follow it
    let mut segs = SegmentTable::load(engine.registry().clone(), engine.workers().clone(), home)
        .await
        .unwrap();
    let unit = segs.lookup_segment(SegmentKind::Meta, 0).await.unwrap().ptr.block();
    mem.corrupt_byte(unit + 2, 100);

    let engine = restart(engine, &[mem.clone()]).await;
    let mut tape = engine.load_partition(home).await.unwrap();
    assert_eq!(tape.read(4096, 1, true).await.unwrap().data, pattern(0, 4096));
    let err = tape.locate(Locate::Block(300)).await.unwrap_err();
    assert!(matches!(err, Error::Checksum { block } if block == unit + 2), "unexpected error {:?}", err);
    assert!(err.is_medium_error());
    drop(tape);

    mem.corrupt_byte(unit, 100);
    let engine = restart(engine, &[mem]).await;
    let err = engine.load_partition(home).await.unwrap_err();
    assert!(matches!(err, Error::Checksum { block } if block == unit), "unexpected error {:?}", err);
}

#[cfg(feature = "compression")]
#[tokio::test]
async fn test_compressed_blocks() {
    let (engine, _mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 1, 16 * MIB, false).await.unwrap();
    let block: Vec<u8> = b"tapevault ".iter().cycle().take(64 * 1024).copied().collect();
    let opts = WriteOptions {
        buffered: true,
        compress: true,
    };
    for _ in 0..4 {
        tape.write(&block, 0, opts).await.unwrap();
    }
    // incompressible data is stored raw
    let mut noise = vec![0u8; 8192];
    StdRng::seed_from_u64(7).fill_bytes(&mut noise);
    tape.write(&noise, 0, opts).await.unwrap();
    tape.write_filemarks(0, false).await.unwrap();
    assert!(tape.used_bytes() < 4 * 64 * 1024);

    tape.locate(Locate::Block(0)).await.unwrap();
    for _ in 0..4 {
        let out = tape.read(64 * 1024, 1, false).await.unwrap();
        assert_eq!(out.data, block);
        assert!(out.compressed_bytes > 0 && out.compressed_bytes < block.len() as u64);
    }
    let out = tape.read(8192, 1, false).await.unwrap();
    assert_eq!(out.data, noise);
    assert_eq!(out.compressed_bytes, 0);
}

#[tokio::test]
async fn test_invalid_writes() {
    let (engine, _mem) = engine_with_device(64 * MIB).await;
    let mut tape = engine.create_partition(POOL, 1, 8 * MIB, false).await.unwrap();
    assert!(matches!(
        tape.write(&[], 0, WriteOptions::default()).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        tape.write(&[0u8; 1000], 512, WriteOptions::default()).await,
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(tape.current_lid(), 0);
}
