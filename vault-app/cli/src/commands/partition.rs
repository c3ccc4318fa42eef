//! Partition lifecycle commands: mkpart, rmpart and dump

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use tapevault::{BlockPtr, Condition, EngineConfig, Locate, SpaceCode};

use super::human_size;

#[derive(Parser, Debug)]
#[command(about = "Create a tape partition")]
pub struct MkpartArgs {
    /// Formatted images of the pool
    #[arg(required = true)]
    pub images: Vec<PathBuf>,

    /// Pool to allocate from
    #[arg(short, long, default_value_t = 1)]
    pub pool: u32,

    /// Partition id recorded in the header
    #[arg(short, long, default_value_t = 0)]
    pub id: u32,

    /// Capacity in MiB
    #[arg(short, long)]
    pub size: u64,

    /// Refuse overwrites of recorded data
    #[arg(long)]
    pub worm: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Delete a tape partition")]
pub struct RmpartArgs {
    #[arg(required = true)]
    pub images: Vec<PathBuf>,

    /// Home locator printed by mkpart (device:block)
    #[arg(long)]
    pub home: BlockPtr,
}

#[derive(Parser, Debug)]
#[command(about = "List the files recorded on a tape partition")]
pub struct DumpArgs {
    #[arg(required = true)]
    pub images: Vec<PathBuf>,

    #[arg(long)]
    pub home: BlockPtr,
}

pub async fn mkpart(config: EngineConfig, args: MkpartArgs) -> Result<()> {
    let engine = super::open_engine(config, &args.images, false).await?;
    let size = args.size.saturating_mul(1024 * 1024);
    let tape = engine
        .create_partition(args.pool, args.id, size, args.worm)
        .await
        .context("Failed to create partition")?;
    let home = tape.home();
    tape.close().await?;
    engine.shutdown().await?;
    println!("Created partition {} ({}) at {}", args.id, human_size(size), home);
    Ok(())
}

pub async fn rmpart(config: EngineConfig, args: RmpartArgs) -> Result<()> {
    let engine = super::open_engine(config, &args.images, false).await?;
    let tape = engine
        .load_partition(args.home)
        .await
        .with_context(|| format!("Failed to load partition at {}", args.home))?;
    let id = tape.id();
    tape.delete().await?;
    engine.shutdown().await?;
    println!("Deleted partition {} at {}", id, args.home);
    Ok(())
}

pub async fn dump(config: EngineConfig, args: DumpArgs) -> Result<()> {
    let engine = super::open_engine(config, &args.images, true).await?;
    let mut tape = engine
        .load_partition(args.home)
        .await
        .with_context(|| format!("Failed to load partition at {}", args.home))?;

    let stats = tape.stats();
    println!(
        "partition {} at {}: {} capacity, {} used, {} allocated{}",
        stats.id,
        stats.home,
        human_size(stats.size),
        human_size(stats.used),
        human_size(stats.allocated),
        if stats.worm { ", WORM" } else { "" }
    );

    let mut file = 0u64;
    loop {
        let start = tape.current_lid();
        let out = tape.space(SpaceCode::Filemarks, 1).await?;
        let end = tape.current_lid();
        match out.condition {
            None => {
                println!("  file {:>5}: blocks {}..{}", file, start, end - 1);
                file += 1;
            }
            Some(Condition::Setmark) => {
                println!("  setmark at {}", end - 1);
            }
            Some(Condition::EndOfData) => {
                if end > start {
                    println!("  file {:>5}: blocks {}..{} (no filemark)", file, start, end);
                }
                break;
            }
            Some(other) => {
                log::warn!("Unexpected condition {:?} at {}", other, end);
                break;
            }
        }
    }
    tape.locate(Locate::Eod).await?;
    let pos = tape.read_position();
    println!(
        "  end of data at block {} ({} filemarks, {} setmarks){}",
        pos.block,
        pos.file,
        pos.set,
        if pos.eop { ", in early warning zone" } else { "" }
    );
    tape.close().await?;
    engine.shutdown().await?;
    Ok(())
}
