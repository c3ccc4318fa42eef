//! Moving files onto and off tape partitions

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;

use tapevault::tape::MAX_BLOCK_SIZE;
use tapevault::{BlockPtr, Condition, EngineConfig, Locate, WriteOptions};

use super::human_size;

#[derive(Parser, Debug)]
#[command(about = "Append a file to a tape partition")]
pub struct WriteArgs {
    #[arg(required = true)]
    pub images: Vec<PathBuf>,

    /// Home locator of the partition (device:block)
    #[arg(long)]
    pub home: BlockPtr,

    /// File to store
    #[arg(short, long)]
    pub input: PathBuf,

    /// Tape block size in bytes
    #[arg(short, long, default_value_t = 65536)]
    pub block_size: u32,

    /// Compress data blocks
    #[arg(long)]
    pub compress: bool,

    /// Start at the beginning of the tape, discarding its content
    #[arg(long)]
    pub rewind: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Read a file back from a tape partition")]
pub struct ReadArgs {
    #[arg(required = true)]
    pub images: Vec<PathBuf>,

    #[arg(long)]
    pub home: BlockPtr,

    /// File number, counted from the beginning of the tape
    #[arg(short, long, default_value_t = 0)]
    pub file: u64,

    /// Where to store the data
    #[arg(short, long)]
    pub output: PathBuf,
}

pub async fn write(config: EngineConfig, args: WriteArgs) -> Result<()> {
    if args.block_size == 0 || args.block_size > MAX_BLOCK_SIZE {
        return Err(anyhow!("Block size must be between 1 and {}", MAX_BLOCK_SIZE));
    }
    let data = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    if data.is_empty() {
        return Err(anyhow!("{} is empty", args.input.display()));
    }

    let engine = super::open_engine(config, &args.images, false).await?;
    let mut tape = engine
        .load_partition(args.home)
        .await
        .with_context(|| format!("Failed to load partition at {}", args.home))?;
    if !args.rewind {
        tape.locate(Locate::Eod).await?;
    }
    let start = tape.current_lid();
    let opts = WriteOptions {
        buffered: true,
        compress: args.compress,
    };

    let block_size = args.block_size as usize;
    let whole = data.len() / block_size * block_size;
    let mut warned = false;
    for chunk in data[..whole].chunks(block_size * 64) {
        let out = tape.write(chunk, args.block_size, opts).await?;
        warned |= out.condition == Some(Condition::EarlyWarning);
    }
    if whole < data.len() {
        let out = tape.write(&data[whole..], 0, opts).await?;
        warned |= out.condition == Some(Condition::EarlyWarning);
    }
    let out = tape.write_filemarks(1, false).await?;
    warned |= out.condition == Some(Condition::EarlyWarning);
    if warned {
        warn!("Partition at {} reached its early warning zone", args.home);
    }

    let pos = tape.read_position();
    tape.close().await?;
    engine.shutdown().await?;
    info!("Wrote blocks {}..{}", start, pos.block);
    println!(
        "Stored {} ({}) as file {} of partition {}",
        args.input.display(),
        human_size(data.len() as u64),
        pos.file - 1,
        args.home
    );
    Ok(())
}

pub async fn read(config: EngineConfig, args: ReadArgs) -> Result<()> {
    let engine = super::open_engine(config, &args.images, true).await?;
    let mut tape = engine
        .load_partition(args.home)
        .await
        .with_context(|| format!("Failed to load partition at {}", args.home))?;
    let target = match args.file {
        0 => Locate::Block(0),
        n => Locate::File(n - 1),
    };
    if let Some(condition) = tape.locate(target).await?.condition {
        return Err(anyhow!("File {} not found ({:?})", args.file, condition));
    }

    let mut data = Vec::new();
    loop {
        let out = tape.read(MAX_BLOCK_SIZE, 1, false).await?;
        data.extend_from_slice(&out.data);
        match out.condition {
            None | Some(Condition::LengthMismatch { .. }) => {}
            Some(Condition::Filemark) | Some(Condition::Setmark) | Some(Condition::EndOfData) => break,
            Some(other) => {
                warn!("Unexpected condition {:?} while reading", other);
                break;
            }
        }
    }
    tape.close().await?;
    engine.shutdown().await?;

    tokio::fs::write(&args.output, &data)
        .await
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    println!(
        "Read file {} ({}) into {}",
        args.file,
        human_size(data.len() as u64),
        args.output.display()
    );
    Ok(())
}
