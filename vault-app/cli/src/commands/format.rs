//! Format command for adding backing devices to a pool

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tapevault::blockdev::{BlockDevice, FileBackedBlockDevice};
use tapevault::EngineConfig;

use super::human_size;

/// Format a device or image file into a pool
#[derive(Parser, Debug)]
#[command(about = "Format a device or image file into a TapeVault pool")]
pub struct FormatArgs {
    /// Device or image file to format
    pub device: PathBuf,

    /// Create the image with this size in MiB (image files only)
    #[arg(short, long)]
    pub size: Option<u64>,

    /// Pool the device joins
    #[arg(short, long, default_value_t = 1)]
    pub pool: u32,

    /// Pool name recorded in the header
    #[arg(short, long, default_value = "default")]
    pub name: String,

    /// Device id, unique across the engine
    #[arg(short, long, default_value_t = 1)]
    pub bid: u32,

    /// Make this device the pool master
    #[arg(long)]
    pub master: bool,

    /// Mark the pool write-once
    #[arg(long)]
    pub worm: bool,

    /// Discard released units
    #[arg(long)]
    pub unmap: bool,

    /// Other images of the same pool, loaded before formatting
    #[arg(long = "with")]
    pub with: Vec<PathBuf>,

    /// Force formatting without confirmation
    #[arg(short, long)]
    pub force: bool,
}

pub async fn run(config: EngineConfig, args: FormatArgs) -> Result<()> {
    info!("TapeVault Format Tool v{}", env!("CARGO_PKG_VERSION"));

    let device = match args.size {
        Some(mib) => {
            if args.device.exists() && !args.device.is_file() {
                return Err(anyhow!(
                    "--size only applies to image files, {} is a device",
                    args.device.display()
                ));
            }
            let size = mib
                .checked_mul(1024 * 1024)
                .ok_or_else(|| anyhow!("Requested size is too large"))?;
            FileBackedBlockDevice::create(&args.device, size)
                .await
                .with_context(|| format!("Failed to create image {}", args.device.display()))?
        }
        None => {
            if !args.device.exists() {
                return Err(anyhow!("Device {:?} does not exist", args.device));
            }
            FileBackedBlockDevice::open(&args.device, false)
                .await
                .with_context(|| format!("Failed to open {}", args.device.display()))?
        }
    };
    let device = device.with_discard(args.unmap);
    info!(
        "Device size: {} bytes ({})",
        device.size(),
        human_size(device.size())
    );

    if !args.force {
        println!(
            "WARNING: This will format {} into pool {} ({}).",
            args.device.display(),
            args.pool,
            human_size(device.size())
        );
        println!("This operation will DESTROY ALL DATA on the device!");
        print!("Are you sure you want to continue? [y/N] ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Operation cancelled.");
            return Ok(());
        }
    }

    let engine = super::open_engine(config, &args.with, false).await?;
    if engine.registry().pool(args.pool).is_err() {
        engine
            .registry()
            .create_pool(args.pool, &args.name, args.worm)
            .context("Failed to create pool")?;
    }
    let master = args.master || engine.registry().pool(args.pool)?.master().is_none();
    let device: Arc<dyn BlockDevice> = Arc::new(device);
    let bdev = engine
        .registry()
        .format_device(args.pool, device, args.bid, master, args.unmap)
        .await
        .with_context(|| format!("Failed to format device: {}", args.device.display()))?;

    let stats = engine.registry().pool_stats(args.pool)?;
    engine.shutdown().await?;
    println!(
        "Formatted {} as device {} of pool {}: {} usable, pool now {} free",
        args.device.display(),
        bdev.bid(),
        args.pool,
        human_size(bdev.usable_size()),
        human_size(stats.free)
    );
    Ok(())
}
