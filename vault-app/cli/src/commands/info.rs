//! Info command: pools and devices of a set of images

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use tapevault::format::field_str;
use tapevault::EngineConfig;

use super::human_size;

#[derive(Parser, Debug)]
#[command(about = "Show pools and devices of a set of images")]
pub struct InfoArgs {
    /// Formatted images or devices
    #[arg(required = true)]
    pub images: Vec<PathBuf>,
}

pub async fn run(config: EngineConfig, args: InfoArgs) -> Result<()> {
    let engine = super::open_engine(config, &args.images, true).await?;
    let mut pools = engine.registry().pools();
    pools.sort_by_key(|p| p.id());

    for pool in pools {
        let stats = pool.stats();
        println!(
            "pool {} \"{}\"{}: {} device(s), {} usable, {} free, {} discard(s) pending",
            pool.id(),
            pool.name(),
            if pool.is_worm() { " (WORM)" } else { "" },
            stats.devices,
            human_size(stats.usable),
            human_size(stats.free),
            stats.pending_discards
        );
        let mut devices = pool.devices();
        devices.sort_by_key(|d| d.bid());
        for bdev in devices {
            let header = bdev.header();
            println!(
                "  device {}{}: {} units of {}, {} free, serial {}, created {}",
                bdev.bid(),
                if bdev.is_master() { " (master)" } else { "" },
                bdev.geometry().units,
                human_size(bdev.unit_size()),
                human_size(bdev.free_bytes()),
                field_str(&header.serial),
                chrono::DateTime::from_timestamp(header.created_at, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "unknown".into())
            );
        }
    }
    engine.shutdown().await?;
    Ok(())
}
