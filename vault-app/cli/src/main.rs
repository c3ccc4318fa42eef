//! TapeVault command line interface
//!
//! Formats backing devices, creates tape partitions and moves data in and
//! out of them.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use std::path::PathBuf;

mod commands;

/// TapeVault - virtual tape storage on pooled backing devices
#[derive(Parser)]
#[command(
    name = "tapevault",
    about = "TapeVault command-line interface",
    version = env!("CARGO_PKG_VERSION"),
    author = "TapeVault Contributors"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format an image file or device into a pool
    Format(commands::format::FormatArgs),

    /// Show pools and devices of a set of images
    Info(commands::info::InfoArgs),

    /// Create a tape partition
    Mkpart(commands::partition::MkpartArgs),

    /// Delete a tape partition and free its space
    Rmpart(commands::partition::RmpartArgs),

    /// Append a file to a tape partition
    Write(commands::transfer::WriteArgs),

    /// Read a file back from a tape partition
    Read(commands::transfer::ReadArgs),

    /// List the files recorded on a tape partition
    Dump(commands::partition::DumpArgs),

    /// Print the effective engine configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new().filter_level(log_level).init();

    info!("TapeVault CLI v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = commands::load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Format(args) => commands::format::run(config, args).await,
        Commands::Info(args) => commands::info::run(config, args).await,
        Commands::Mkpart(args) => commands::partition::mkpart(config, args).await,
        Commands::Rmpart(args) => commands::partition::rmpart(config, args).await,
        Commands::Write(args) => commands::transfer::write(config, args).await,
        Commands::Read(args) => commands::transfer::read(config, args).await,
        Commands::Dump(args) => commands::partition::dump(config, args).await,
        Commands::Config => {
            println!("{}", config.to_json()?);
            Ok(())
        }
    }
}
