pub mod format;
pub mod info;
pub mod partition;
pub mod transfer;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tapevault::{Engine, EngineConfig};

/// Configuration from `path`, or the built-in defaults
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

/// Start an engine and attach every image in `images`
pub async fn open_engine(config: EngineConfig, images: &[PathBuf], read_only: bool) -> Result<Arc<Engine>> {
    let engine = Engine::start(config).context("Failed to start engine")?;
    for image in images {
        let bdev = engine
            .attach_image(image, read_only)
            .await
            .with_context(|| format!("Failed to load device {}", image.display()))?;
        log::info!(
            "Attached {} as device {} of pool {}",
            image.display(),
            bdev.bid(),
            bdev.pool_id()
        );
    }
    Ok(engine)
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
