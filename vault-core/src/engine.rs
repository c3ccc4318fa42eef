//! Engine instance: configuration, device registry and worker pool

use std::path::Path;
use std::sync::Arc;

use crate::alloc::{BackingDevice, DeviceRegistry};
use crate::blockdev::FileBackedBlockDevice;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::format::BlockPtr;
use crate::io::{codec_for, BlockCodec, WorkerPool};
use crate::tape::TapePartition;

/// Everything partitions share: pools and devices, the background workers
/// and the data codec
pub struct Engine {
    config: EngineConfig,
    registry: Arc<DeviceRegistry>,
    workers: Arc<WorkerPool>,
    codec: Option<Arc<dyn BlockCodec>>,
}

impl Engine {
    /// Validate `config` and start the workers on the current runtime
    pub fn start(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let registry = Arc::new(DeviceRegistry::new(config.allocator.clone()));
        let workers = WorkerPool::start(&config.io);
        let codec = codec_for(config.compression);
        log::info!(
            "ENGINE: started with {} byte units, codec {}",
            config.allocator.unit_size(),
            codec.as_ref().map(|c| c.name()).unwrap_or("none")
        );
        Ok(Arc::new(Self {
            config,
            registry,
            workers,
            codec,
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub fn codec(&self) -> Option<Arc<dyn BlockCodec>> {
        self.codec.clone()
    }

    /// Open a formatted image file and register it with its pool
    pub async fn attach_image(&self, path: impl AsRef<Path>, read_only: bool) -> Result<Arc<BackingDevice>> {
        let device = FileBackedBlockDevice::open(path, read_only).await?;
        self.registry.load_device(Arc::new(device)).await
    }

    /// Create an empty partition of `size` bytes in pool `pool_id`
    pub async fn create_partition(&self, pool_id: u32, id: u32, size: u64, worm: bool) -> Result<TapePartition> {
        TapePartition::new(self, pool_id, id, size, worm).await
    }

    /// Open the partition whose home unit is at `home`
    pub async fn load_partition(&self, home: BlockPtr) -> Result<TapePartition> {
        TapePartition::load(self, home).await
    }

    /// Drain discards, sync devices and stop the workers
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.registry.shutdown().await;
        self.workers.shutdown().await;
        log::info!("ENGINE: shut down");
        result
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("workers", &self.workers)
            .finish()
    }
}
