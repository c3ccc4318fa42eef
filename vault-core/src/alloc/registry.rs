//! Registry of pools and backing devices

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::bdev::{BackingDevice, FormatOptions};
use super::pool::{DevicePool, PoolStats};
use super::Extent;
use crate::blockdev::BlockDevice;
use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::format::{field_str, BlockPtr};
use crate::io::DeviceHandle;

/// Owns every pool and backing device of an engine instance
pub struct DeviceRegistry {
    config: AllocatorConfig,
    devices: RwLock<HashMap<u32, Arc<BackingDevice>>>,
    pools: RwLock<HashMap<u32, Arc<DevicePool>>>,
}

impl DeviceRegistry {
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            config,
            devices: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Allocation unit size shared by every device
    pub fn unit_size(&self) -> u64 {
        self.config.unit_size()
    }

    /// Register a new pool with a random relation id
    pub fn create_pool(&self, id: u32, name: &str, worm: bool) -> Result<Arc<DevicePool>> {
        let mut raw = [0u8; 8];
        getrandom::getrandom(&mut raw)
            .map_err(|e| Error::InvalidArgument(format!("relation id entropy: {}", e)))?;
        let relation: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
        self.insert_pool(DevicePool::new(id, name, worm, &relation))
    }

    fn insert_pool(&self, pool: DevicePool) -> Result<Arc<DevicePool>> {
        let mut pools = self.pools.write();
        if pools.contains_key(&pool.id()) {
            return Err(Error::InvalidArgument(format!("pool {} exists", pool.id())));
        }
        let pool = Arc::new(pool);
        pools.insert(pool.id(), pool.clone());
        log::info!(
            "DEVICE_REGISTRY: created pool {} ({}){}",
            pool.id(),
            pool.name(),
            if pool.is_worm() { " WORM" } else { "" }
        );
        Ok(pool)
    }

    /// Remove an empty pool
    pub fn remove_pool(&self, id: u32) -> Result<()> {
        let mut pools = self.pools.write();
        let pool = pools.get(&id).ok_or(Error::PoolNotFound(id))?;
        if pool.device_count() > 0 {
            return Err(Error::InvalidArgument(format!(
                "pool {} still has {} devices",
                id,
                pool.device_count()
            )));
        }
        pools.remove(&id);
        Ok(())
    }

    pub fn pool(&self, id: u32) -> Result<Arc<DevicePool>> {
        self.pools.read().get(&id).cloned().ok_or(Error::PoolNotFound(id))
    }

    pub fn pools(&self) -> Vec<Arc<DevicePool>> {
        self.pools.read().values().cloned().collect()
    }

    /// Format `device` into pool `pool_id` and register it
    pub async fn format_device(
        &self,
        pool_id: u32,
        device: Arc<dyn BlockDevice>,
        bid: u32,
        master: bool,
        unmap: bool,
    ) -> Result<Arc<BackingDevice>> {
        let pool = self.pool(pool_id)?;
        if self.devices.read().contains_key(&bid) {
            return Err(Error::InvalidArgument(format!("device id {} in use", bid)));
        }
        let opts = FormatOptions {
            bid,
            pool_id,
            pool_name: pool.name().to_string(),
            relation_id: pool.relation_id().to_string(),
            master: master && pool.master().is_none(),
            worm: pool.is_worm(),
            unmap,
        };
        let bdev = Arc::new(BackingDevice::format(device, opts, &self.config).await?);
        self.attach(pool, bdev.clone())?;
        Ok(bdev)
    }

    /// Load a formatted device, creating its pool from the header if unknown
    pub async fn load_device(&self, device: Arc<dyn BlockDevice>) -> Result<Arc<BackingDevice>> {
        let bdev = Arc::new(BackingDevice::load(device, &self.config).await?);
        let header = bdev.header();
        if self.devices.read().contains_key(&bdev.bid()) {
            return Err(Error::InvalidArgument(format!(
                "device id {} already loaded",
                bdev.bid()
            )));
        }

        let relation = field_str(&header.relation_id);
        let pool = match self.pool(header.pool_id) {
            Ok(pool) => pool,
            Err(_) => self.insert_pool(DevicePool::new(
                header.pool_id,
                &field_str(&header.pool_name),
                header.is_worm(),
                &relation,
            ))?,
        };
        if pool.relation_id() != relation {
            log::warn!(
                "DEVICE_REGISTRY: device {} relation id {} does not match pool {} ({})",
                bdev.bid(),
                relation,
                pool.id(),
                pool.relation_id()
            );
            return Err(Error::InvalidArgument(format!(
                "device {} belongs to a different pool instance",
                bdev.bid()
            )));
        }
        self.attach(pool, bdev.clone())?;
        Ok(bdev)
    }

    fn attach(&self, pool: Arc<DevicePool>, bdev: Arc<BackingDevice>) -> Result<()> {
        pool.add_device(bdev.clone())?;
        self.devices.write().insert(bdev.bid(), bdev);
        Ok(())
    }

    pub fn get_device(&self, bid: u32) -> Result<Arc<BackingDevice>> {
        self.devices
            .read()
            .get(&bid)
            .cloned()
            .ok_or(Error::DeviceNotFound(bid))
    }

    pub fn devices(&self) -> Vec<Arc<BackingDevice>> {
        self.devices.read().values().cloned().collect()
    }

    /// I/O handle for device `bid`
    pub fn handle(&self, bid: u32) -> Result<DeviceHandle> {
        let bdev = self.get_device(bid)?;
        Ok(DeviceHandle::new(bid, bdev.device().clone()))
    }

    /// Unregister a device once its discards have drained
    pub async fn remove_device(&self, bid: u32) -> Result<Arc<BackingDevice>> {
        let bdev = self.get_device(bid)?;
        bdev.wait_discards().await;
        if let Ok(pool) = self.pool(bdev.pool_id()) {
            pool.remove_device(bid);
        }
        self.devices.write().remove(&bid);
        log::info!("DEVICE_REGISTRY: removed device {}", bid);
        Ok(bdev)
    }

    /// Allocate one unit from pool `pool_id`
    pub async fn allocate(&self, pool_id: u32) -> Result<Extent> {
        self.pool(pool_id)?.allocate().await
    }

    /// Release the unit at `ptr`
    pub async fn release(&self, ptr: BlockPtr) -> Result<()> {
        let bdev = self.get_device(ptr.bid())?;
        bdev.release(ptr.block()).await?;
        if let Ok(pool) = self.pool(bdev.pool_id()) {
            pool.note_release(bdev.bid());
        }
        Ok(())
    }

    pub fn pool_stats(&self, pool_id: u32) -> Result<PoolStats> {
        Ok(self.pool(pool_id)?.stats())
    }

    /// Wait for in-flight discards on every device
    pub async fn wait_discards(&self) {
        for bdev in self.devices() {
            bdev.wait_discards().await;
        }
    }

    /// Drain discards and sync every device
    pub async fn shutdown(&self) -> Result<()> {
        self.wait_discards().await;
        for bdev in self.devices() {
            bdev.device().sync().await?;
        }
        log::info!("DEVICE_REGISTRY: shut down");
        Ok(())
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.read().len())
            .field("pools", &self.pools.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;

    fn config() -> AllocatorConfig {
        AllocatorConfig {
            unit_shift: 20,
            min_device_size: 8 << 20,
            ..AllocatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let registry = DeviceRegistry::new(config());
        registry.create_pool(1, "main", false).unwrap();
        assert!(registry.create_pool(1, "dup", false).is_err());

        let mem = Arc::new(MemoryBlockDevice::new(16 << 20));
        let bdev = registry
            .format_device(1, mem.clone(), 1, true, false)
            .await
            .unwrap();
        assert!(bdev.is_master());
        assert!(registry
            .format_device(1, Arc::new(MemoryBlockDevice::new(16 << 20)), 1, false, false)
            .await
            .is_err());

        let extent = registry.allocate(1).await.unwrap();
        assert_eq!(registry.pool_stats(1).unwrap().free, 14 << 20);
        registry.release(extent.ptr).await.unwrap();
        assert_eq!(registry.pool_stats(1).unwrap().free, 15 << 20);
        assert!(matches!(
            registry.release(BlockPtr::new(9, 256)).await,
            Err(Error::DeviceNotFound(9))
        ));

        assert!(registry.remove_pool(1).is_err());
        registry.remove_device(1).await.unwrap();
        registry.remove_pool(1).unwrap();

        // reloading recreates the pool from the header
        let again = DeviceRegistry::new(config());
        let loaded = again.load_device(mem).await.unwrap();
        assert_eq!(loaded.pool_id(), 1);
        assert_eq!(again.pool(1).unwrap().name(), "main");
        assert_eq!(again.pool(1).unwrap().master().unwrap().bid(), 1);
    }
}
