//! Device pools and their allocation rotation

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::bdev::BackingDevice;
use super::Extent;
use crate::error::{Error, Result};

struct PoolState {
    members: HashMap<u32, Arc<BackingDevice>>,
    /// Devices that may have free space, by descending free bytes at insert time
    alloc_list: Vec<u32>,
    /// Rotation cursor into `alloc_list`
    eligible: usize,
    master: Option<u32>,
}

impl PoolState {
    /// Insert `bid` into the allocation list keeping it ordered by free space
    fn insert_sorted(&mut self, bid: u32) {
        if self.alloc_list.contains(&bid) {
            return;
        }
        let free_of = |id: &u32| self.members.get(id).map(|d| d.free_bytes()).unwrap_or(0);
        let free = free_of(&bid);
        let pos = self
            .alloc_list
            .iter()
            .position(|id| free_of(id) < free)
            .unwrap_or(self.alloc_list.len());
        self.alloc_list.insert(pos, bid);
        if pos < self.eligible {
            self.eligible += 1;
        }
    }

    fn drop_from_rotation(&mut self, bid: u32) {
        if let Some(pos) = self.alloc_list.iter().position(|id| *id == bid) {
            self.alloc_list.remove(pos);
            if pos < self.eligible {
                self.eligible -= 1;
            }
            if self.eligible >= self.alloc_list.len() {
                self.eligible = 0;
            }
        }
    }
}

/// Snapshot of a pool's capacity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub devices: usize,
    pub usable: u64,
    pub free: u64,
    pub pending_discards: usize,
}

/// A named group of backing devices sharing allocation and WORM policy
pub struct DevicePool {
    id: u32,
    name: String,
    worm: bool,
    relation_id: String,
    state: Mutex<PoolState>,
}

impl DevicePool {
    pub fn new(id: u32, name: &str, worm: bool, relation_id: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            worm,
            relation_id: relation_id.to_string(),
            state: Mutex::new(PoolState {
                members: HashMap::new(),
                alloc_list: Vec::new(),
                eligible: 0,
                master: None,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_worm(&self) -> bool {
        self.worm
    }

    pub fn relation_id(&self) -> &str {
        &self.relation_id
    }

    pub fn device_count(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn devices(&self) -> Vec<Arc<BackingDevice>> {
        self.state.lock().members.values().cloned().collect()
    }

    pub fn contains(&self, bid: u32) -> bool {
        self.state.lock().members.contains_key(&bid)
    }

    /// Add a device; a master device becomes the pool master if none is set
    pub fn add_device(&self, bdev: Arc<BackingDevice>) -> Result<()> {
        let mut state = self.state.lock();
        let bid = bdev.bid();
        if state.members.contains_key(&bid) {
            return Err(Error::InvalidArgument(format!(
                "device {} already in pool {}",
                bid, self.id
            )));
        }
        if bdev.is_master() {
            match state.master {
                Some(existing) => {
                    return Err(Error::InvalidArgument(format!(
                        "pool {} already has master device {}",
                        self.id, existing
                    )))
                }
                None => state.master = Some(bid),
            }
        }
        state.members.insert(bid, bdev);
        state.insert_sorted(bid);
        log::info!(
            "DEVICE_POOL: added device {} to pool {} ({} devices)",
            bid,
            self.name,
            state.members.len()
        );
        Ok(())
    }

    pub fn remove_device(&self, bid: u32) -> Option<Arc<BackingDevice>> {
        let mut state = self.state.lock();
        let bdev = state.members.remove(&bid)?;
        state.drop_from_rotation(bid);
        if state.master == Some(bid) {
            state.master = None;
        }
        Some(bdev)
    }

    /// The device holding pool-wide metadata
    pub fn master(&self) -> Option<Arc<BackingDevice>> {
        let state = self.state.lock();
        state.master.and_then(|bid| state.members.get(&bid).cloned())
    }

    /// Make `bid` the pool master, persisting the flag on the old and new master
    pub async fn set_master(&self, bid: u32) -> Result<()> {
        let (old, new) = {
            let state = self.state.lock();
            let new = state
                .members
                .get(&bid)
                .cloned()
                .ok_or(Error::DeviceNotFound(bid))?;
            let old = state
                .master
                .filter(|m| *m != bid)
                .and_then(|m| state.members.get(&m).cloned());
            (old, new)
        };
        if let Some(old) = old {
            old.set_master(false).await?;
        }
        new.set_master(true).await?;
        self.state.lock().master = Some(bid);
        Ok(())
    }

    /// Allocate one unit from the pool.
    ///
    /// The eligible device is tried first; a full device leaves the rotation
    /// and the next one is tried, until every member has been asked.
    pub async fn allocate(&self) -> Result<Extent> {
        let attempts = self.device_count();
        for _ in 0..attempts.max(1) {
            let bdev = {
                let state = self.state.lock();
                if state.alloc_list.is_empty() {
                    break;
                }
                let bid = state.alloc_list[state.eligible % state.alloc_list.len()];
                match state.members.get(&bid) {
                    Some(bdev) => bdev.clone(),
                    None => break,
                }
            };

            match bdev.alloc_extent().await? {
                Some(extent) => {
                    let mut state = self.state.lock();
                    if let Some(pos) = state.alloc_list.iter().position(|id| *id == bdev.bid()) {
                        state.eligible = (pos + 1) % state.alloc_list.len();
                    }
                    return Ok(extent);
                }
                None => {
                    log::info!(
                        "DevicePool::allocate: device {} in pool {} is full, rotating",
                        bdev.bid(),
                        self.name
                    );
                    self.state.lock().drop_from_rotation(bdev.bid());
                }
            }
        }
        log::warn!("DevicePool::allocate: pool {} has no free extents", self.name);
        Err(Error::CapacityExhausted(self.id))
    }

    /// A device gained free space; put it back into the rotation
    pub fn note_release(&self, bid: u32) {
        let mut state = self.state.lock();
        if state.members.contains_key(&bid) {
            state.insert_sorted(bid);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut stats = PoolStats {
            devices: state.members.len(),
            ..PoolStats::default()
        };
        for bdev in state.members.values() {
            stats.usable += bdev.usable_size();
            stats.free += bdev.free_bytes();
            stats.pending_discards += bdev.pending_discards();
        }
        stats
    }
}

impl std::fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("worm", &self.worm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::FormatOptions;
    use crate::blockdev::MemoryBlockDevice;
    use crate::config::AllocatorConfig;

    fn config() -> AllocatorConfig {
        AllocatorConfig {
            unit_shift: 20,
            min_device_size: 8 << 20,
            ..AllocatorConfig::default()
        }
    }

    async fn device(bid: u32, size: u64, master: bool) -> Arc<BackingDevice> {
        let mem = Arc::new(MemoryBlockDevice::new(size));
        let opts = FormatOptions {
            bid,
            pool_id: 1,
            pool_name: "pool".into(),
            relation_id: "rel".into(),
            master,
            worm: false,
            unmap: false,
        };
        Arc::new(BackingDevice::format(mem, opts, &config()).await.unwrap())
    }

    #[tokio::test]
    async fn test_rotation_and_exhaustion() {
        let pool = DevicePool::new(1, "pool", false, "rel");
        pool.add_device(device(1, 10 << 20, true).await).unwrap();
        pool.add_device(device(2, 12 << 20, false).await).unwrap();
        assert_eq!(pool.master().unwrap().bid(), 1);

        // the larger device leads the rotation
        let first = pool.allocate().await.unwrap();
        assert_eq!(first.ptr.bid(), 2);
        let second = pool.allocate().await.unwrap();
        assert_eq!(second.ptr.bid(), 1);

        let mut total = 2;
        while pool.allocate().await.is_ok() {
            total += 1;
        }
        assert_eq!(total, 9 + 11);
        assert!(matches!(pool.allocate().await, Err(Error::CapacityExhausted(1))));

        let bdev = pool.devices().into_iter().find(|d| d.bid() == 2).unwrap();
        bdev.release(first.ptr.block()).await.unwrap();
        pool.note_release(2);
        assert_eq!(pool.allocate().await.unwrap().ptr, first.ptr);
    }

    #[tokio::test]
    async fn test_single_master() {
        let pool = DevicePool::new(1, "pool", false, "rel");
        pool.add_device(device(1, 10 << 20, true).await).unwrap();
        assert!(pool.add_device(device(2, 10 << 20, true).await).is_err());
        pool.add_device(device(3, 10 << 20, false).await).unwrap();

        pool.set_master(3).await.unwrap();
        assert_eq!(pool.master().unwrap().bid(), 3);
        let old = pool.devices().into_iter().find(|d| d.bid() == 1).unwrap();
        assert!(!old.is_master());
    }
}
