//! Persistent allocation bitmap pages
//!
//! One page tracks [`UNITS_PER_INDEX`] allocation units of a backing device.
//! Bits cleared by a release stay "unmap pending" until the discard issued
//! for them completes; they are not handed out again before that.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::format::{seal_page, verify_page, zero_page, FormatError};

/// Bitmap bytes in one index page; the rest is padding and the checksum
pub const INDEX_BITMAP_BYTES: usize = 4088;
/// Allocation units tracked by one index page
pub const UNITS_PER_INDEX: u64 = (INDEX_BITMAP_BYTES * 8) as u64;

/// In-flight discards for the bits of one index page
#[derive(Debug, Default)]
pub struct UnmapTracker {
    pending: Mutex<HashSet<u32>>,
    notify: Notify,
}

impl UnmapTracker {
    pub fn insert(&self, bit: u32) {
        self.pending.lock().insert(bit);
    }

    /// Resolve the marker for `bit` and wake every waiter
    pub fn complete(&self, bit: u32) {
        self.pending.lock().remove(&bit);
        self.notify.notify_waiters();
    }

    pub fn is_pending(&self, bit: u32) -> bool {
        self.pending.lock().contains(&bit)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait until the discard of `bit` has resolved
    pub async fn wait_for(&self, bit: u32) {
        loop {
            let notified = self.notify.notified();
            if !self.is_pending(bit) {
                return;
            }
            notified.await;
        }
    }

    /// Wait until no discard is pending on this page
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Result of scanning a page for a clear bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeBit {
    /// A clear bit with no discard in flight
    Free(u32),
    /// Only bits whose discard is still pending are clear; the first one
    Pending(u32),
    /// Every usable bit is set
    Full,
}

/// A resident index page
pub struct IndexPage {
    index_id: u32,
    bitmap: Vec<u8>,
    unmaps: Arc<UnmapTracker>,
}

impl IndexPage {
    /// An empty page
    pub fn new(index_id: u32) -> Self {
        Self {
            index_id,
            bitmap: vec![0u8; INDEX_BITMAP_BYTES],
            unmaps: Arc::new(UnmapTracker::default()),
        }
    }

    /// Parse a page read from `block`, validating its checksum
    pub fn decode(index_id: u32, page: &[u8], block: u64) -> Result<Self, FormatError> {
        verify_page(page, block)?;
        Ok(Self {
            index_id,
            bitmap: page[..INDEX_BITMAP_BYTES].to_vec(),
            unmaps: Arc::new(UnmapTracker::default()),
        })
    }

    /// Sealed on-disk image
    pub fn encode(&self) -> Vec<u8> {
        let mut page = zero_page();
        page[..INDEX_BITMAP_BYTES].copy_from_slice(&self.bitmap);
        seal_page(&mut page);
        page
    }

    pub fn index_id(&self) -> u32 {
        self.index_id
    }

    pub fn unmaps(&self) -> &Arc<UnmapTracker> {
        &self.unmaps
    }

    pub fn is_set(&self, bit: u32) -> bool {
        self.bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }

    pub fn set(&mut self, bit: u32) {
        self.bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
    }

    pub fn clear(&mut self, bit: u32) {
        self.bitmap[(bit / 8) as usize] &= !(1 << (bit % 8));
    }

    /// Find a clear bit below `limit`.
    ///
    /// Bytes are scanned in order, bits low to high. With `skip_pending`,
    /// clear bits whose discard has not completed are passed over.
    pub fn find_free(&self, limit: u32, skip_pending: bool) -> FreeBit {
        let mut pending = None;
        for (byte_idx, &byte) in self.bitmap.iter().enumerate() {
            if byte == 0xFF {
                continue;
            }
            for bit in 0..8u32 {
                let idx = byte_idx as u32 * 8 + bit;
                if idx >= limit {
                    return pending.map(FreeBit::Pending).unwrap_or(FreeBit::Full);
                }
                if byte & (1 << bit) != 0 {
                    continue;
                }
                if skip_pending && self.unmaps.is_pending(idx) {
                    pending.get_or_insert(idx);
                    continue;
                }
                return FreeBit::Free(idx);
            }
        }
        pending.map(FreeBit::Pending).unwrap_or(FreeBit::Full)
    }

    /// Clear bits below `limit`
    pub fn count_free(&self, limit: u32) -> u64 {
        (0..limit).filter(|&bit| !self.is_set(bit)).count() as u64
    }
}

impl std::fmt::Debug for IndexPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexPage")
            .field("index_id", &self.index_id)
            .field("pending_unmaps", &self.unmaps.len())
            .finish()
    }
}
