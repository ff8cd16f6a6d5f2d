//! Channel collaborator.
//!
//! Queue endpoints never allocate shared memory themselves; they ask the
//! channel that owns their transport session. The channel also keeps the
//! id -> region table used when an oversized payload is shipped out-of-band
//! as a region id instead of inline bytes. Endpoints hold an explicit
//! `Weak<dyn Channel>` injected at construction; there is no process-global
//! lookup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::shmem::SharedRegion;
use crate::{Error, Result};

/// The host-IPC services a queue needs from its owning channel.
pub trait Channel: Send + Sync {
    /// Identity of this channel, validated when an endpoint descriptor is
    /// decoded on the receiving side.
    fn id(&self) -> i32;

    /// Allocates a fresh shared region and registers it for later lookup.
    /// Returns the region id alongside the region.
    fn alloc_shared_memory(&self, len: usize) -> Result<(u32, Arc<SharedRegion>)>;

    /// Looks up a region previously allocated (or registered) on this
    /// channel.
    fn lookup_shared_memory(&self, id: u32) -> Option<Arc<SharedRegion>>;

    /// Forgets a region once its payload has been consumed.
    fn release_shared_memory(&self, id: u32);
}

/// A self-contained [`Channel`] backed by anonymous shared regions.
///
/// Serves as the allocation side of the queue factory and as the lookup
/// table for out-of-band payload segments. A host IPC layer with its own
/// shmem brokering can supply its own `Channel` implementation instead.
pub struct MemChannel {
    id: i32,
    next_region_id: AtomicU32,
    regions: Mutex<HashMap<u32, Arc<SharedRegion>>>,
}

impl MemChannel {
    pub fn new(id: i32) -> Arc<Self> {
        Arc::new(Self {
            id,
            next_region_id: AtomicU32::new(1),
            regions: Mutex::new(HashMap::new()),
        })
    }

    /// Registers an externally created region under an explicit id, as a
    /// receiving process does for out-of-band segments shipped to it.
    pub fn register_shared_memory(&self, id: u32, region: Arc<SharedRegion>) -> Result<()> {
        let mut regions = self
            .regions
            .lock()
            .map_err(|_| Error::Fatal("channel region table poisoned"))?;
        regions.insert(id, region);
        Ok(())
    }
}

impl Channel for MemChannel {
    fn id(&self) -> i32 {
        self.id
    }

    fn alloc_shared_memory(&self, len: usize) -> Result<(u32, Arc<SharedRegion>)> {
        let region = Arc::new(SharedRegion::alloc(len)?);
        let id = self.next_region_id.fetch_add(1, Ordering::Relaxed);
        let mut regions = self
            .regions
            .lock()
            .map_err(|_| Error::Fatal("channel region table poisoned"))?;
        regions.insert(id, Arc::clone(&region));
        Ok((id, region))
    }

    fn lookup_shared_memory(&self, id: u32) -> Option<Arc<SharedRegion>> {
        let regions = self.regions.lock().ok()?;
        regions.get(&id).cloned()
    }

    fn release_shared_memory(&self, id: u32) {
        if let Ok(mut regions) = self.regions.lock() {
            regions.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_registers_for_lookup() {
        let channel = MemChannel::new(7);
        assert_eq!(channel.id(), 7);
        let (id, region) = channel.alloc_shared_memory(4096).unwrap();
        let found = channel.lookup_shared_memory(id).unwrap();
        assert!(Arc::ptr_eq(&region, &found));
        assert!(channel.lookup_shared_memory(id + 1).is_none());
    }

    #[test]
    fn release_removes_region() {
        let channel = MemChannel::new(1);
        let (id, _region) = channel.alloc_shared_memory(1024).unwrap();
        channel.release_shared_memory(id);
        assert!(channel.lookup_shared_memory(id).is_none());
    }
}
