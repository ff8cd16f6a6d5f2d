//! Ring-buffer base shared by the producer and consumer endpoints.
//!
//! The base owns the mapped segment, the pair of wake-up semaphores, a weak
//! link back to the owning channel, and the arithmetic over the two shared
//! cursors. The cursors themselves live inside the segment at offsets
//! computed by [`crate::layout::header_layout`]; they are never constructed
//! in place — every access is an atomic load or store at the computed offset
//! through the accessors below, so re-binding a transferred segment cannot
//! disturb in-flight state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::debug;

use crate::channel::Channel;
use crate::layout::{header_layout, max_header_size, HeaderLayout};
use crate::sem::Semaphore;
use crate::shmem::SharedRegion;
use crate::{Error, Result};

pub(crate) struct RingBase {
    region: Arc<SharedRegion>,
    channel: Weak<dyn Channel>,
    channel_id: i32,
    capacity: usize,
    buffer_size: usize,
    layout: HeaderLayout,
    reserved_len: usize,
    not_empty: Semaphore,
    not_full: Semaphore,
}

impl RingBase {
    /// Binds to an already-allocated segment and semaphore pair.
    ///
    /// Performs no cursor initialization: on every path except the original
    /// factory construction the cursor bytes already carry live queue state.
    /// Only [`RingBase::init_cursors`] — called exactly once, by the factory,
    /// on the writer side — may zero them.
    pub fn bind(
        region: Arc<SharedRegion>,
        channel: &Arc<dyn Channel>,
        capacity: usize,
        not_empty: Semaphore,
        not_full: Semaphore,
    ) -> Result<Self> {
        let buffer_size = capacity + 1;
        if region.len() < buffer_size + max_header_size() {
            return Err(Error::Fatal("segment too small for queue"));
        }
        let layout = header_layout(capacity, region.len());
        debug!(
            "bound queue endpoint: capacity={}, read_off={}, write_off={}, reserved={}",
            capacity, layout.read, layout.write, layout.reserved_len
        );
        Ok(Self {
            region,
            channel: Arc::downgrade(channel),
            channel_id: channel.id(),
            capacity,
            buffer_size,
            reserved_len: layout.reserved_len,
            layout,
            not_empty,
            not_full,
        })
    }

    /// Zeroes both cursors. Factory-only; see [`RingBase::bind`].
    pub fn init_cursors(&self) {
        self.store_read(0, Ordering::Release);
        self.store_write(0, Ordering::Release);
    }

    fn cursor_at(&self, offset: usize) -> &AtomicUsize {
        debug_assert!(offset == self.layout.read || offset == self.layout.write);
        // SAFETY: both cursor offsets are cache-line aligned, in bounds for
        // the mapping (checked in bind), and the mapping outlives self.
        unsafe { &*(self.region.base().add(offset) as *const AtomicUsize) }
    }

    /// Atomic load of the read cursor at its computed offset.
    pub fn load_read(&self, order: Ordering) -> usize {
        self.cursor_at(self.layout.read).load(order)
    }

    /// Atomic store of the read cursor. Release ordering publishes the bytes
    /// freed by a completed removal to the producer's acquire load.
    pub fn store_read(&self, value: usize, order: Ordering) {
        self.cursor_at(self.layout.read).store(value, order);
    }

    /// Atomic load of the write cursor at its computed offset.
    pub fn load_write(&self, order: Ordering) -> usize {
        self.cursor_at(self.layout.write).load(order)
    }

    /// Atomic store of the write cursor. Release ordering publishes the bytes
    /// written by a completed insertion to the consumer's acquire load.
    pub fn store_write(&self, value: usize, order: Ordering) {
        self.cursor_at(self.layout.write).store(value, order);
    }

    /// Usable byte capacity. One byte of the backing buffer is permanently
    /// sacrificed so `read == write` can only mean "empty".
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size of the backing circular buffer (`capacity + 1`). This is the
    /// modulus for cursor arithmetic.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Base of the circular payload region.
    pub fn data_ptr(&self) -> *mut u8 {
        self.region.base()
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.upgrade()
    }

    pub fn channel_id(&self) -> i32 {
        self.channel_id
    }

    pub fn not_empty(&self) -> &Semaphore {
        &self.not_empty
    }

    pub fn not_full(&self) -> &Semaphore {
        &self.not_full
    }

    /// Caller-reserved bytes after the cursor block, if any were requested
    /// at creation.
    pub fn reserved_region(&self) -> Option<(*mut u8, usize)> {
        if self.reserved_len == 0 {
            return None;
        }
        // SAFETY: layout.reserved + reserved_len <= region.len().
        let ptr = unsafe { self.region.base().add(self.layout.reserved) };
        Some((ptr, self.reserved_len))
    }

    /// The factory clamps the reserved region to what the caller asked for,
    /// hiding any rounding slack the allocator added.
    pub fn set_reserved_len(&mut self, len: usize) {
        debug_assert!(len <= self.layout.reserved_len);
        self.reserved_len = len.min(self.layout.reserved_len);
    }

    /// True when both offsets are inside the backing buffer. A violation
    /// means the shared segment was corrupted or the single-owner contract
    /// was broken; no further cursor arithmetic is meaningful.
    pub fn valid_state(&self, read: usize, write: usize) -> bool {
        read < self.buffer_size && write < self.buffer_size
    }

    /// Bytes occupied if `read`/`write` are the current cursor positions.
    pub fn used_bytes_at(&self, read: usize, write: usize) -> usize {
        debug_assert!(self.valid_state(read, write));
        (write + self.buffer_size - read) % self.buffer_size
    }

    /// Bytes available if `read`/`write` are the current cursor positions.
    pub fn free_bytes_at(&self, read: usize, write: usize) -> usize {
        self.capacity - self.used_bytes_at(read, write)
    }

    // The no-argument forms read both cursors with relaxed ordering and may
    // be stale: the producer never under-reports used bytes and the consumer
    // never over-reports them, which is what makes acting on the answer safe
    // for the endpoint that owns the opposite cursor.

    pub fn used_bytes(&self) -> usize {
        let read = self.load_read(Ordering::Relaxed);
        let write = self.load_write(Ordering::Relaxed);
        self.used_bytes_at(read, write)
    }

    pub fn free_bytes(&self) -> usize {
        self.capacity - self.used_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.used_bytes() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free_bytes() == 0
    }
}

impl Drop for RingBase {
    fn drop(&mut self) {
        debug!("released queue endpoint (capacity={})", self.capacity);
    }
}
