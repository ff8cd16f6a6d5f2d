//! Producer endpoint.
//!
//! The producer is the sole writer of the write cursor. An insertion
//! serializes a whole batch at a local cursor first and publishes the shared
//! cursor once, with release ordering, only after every item landed; a batch
//! that fails for any reason leaves the queue exactly as it was.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{debug, error};

use crate::clock::{Clock, SystemClock};
use crate::marshal::{InsertItem, ProducerView};
use crate::ring::RingBase;
use crate::shmem::SharedRegion;
use crate::{Error, Result};

/// Write end of a queue. There is exactly one per queue; it is `Send` but
/// deliberately not `Clone`.
pub struct Producer<C: Clock = SystemClock> {
    ring: RingBase,
    clock: C,
}

impl Producer<SystemClock> {
    pub(crate) fn new(ring: RingBase) -> Self {
        Self {
            ring,
            clock: SystemClock,
        }
    }
}

impl<C: Clock> Producer<C> {
    /// Replaces the timeout clock, mainly so tests can drive deadlines.
    pub fn with_clock<D: Clock>(self, clock: D) -> Producer<D> {
        Producer {
            ring: self.ring,
            clock,
        }
    }

    /// Attempts to insert a batch of items atomically: either every item is
    /// enqueued or none is.
    ///
    /// Returns [`Error::TooSmall`] if the batch can never fit this queue,
    /// [`Error::NotReady`] if it does not fit right now, and
    /// [`Error::Fatal`] if the shared state is corrupt.
    pub fn try_insert(&mut self, items: &[&dyn InsertItem]) -> Result<()> {
        let write = self.ring.load_write(Ordering::Relaxed);
        let read = self.ring.load_read(Ordering::Acquire);
        if !self.ring.valid_state(read, write) {
            error!("queue cursors out of range: read={read}, write={write}");
            return Err(Error::Fatal("queue cursors out of range"));
        }

        let sizing = ProducerView::new(&self.ring, write, 0);
        let needed: usize = items.iter().map(|item| item.min_size(&sizing)).sum();
        if needed > self.ring.capacity() {
            return Err(Error::TooSmall);
        }
        if needed > self.ring.free_bytes_at(read, write) {
            return Err(Error::NotReady);
        }

        let mut view = ProducerView::new(&self.ring, write, needed);
        for item in items {
            if let Err(err) = item.write(&mut view) {
                // An uncommitted batch must leave no trace, including any
                // out-of-band regions already registered on the channel.
                view.discard_allocations();
                return Err(err);
            }
        }
        let end = (write + needed) % self.ring.buffer_size();
        if view.cursor() != end {
            error!(
                "batch serialized to {} bytes past {write}, expected cursor {end}",
                needed
            );
            view.discard_allocations();
            return Err(Error::Fatal("batch serialized to unexpected size"));
        }

        self.ring.store_write(end, Ordering::Release);
        // Edge-triggered wake-up: only the empty -> non-empty transition needs
        // a token, and a pending token already covers this insertion.
        if !self.ring.not_empty().is_available() {
            self.ring.not_empty().signal()?;
        }
        Ok(())
    }

    /// Like [`Producer::try_insert`], but parks on the not-full semaphore when
    /// the queue has no room. `None` waits indefinitely; on timeout the last
    /// observed status, [`Error::NotReady`], is returned.
    pub fn try_wait_insert(
        &mut self,
        timeout: Option<Duration>,
        items: &[&dyn InsertItem],
    ) -> Result<()> {
        match self.try_insert(items) {
            Err(Error::NotReady) => {}
            other => return other,
        }
        debug!(
            "queue full ({} bytes free); parking on not-full",
            self.ring.free_bytes()
        );
        let deadline = timeout.map(|t| {
            self.clock
                .now()
                .saturating_add(u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
        });
        loop {
            let budget = match deadline {
                None => None,
                Some(deadline) => {
                    let now = self.clock.now();
                    if now >= deadline {
                        return Err(Error::NotReady);
                    }
                    Some(Duration::from_nanos(deadline - now))
                }
            };
            if !self.ring.not_full().wait(budget)? {
                return Err(Error::NotReady);
            }
            match self.try_insert(items) {
                Err(Error::NotReady) => continue,
                Ok(()) => {
                    // The wait consumed the edge token. If the queue still has
                    // room, put it back so the next insertion does not block
                    // on a transition that already happened. Only this thread
                    // inserts, so the token cannot be double-spent.
                    if !self.ring.is_full() && !self.ring.not_full().is_available() {
                        self.ring.not_full().signal()?;
                    }
                    return Ok(());
                }
                other => return other,
            }
        }
    }

    /// Allocates an out-of-band region on the queue's channel, optionally
    /// seeding it with `init`. The returned id can be sent through the queue
    /// for the consumer to look up.
    pub fn alloc_shared_memory(
        &self,
        len: usize,
        init: Option<&[u8]>,
    ) -> Result<(u32, Arc<SharedRegion>)> {
        if init.is_some_and(|init| init.len() > len) {
            return Err(Error::TooSmall);
        }
        let channel = self
            .ring
            .channel()
            .ok_or(Error::Fatal("channel detached from queue"))?;
        let (id, region) = channel.alloc_shared_memory(len).map_err(|_| Error::Oom)?;
        if let Some(init) = init {
            // SAFETY: region freshly allocated with at least len bytes.
            unsafe {
                ptr::copy_nonoverlapping(init.as_ptr(), region.base(), init.len());
            }
        }
        Ok((id, region))
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Occupied bytes as of the last cursor observation. May under-report
    /// concurrent removals, never concurrent insertions.
    pub fn used_bytes(&self) -> usize {
        self.ring.used_bytes()
    }

    pub fn free_bytes(&self) -> usize {
        self.ring.free_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Caller-reserved scratch bytes at the tail of the segment.
    pub fn reserved_region(&self) -> Option<(*mut u8, usize)> {
        self.ring.reserved_region()
    }

    pub(crate) fn ring(&self) -> &RingBase {
        &self.ring
    }
}
