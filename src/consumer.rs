//! Consumer endpoint.
//!
//! Mirror image of the producer: sole owner of the read cursor, acquire load
//! of the write cursor to see fully-published bytes, one release store of the
//! read cursor after the whole batch deserialized. A batch that fails part
//! way leaves the read cursor unmoved, so retryable failures really are
//! retryable.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{debug, error};

use crate::clock::{Clock, SystemClock};
use crate::marshal::{ConsumerView, RemoveItem};
use crate::ring::RingBase;
use crate::shmem::SharedRegion;
use crate::{Error, Result};

/// Read end of a queue. There is exactly one per queue; it is `Send` but
/// deliberately not `Clone`.
pub struct Consumer<C: Clock = SystemClock> {
    ring: RingBase,
    clock: C,
}

impl Consumer<SystemClock> {
    pub(crate) fn new(ring: RingBase) -> Self {
        Self {
            ring,
            clock: SystemClock,
        }
    }
}

impl<C: Clock> Consumer<C> {
    /// Replaces the timeout clock, mainly so tests can drive deadlines.
    pub fn with_clock<D: Clock>(self, clock: D) -> Consumer<D> {
        Consumer {
            ring: self.ring,
            clock,
        }
    }

    /// Attempts to remove a batch of items atomically: either every item is
    /// filled in or the queue is left untouched.
    ///
    /// Returns [`Error::TooSmall`] if the batch can never fit this queue,
    /// [`Error::NotReady`] if the bytes are not all there yet, and
    /// [`Error::Fatal`] if the shared state is corrupt.
    pub fn try_remove(&mut self, items: &mut [&mut dyn RemoveItem]) -> Result<()> {
        let read = self.ring.load_read(Ordering::Relaxed);
        let write = self.ring.load_write(Ordering::Acquire);
        if !self.ring.valid_state(read, write) {
            error!("queue cursors out of range: read={read}, write={write}");
            return Err(Error::Fatal("queue cursors out of range"));
        }

        let used = self.ring.used_bytes_at(read, write);
        let sizing = ConsumerView::new(&self.ring, read, used);
        let needed: usize = items.iter().map(|item| item.min_size(&sizing)).sum();
        if needed > self.ring.capacity() {
            return Err(Error::TooSmall);
        }
        if used < needed {
            return Err(Error::NotReady);
        }

        let mut view = ConsumerView::new(&self.ring, read, used);
        for item in items.iter_mut() {
            item.read(&mut view)?;
        }
        let consumed = self.ring.used_bytes_at(read, view.cursor());
        if consumed < needed {
            error!("batch consumed {consumed} bytes, expected at least {needed}");
            return Err(Error::Fatal("batch consumed less than its estimate"));
        }

        self.ring.store_read(view.cursor(), Ordering::Release);
        // The batch is committed; only now may its out-of-band regions leave
        // the channel table.
        view.commit_releases();
        // Edge-triggered wake-up; see the producer's insertion path.
        if !self.ring.not_full().is_available() {
            self.ring.not_full().signal()?;
        }
        Ok(())
    }

    /// Like [`Consumer::try_remove`], but parks on the not-empty semaphore
    /// when the queue has nothing to offer. `None` waits indefinitely; on
    /// timeout the last observed status, [`Error::NotReady`], is returned.
    pub fn try_wait_remove(
        &mut self,
        timeout: Option<Duration>,
        items: &mut [&mut dyn RemoveItem],
    ) -> Result<()> {
        match self.try_remove(items) {
            Err(Error::NotReady) => {}
            other => return other,
        }
        debug!(
            "queue has {} of the needed bytes; parking on not-empty",
            self.ring.used_bytes()
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
            if !self.ring.not_empty().wait(budget)? {
                return Err(Error::NotReady);
            }
            match self.try_remove(items) {
                Err(Error::NotReady) => continue,
                Ok(()) => {
                    // Give back the consumed edge token while data remains,
                    // so the next removal does not block on a transition that
                    // already happened.
                    if !self.ring.is_empty() && !self.ring.not_empty().is_available() {
                        self.ring.not_empty().signal()?;
                    }
                    return Ok(());
                }
                other => return other,
            }
        }
    }

    /// Resolves an out-of-band region id received through the queue.
    pub fn lookup_shared_memory(&self, id: u32) -> Result<Arc<SharedRegion>> {
        let channel = self
            .ring
            .channel()
            .ok_or(Error::Fatal("channel detached from queue"))?;
        channel
            .lookup_shared_memory(id)
            .ok_or(Error::Fatal("unknown shared memory id in queue"))
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Occupied bytes as of the last cursor observation. May under-report
    /// concurrent insertions, never concurrent removals.
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
