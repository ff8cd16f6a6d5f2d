//! Queue factory.
//!
//! Builds both endpoints of a queue over one freshly allocated shared
//! segment: payload bytes, the two cursors on their own cache lines, and any
//! caller-reserved scratch space, sized by [`crate::layout::header_layout`].
//! The cursors are zeroed here, exactly once; every later bind (including a
//! descriptor import in a peer process) attaches to live state and must not
//! touch them.

use std::sync::Arc;

use log::debug;

use crate::channel::Channel;
use crate::consumer::Consumer;
use crate::layout::max_header_size;
use crate::producer::Producer;
use crate::ring::RingBase;
use crate::sem::Semaphore;
use crate::{Error, Result};

/// A freshly created queue, holding both endpoints until they are claimed.
pub struct ProducerConsumerQueue {
    producer: Option<Producer>,
    consumer: Option<Consumer>,
}

impl ProducerConsumerQueue {
    /// Creates a queue with `capacity` usable payload bytes plus
    /// `extra_reserved` caller scratch bytes at the tail of the segment.
    ///
    /// The segment is allocated from `channel`, which both endpoints will
    /// also use for out-of-band payloads.
    pub fn create<Ch: Channel + 'static>(
        channel: &Arc<Ch>,
        capacity: usize,
        extra_reserved: usize,
    ) -> Result<Self> {
        let channel: Arc<dyn Channel> = channel.clone();
        if capacity == 0 {
            return Err(Error::Unsupported("queue capacity must be non-zero"));
        }
        let total = capacity + 1 + max_header_size() + extra_reserved;
        let (segment_id, region) = channel.alloc_shared_memory(total)?;
        debug!(
            "created queue segment {segment_id}: capacity={capacity}, total={total} bytes"
        );

        // The not-empty semaphore starts unsignaled (nothing to read) and the
        // not-full semaphore starts signaled (everything writable).
        let not_empty = Semaphore::create(0)?;
        let not_full = Semaphore::create(1)?;

        let mut producer_ring = RingBase::bind(
            Arc::clone(&region),
            &channel,
            capacity,
            not_empty.clone(),
            not_full.clone(),
        )?;
        producer_ring.init_cursors();
        let mut consumer_ring = RingBase::bind(region, &channel, capacity, not_empty, not_full)?;

        // Hide any slack between what the caller asked for and what the
        // allocator handed back.
        producer_ring.set_reserved_len(extra_reserved);
        consumer_ring.set_reserved_len(extra_reserved);

        Ok(Self {
            producer: Some(Producer::new(producer_ring)),
            consumer: Some(Consumer::new(consumer_ring)),
        })
    }

    /// Claims the write end. Each endpoint can be taken once.
    pub fn take_producer(&mut self) -> Option<Producer> {
        self.producer.take()
    }

    /// Claims the read end. Each endpoint can be taken once.
    pub fn take_consumer(&mut self) -> Option<Consumer> {
        self.consumer.take()
    }

    /// Claims both ends at once.
    pub fn split(self) -> (Producer, Consumer) {
        match (self.producer, self.consumer) {
            (Some(producer), Some(consumer)) => (producer, consumer),
            // Both fields are populated at construction and only drained by
            // take_*, which borrows; split owns self.
            _ => unreachable!("endpoint taken before split"),
        }
    }
}
