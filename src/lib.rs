//! Cross-process single-producer/single-consumer byte queue over shared
//! memory.
//!
//! A queue is one shared segment holding a circular byte buffer and a pair of
//! cursors, plus two cross-process semaphores for blocking waits. Exactly one
//! process inserts and exactly one removes; each endpoint owns its cursor and
//! only ever reads the other, which keeps the hot path to two atomic loads
//! and one atomic store per batch. Endpoints can be flattened into
//! descriptors and moved to another process without disturbing in-flight
//! data.

pub mod channel;
pub mod clock;
pub mod consumer;
pub mod error;
pub mod layout;
pub mod marshal;
pub mod producer;
pub mod queue;
pub mod sem;
pub mod shmem;
pub mod transfer;

pub(crate) mod ring;

pub use channel::{Channel, MemChannel};
pub use clock::{Clock, QuantaClock, SystemClock};
pub use consumer::Consumer;
pub use error::{Error, Result};
pub use marshal::{ConsumerView, InsertItem, ProducerView, QueueParam, QueueView, RemoveItem, Skip};
pub use producer::Producer;
pub use queue::ProducerConsumerQueue;
pub use sem::{SemHandle, Semaphore};
pub use shmem::{SharedRegion, ShmemHandle};
pub use transfer::{EndpointDescriptor, DESCRIPTOR_LEN};
