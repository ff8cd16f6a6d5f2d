//! Endpoint transfer between processes.
//!
//! An endpoint is moved by flattening its identity into an
//! [`EndpointDescriptor`] — channel id, capacity, the shared segment handle
//! and both semaphore handles — shipping those bytes over any host transport,
//! and rebuilding the endpoint on the other side. Rebinding attaches to the
//! live cursor state; a transferred endpoint resumes exactly where the
//! original stopped, in-flight bytes included.
//!
//! The exporting process must keep its endpoint alive until the peer has
//! imported the descriptor (the handles reference descriptors in the
//! exporter's fd table) and must not use it afterwards: each side of the
//! queue has exactly one owner.

use std::sync::Arc;

use crate::channel::Channel;
use crate::clock::Clock;
use crate::consumer::Consumer;
use crate::producer::Producer;
use crate::ring::RingBase;
use crate::sem::{SemHandle, Semaphore};
use crate::shmem::{SharedRegion, ShmemHandle};
use crate::{Error, Result};

/// Serialized length of a descriptor, checksum included.
pub const DESCRIPTOR_LEN: usize = 48;

/// Flattened identity of one queue endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub channel_id: i32,
    pub capacity: u64,
    pub shmem: ShmemHandle,
    pub not_empty: SemHandle,
    pub not_full: SemHandle,
}

impl EndpointDescriptor {
    /// Encodes the descriptor into its fixed little-endian wire form with a
    /// crc32 trailer.
    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut buf = [0u8; DESCRIPTOR_LEN];
        buf[0..4].copy_from_slice(&self.channel_id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.capacity.to_le_bytes());
        buf[12..16].copy_from_slice(&self.shmem.pid.to_le_bytes());
        buf[16..20].copy_from_slice(&self.shmem.fd.to_le_bytes());
        buf[20..28].copy_from_slice(&self.shmem.len.to_le_bytes());
        buf[28..32].copy_from_slice(&self.not_empty.pid.to_le_bytes());
        buf[32..36].copy_from_slice(&self.not_empty.fd.to_le_bytes());
        buf[36..40].copy_from_slice(&self.not_full.pid.to_le_bytes());
        buf[40..44].copy_from_slice(&self.not_full.fd.to_le_bytes());
        let crc = crc32fast::hash(&buf[..44]);
        buf[44..48].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes and validates a descriptor. A bad checksum or an invalid
    /// handle is a hard failure: acting on a corrupt descriptor would attach
    /// to the wrong (or no) kernel object.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != DESCRIPTOR_LEN {
            return Err(Error::Fatal("endpoint descriptor has wrong length"));
        }
        let crc = u32::from_le_bytes(buf[44..48].try_into().expect("slice length"));
        if crc32fast::hash(&buf[..44]) != crc {
            return Err(Error::Fatal("endpoint descriptor checksum mismatch"));
        }
        let descriptor = Self {
            channel_id: i32::from_le_bytes(buf[0..4].try_into().expect("slice length")),
            capacity: u64::from_le_bytes(buf[4..12].try_into().expect("slice length")),
            shmem: ShmemHandle {
                pid: u32::from_le_bytes(buf[12..16].try_into().expect("slice length")),
                fd: i32::from_le_bytes(buf[16..20].try_into().expect("slice length")),
                len: u64::from_le_bytes(buf[20..28].try_into().expect("slice length")),
            },
            not_empty: SemHandle {
                pid: u32::from_le_bytes(buf[28..32].try_into().expect("slice length")),
                fd: i32::from_le_bytes(buf[32..36].try_into().expect("slice length")),
            },
            not_full: SemHandle {
                pid: u32::from_le_bytes(buf[36..40].try_into().expect("slice length")),
                fd: i32::from_le_bytes(buf[40..44].try_into().expect("slice length")),
            },
        };
        if descriptor.capacity == 0
            || !descriptor.shmem.is_valid()
            || !descriptor.not_empty.is_valid()
            || !descriptor.not_full.is_valid()
        {
            return Err(Error::Fatal("endpoint descriptor carries invalid handles"));
        }
        Ok(descriptor)
    }
}

fn export_ring(ring: &RingBase) -> Result<EndpointDescriptor> {
    Ok(EndpointDescriptor {
        channel_id: ring.channel_id(),
        capacity: ring.capacity() as u64,
        shmem: ring.region().handle()?,
        not_empty: ring.not_empty().share_handle()?,
        not_full: ring.not_full().share_handle()?,
    })
}

fn import_ring<Ch: Channel + 'static>(
    descriptor: &EndpointDescriptor,
    channel: &Arc<Ch>,
) -> Result<RingBase> {
    if channel.id() != descriptor.channel_id {
        return Err(Error::Fatal("endpoint descriptor from a different channel"));
    }
    let capacity = usize::try_from(descriptor.capacity)
        .map_err(|_| Error::Unsupported("queue capacity exceeds addressable range"))?;
    let region = Arc::new(SharedRegion::from_handle(&descriptor.shmem)?);
    let not_empty = Semaphore::from_handle(descriptor.not_empty)?;
    let not_full = Semaphore::from_handle(descriptor.not_full)?;
    let channel: Arc<dyn Channel> = channel.clone();
    // No cursor initialization: the segment carries live queue state.
    RingBase::bind(region, &channel, capacity, not_empty, not_full)
}

impl<C: Clock> Producer<C> {
    /// Flattens this producer for transfer to a peer process.
    pub fn export(&self) -> Result<EndpointDescriptor> {
        export_ring(self.ring())
    }
}

impl Producer {
    /// Rebuilds a transferred producer on `channel`, attaching to the live
    /// queue state.
    pub fn from_descriptor<Ch: Channel + 'static>(
        descriptor: &EndpointDescriptor,
        channel: &Arc<Ch>,
    ) -> Result<Producer> {
        Ok(Producer::new(import_ring(descriptor, channel)?))
    }
}

impl<C: Clock> Consumer<C> {
    /// Flattens this consumer for transfer to a peer process.
    pub fn export(&self) -> Result<EndpointDescriptor> {
        export_ring(self.ring())
    }
}

impl Consumer {
    /// Rebuilds a transferred consumer on `channel`, attaching to the live
    /// queue state.
    pub fn from_descriptor<Ch: Channel + 'static>(
        descriptor: &EndpointDescriptor,
        channel: &Arc<Ch>,
    ) -> Result<Consumer> {
        Ok(Consumer::new(import_ring(descriptor, channel)?))
    }
}
