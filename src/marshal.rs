//! Serialization across the ring.
//!
//! Values enter and leave the queue through a pair of cursor views. A
//! [`ProducerView`] copies little-endian bytes into the circular buffer at a
//! local write offset; a [`ConsumerView`] copies them back out at a local read
//! offset. Neither view touches the shared cursors — the owning endpoint
//! publishes the final position in one atomic store after the whole batch has
//! been serialized, so a failed batch leaves the queue untouched.
//!
//! Types opt in by implementing [`QueueParam`]. Oversized payloads (more than
//! 1/16th of the queue capacity) are shipped out-of-band: the bytes land in a
//! fresh shared region allocated from the channel and only the region id goes
//! through the ring. Cross-process setups must broker those regions to the
//! consumer's channel (`register_shared_memory`); the in-process `MemChannel`
//! resolves them directly.

use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;

use crate::ring::RingBase;
use crate::shmem::SharedRegion;
use crate::{Error, Result};

/// Queue geometry visible to serializers on either end.
pub trait QueueView {
    /// Usable byte capacity of the queue.
    fn capacity(&self) -> usize;

    /// Whether a payload of `len` bytes is too large to ship inline. Large
    /// payloads would otherwise dominate the ring and stall small items
    /// behind them.
    fn needs_shared_memory(&self, len: usize) -> bool {
        len > self.capacity() / 16
    }
}

/// Write-side cursor view over the circular buffer.
///
/// Tracks a local write offset and the byte budget reserved for the current
/// batch. Exceeding the budget means a [`QueueParam::min_size`] lied about the
/// serialized size, which is unrecoverable.
pub struct ProducerView<'a> {
    ring: &'a RingBase,
    cursor: usize,
    remaining: usize,
    allocations: Vec<u32>,
}

impl<'a> ProducerView<'a> {
    pub(crate) fn new(ring: &'a RingBase, cursor: usize, budget: usize) -> Self {
        Self {
            ring,
            cursor,
            remaining: budget,
            allocations: Vec::new(),
        }
    }

    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }

    /// Drops every region this view allocated back out of the channel table.
    /// Called by the endpoint when the batch does not commit; a committed
    /// batch hands the regions over to the consumer instead.
    pub(crate) fn discard_allocations(mut self) {
        if let Some(channel) = self.ring.channel() {
            for id in self.allocations.drain(..) {
                channel.release_shared_memory(id);
            }
        }
    }

    /// Copies `bytes` into the ring at the local cursor, wrapping at the end
    /// of the buffer.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.remaining {
            return Err(Error::Fatal("serializer overran its reserved bytes"));
        }
        let buffer_size = self.ring.buffer_size();
        let base = self.ring.data_ptr();
        let first = bytes.len().min(buffer_size - self.cursor);
        // SAFETY: cursor < buffer_size and both copies stay within the
        // payload region; the consumer cannot touch these bytes until the
        // write cursor is published.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(self.cursor), first);
            if first < bytes.len() {
                ptr::copy_nonoverlapping(bytes.as_ptr().add(first), base, bytes.len() - first);
            }
        }
        self.cursor = (self.cursor + bytes.len()) % buffer_size;
        self.remaining -= bytes.len();
        Ok(())
    }

    /// Allocates an out-of-band region from the owning channel, returning the
    /// id that identifies it to the consumer. Allocation failure surfaces as
    /// [`Error::Oom`]. The allocation is tied to the current batch: it is
    /// released again if the batch fails to commit.
    pub fn alloc_shared_memory(&mut self, len: usize) -> Result<(u32, Arc<SharedRegion>)> {
        let channel = self
            .ring
            .channel()
            .ok_or(Error::Fatal("channel detached from queue"))?;
        let (id, region) = channel.alloc_shared_memory(len).map_err(|_| Error::Oom)?;
        self.allocations.push(id);
        Ok((id, region))
    }
}

impl QueueView for ProducerView<'_> {
    fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// Read-side cursor view over the circular buffer.
///
/// Tracks a local read offset and the bytes known to be available. Running
/// past them means the item is not fully serialized yet, which the consumer
/// reports as a retryable [`Error::NotReady`].
pub struct ConsumerView<'a> {
    ring: &'a RingBase,
    cursor: usize,
    available: usize,
    released: Vec<u32>,
}

impl<'a> ConsumerView<'a> {
    pub(crate) fn new(ring: &'a RingBase, cursor: usize, available: usize) -> Self {
        Self {
            ring,
            cursor,
            available,
            released: Vec::new(),
        }
    }

    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }

    /// Performs the releases queued by [`ConsumerView::release_shared_memory`].
    /// Called by the endpoint only after the read cursor commits the batch; a
    /// batch that fails leaves every region in the table so a retry can find
    /// it again.
    pub(crate) fn commit_releases(mut self) {
        if let Some(channel) = self.ring.channel() {
            for id in self.released.drain(..) {
                channel.release_shared_memory(id);
            }
        }
    }

    /// Copies bytes out of the ring at the local cursor into `out`, wrapping
    /// at the end of the buffer.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        if out.len() > self.available {
            return Err(Error::NotReady);
        }
        let buffer_size = self.ring.buffer_size();
        let base = self.ring.data_ptr();
        let first = out.len().min(buffer_size - self.cursor);
        // SAFETY: cursor < buffer_size; the producer's release store of the
        // write cursor happened-before our acquire load, so these bytes are
        // fully written.
        unsafe {
            ptr::copy_nonoverlapping(base.add(self.cursor), out.as_mut_ptr(), first);
            if first < out.len() {
                ptr::copy_nonoverlapping(base, out.as_mut_ptr().add(first), out.len() - first);
            }
        }
        self.cursor = (self.cursor + out.len()) % buffer_size;
        self.available -= out.len();
        Ok(())
    }

    /// Resolves an out-of-band region id received through the ring.
    pub fn lookup_shared_memory(&self, id: u32) -> Result<Arc<SharedRegion>> {
        let channel = self
            .ring
            .channel()
            .ok_or(Error::Fatal("channel detached from queue"))?;
        channel
            .lookup_shared_memory(id)
            .ok_or(Error::Fatal("unknown shared memory id in queue"))
    }

    /// Marks the out-of-band region as consumed. The release is deferred
    /// until the whole batch commits, so a failed batch can still be retried.
    pub fn release_shared_memory(&mut self, id: u32) {
        self.released.push(id);
    }
}

impl QueueView for ConsumerView<'_> {
    fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// A value that can travel through the queue.
///
/// `min_size` must return the exact number of ring bytes `write` will emit
/// for `arg`; it is called with `None` on the consumer side, where it must
/// return the smallest size any value of the type can occupy.
pub trait QueueParam: Sized {
    fn min_size(view: &dyn QueueView, arg: Option<&Self>) -> usize;
    fn write(view: &mut ProducerView<'_>, arg: &Self) -> Result<()>;
    fn read(view: &mut ConsumerView<'_>) -> Result<Self>;
}

macro_rules! fixed_width_param {
    ($($ty:ty),* $(,)?) => {
        $(
            impl QueueParam for $ty {
                fn min_size(_view: &dyn QueueView, _arg: Option<&Self>) -> usize {
                    std::mem::size_of::<$ty>()
                }

                fn write(view: &mut ProducerView<'_>, arg: &Self) -> Result<()> {
                    view.write_bytes(&arg.to_le_bytes())
                }

                fn read(view: &mut ConsumerView<'_>) -> Result<Self> {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    view.read_bytes(&mut buf)?;
                    Ok(<$ty>::from_le_bytes(buf))
                }
            }
        )*
    };
}

fixed_width_param!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl QueueParam for bool {
    fn min_size(_view: &dyn QueueView, _arg: Option<&Self>) -> usize {
        1
    }

    fn write(view: &mut ProducerView<'_>, arg: &Self) -> Result<()> {
        view.write_bytes(&[u8::from(*arg)])
    }

    fn read(view: &mut ConsumerView<'_>) -> Result<Self> {
        let mut buf = [0u8; 1];
        view.read_bytes(&mut buf)?;
        Ok(buf[0] != 0)
    }
}

// Byte payloads ship inline as `u32 len + bytes` while small, and as
// `u32 len + u32 region id` once the length crosses the shared-memory
// threshold.

fn byte_payload_size(view: &dyn QueueView, len: Option<usize>) -> usize {
    match len {
        Some(len) if !view.needs_shared_memory(len) => 4 + len,
        Some(_) => 4 + 4,
        // Removal side: a length header is always present.
        None => 4,
    }
}

fn write_byte_payload(view: &mut ProducerView<'_>, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::Unsupported("payload exceeds u32 length"))?;
    view.write_bytes(&len.to_le_bytes())?;
    if !view.needs_shared_memory(bytes.len()) {
        return view.write_bytes(bytes);
    }
    let (id, region) = view.alloc_shared_memory(bytes.len())?;
    // SAFETY: the region was just allocated with at least bytes.len() bytes
    // and is not yet visible to the consumer.
    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr(), region.base(), bytes.len());
    }
    view.write_bytes(&id.to_le_bytes())
}

fn read_byte_payload(view: &mut ConsumerView<'_>) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    view.read_bytes(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut out = vec![0u8; len];
    if !view.needs_shared_memory(len) {
        view.read_bytes(&mut out)?;
        return Ok(out);
    }
    let mut id_buf = [0u8; 4];
    view.read_bytes(&mut id_buf)?;
    let id = u32::from_le_bytes(id_buf);
    let region = view.lookup_shared_memory(id)?;
    if region.len() < len {
        return Err(Error::Fatal("shared region shorter than payload"));
    }
    // SAFETY: the producer fully populated the region before publishing the
    // id through the ring.
    unsafe {
        ptr::copy_nonoverlapping(region.base(), out.as_mut_ptr(), len);
    }
    view.release_shared_memory(id);
    Ok(out)
}

impl QueueParam for Vec<u8> {
    fn min_size(view: &dyn QueueView, arg: Option<&Self>) -> usize {
        byte_payload_size(view, arg.map(|bytes| bytes.len()))
    }

    fn write(view: &mut ProducerView<'_>, arg: &Self) -> Result<()> {
        write_byte_payload(view, arg)
    }

    fn read(view: &mut ConsumerView<'_>) -> Result<Self> {
        read_byte_payload(view)
    }
}

impl QueueParam for String {
    fn min_size(view: &dyn QueueView, arg: Option<&Self>) -> usize {
        byte_payload_size(view, arg.map(|s| s.len()))
    }

    fn write(view: &mut ProducerView<'_>, arg: &Self) -> Result<()> {
        write_byte_payload(view, arg.as_bytes())
    }

    fn read(view: &mut ConsumerView<'_>) -> Result<Self> {
        String::from_utf8(read_byte_payload(view)?)
            .map_err(|_| Error::Fatal("string payload is not valid utf-8"))
    }
}

/// Type-erased insertable item. Lets a single `try_insert` call carry a
/// heterogeneous batch without generics at the endpoint API.
pub trait InsertItem {
    fn min_size(&self, view: &ProducerView<'_>) -> usize;
    fn write(&self, view: &mut ProducerView<'_>) -> Result<()>;
}

impl<T: QueueParam> InsertItem for T {
    fn min_size(&self, view: &ProducerView<'_>) -> usize {
        T::min_size(view, Some(self))
    }

    fn write(&self, view: &mut ProducerView<'_>) -> Result<()> {
        T::write(view, self)
    }
}

/// Borrowed byte slices insert with the same wire form as `Vec<u8>`, saving
/// the copy into an owned buffer on the producer side.
impl InsertItem for [u8] {
    fn min_size(&self, view: &ProducerView<'_>) -> usize {
        byte_payload_size(view, Some(self.len()))
    }

    fn write(&self, view: &mut ProducerView<'_>) -> Result<()> {
        write_byte_payload(view, self)
    }
}

/// Trait-object coercion needs a `Sized` source, so borrowed slices go
/// through this reference-level impl to reach `&dyn InsertItem`.
impl InsertItem for &[u8] {
    fn min_size(&self, view: &ProducerView<'_>) -> usize {
        <[u8] as InsertItem>::min_size(self, view)
    }

    fn write(&self, view: &mut ProducerView<'_>) -> Result<()> {
        <[u8] as InsertItem>::write(self, view)
    }
}

/// Type-erased removable item, filled in place on a successful batch.
pub trait RemoveItem {
    fn min_size(&self, view: &ConsumerView<'_>) -> usize;
    fn read(&mut self, view: &mut ConsumerView<'_>) -> Result<()>;
}

impl<T: QueueParam> RemoveItem for T {
    fn min_size(&self, view: &ConsumerView<'_>) -> usize {
        T::min_size(view, None)
    }

    fn read(&mut self, view: &mut ConsumerView<'_>) -> Result<()> {
        *self = T::read(view)?;
        Ok(())
    }
}

/// Removes a value of type `T` from the queue and discards it, without
/// requiring a destination.
pub struct Skip<T: QueueParam>(PhantomData<T>);

impl<T: QueueParam> Skip<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: QueueParam> Default for Skip<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QueueParam> RemoveItem for Skip<T> {
    fn min_size(&self, view: &ConsumerView<'_>) -> usize {
        T::min_size(view, None)
    }

    fn read(&mut self, view: &mut ConsumerView<'_>) -> Result<()> {
        T::read(view).map(drop)
    }
}
