//! Segment geometry.
//!
//! A queue segment is laid out as:
//!
//! ```text
//! | payload bytes (capacity + 1) | pad | read cursor | pad | write cursor | pad | reserved |
//! ```
//!
//! The payload region needs one byte more than the requested capacity: with
//! one slot permanently unusable, `read == write` always means "empty" and
//! never "full", so no separate occupancy flag is shared between processes.
//! Each cursor sits on its own cache line to keep the producer and consumer
//! from false-sharing. All positions are byte offsets from the segment base;
//! mappings are page-aligned in every process, so offsets computed on one side
//! are valid on the other.

use std::mem::size_of;

/// Assumed cache line size. Correct for effectively all current x86-64 and
/// aarch64 parts; a wrong guess only costs efficiency, not correctness.
pub const CACHE_LINE: usize = 64;

const _: () = assert!(CACHE_LINE.is_power_of_two());
const _: () = assert!(CACHE_LINE >= size_of::<usize>());

/// Worst-case bytes of segment header: up to `CACHE_LINE - 1` bytes to align
/// the read cursor, then one full line for each cursor.
pub const fn max_header_size() -> usize {
    (CACHE_LINE - 1) + CACHE_LINE + CACHE_LINE
}

/// Byte offsets of the cursor block and reserved region within a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderLayout {
    /// Offset of the read cursor. First cache-line boundary at or after the
    /// payload region.
    pub read: usize,
    /// Offset of the write cursor, one cache line after `read`.
    pub write: usize,
    /// Offset of the caller-reserved region.
    pub reserved: usize,
    /// Bytes between `reserved` and the end of the segment.
    pub reserved_len: usize,
}

/// Computes the cursor and reserved-region offsets for a queue of the given
/// usable `capacity` inside a segment of `segment_len` bytes.
///
/// Pure arithmetic; the factory is responsible for making `segment_len` large
/// enough (`capacity + 1 + max_header_size()` at minimum).
pub fn header_layout(capacity: usize, segment_len: usize) -> HeaderLayout {
    let buffer_size = capacity + 1;
    let read = align_up(buffer_size, CACHE_LINE);
    let write = read + CACHE_LINE;
    let reserved = write + CACHE_LINE;
    let reserved_len = segment_len.saturating_sub(reserved);
    HeaderLayout {
        read,
        write,
        reserved,
        reserved_len,
    }
}

#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_header_covers_any_capacity() {
        for capacity in [0usize, 1, 7, 63, 64, 65, 255, 4096] {
            let segment_len = capacity + 1 + max_header_size();
            let layout = header_layout(capacity, segment_len);
            assert!(layout.read >= capacity + 1);
            assert_eq!(layout.read % CACHE_LINE, 0);
            assert_eq!(layout.write, layout.read + CACHE_LINE);
            assert_eq!(layout.reserved, layout.write + CACHE_LINE);
            // The worst-case header budget is never exceeded.
            assert!(layout.reserved <= capacity + 1 + max_header_size());
        }
    }

    #[test]
    fn reserved_region_receives_extra_bytes() {
        let capacity = 100;
        let extra = 32;
        let segment_len = capacity + 1 + max_header_size() + extra;
        let layout = header_layout(capacity, segment_len);
        assert!(layout.reserved_len >= extra);
    }

    #[test]
    fn align_up_is_identity_on_boundaries() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(1, 64), 64);
    }
}
