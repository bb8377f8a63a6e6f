//! Ring buffer over a pinned host region shared with the card.
//!
//! The producer side reserves contiguous (or wrap-split) spans of free
//! space; the consumer side claims available spans. Indices live on one
//! side only — the peer learns about progress through explicit head-update
//! frames on the wire, applied here via [`RingBuffer::update_head`] /
//! [`RingBuffer::update_tail_by`].
//!
//! `head == tail` is ambiguous, so fullness is an explicit bit: empty unless
//! `is_full` is set. The buffer is page-addressed — every acquire/release
//! unit is one host page, which gives the card a simple one-page-per-message
//! framing.

use std::sync::{Arc, MutexGuard};

use crate::backends::HostMemory;
use crate::error::{AxonError, Result};
use crate::sync::WaitQueue;

#[derive(Debug)]
struct RingState {
    head: u32,
    tail: u32,
    is_full: bool,
    invalid: bool,
}

/// Producer/consumer ring over shared memory.
#[derive(Debug)]
pub struct RingBuffer {
    mem: Arc<HostMemory>,
    size: u32,
    waitq: WaitQueue<RingState>,
}

impl RingState {
    fn free_bytes(&self, size: u32) -> u32 {
        if self.is_full {
            0
        } else if self.tail >= self.head {
            self.head + size - self.tail
        } else {
            self.head - self.tail
        }
    }

    fn avail_bytes(&self, size: u32) -> u32 {
        if self.is_full {
            size
        } else if self.head > self.tail {
            self.tail + size - self.head
        } else {
            self.tail - self.head
        }
    }
}

impl RingBuffer {
    /// Wrap a pinned region. The whole region is ring space.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(mem: Arc<HostMemory>) -> Self {
        let size = mem.len() as u32;
        Self {
            mem,
            size,
            waitq: WaitQueue::new(RingState {
                head: 0,
                tail: 0,
                is_full: false,
                invalid: false,
            }),
        }
    }

    /// Ring capacity in bytes.
    pub fn capacity(&self) -> u32 {
        self.size
    }

    /// Backing memory.
    pub fn mem(&self) -> &Arc<HostMemory> {
        &self.mem
    }

    /// Bytes currently free for the producer.
    pub fn free_bytes(&self) -> u32 {
        let g = self.waitq.lock();
        g.free_bytes(self.size)
    }

    /// Bytes currently available to the consumer.
    pub fn avail_bytes(&self) -> u32 {
        let g = self.waitq.lock();
        g.avail_bytes(self.size)
    }

    /// Reserve at least `n` free bytes, waiting until space exists, the
    /// ring is invalidated (`Io`), or the timeout elapses (`TimedOut`).
    pub fn lock_free_space(&self, n: u32, timeout_us: u32) -> Result<FreeSpan<'_>> {
        let size = self.size;
        let guard = self
            .waitq
            .wait_timeout_lock(timeout_us, |s| s.invalid || s.free_bytes(size) >= n)
            .ok_or(AxonError::TimedOut)?;
        if guard.invalid {
            return Err(AxonError::Io);
        }
        let cont = (size - guard.tail).min(n);
        Ok(FreeSpan {
            ring: self,
            offset: guard.tail,
            cont,
            guard,
        })
    }

    /// Claim at least `min` available bytes as a consumer. A zero timeout
    /// polls.
    pub fn lock_avail_space(&self, min: u32, timeout_us: u32) -> Result<AvailSpan<'_>> {
        let size = self.size;
        let guard = self
            .waitq
            .wait_timeout_lock(timeout_us, |s| s.invalid || s.avail_bytes(size) >= min)
            .ok_or(AxonError::TimedOut)?;
        if guard.invalid {
            return Err(AxonError::Io);
        }
        let avail = guard.avail_bytes(size);
        let cont = (size - guard.head).min(avail);
        Ok(AvailSpan {
            ring: self,
            offset: guard.head,
            avail,
            cont,
            guard,
        })
    }

    /// Apply consumer progress observed on the wire.
    pub fn update_head(&self, n: u32) {
        if n == 0 {
            return;
        }
        self.waitq.update_and_notify(|s| {
            s.head = (s.head + n) % self.size;
            s.is_full = false;
        });
    }

    /// Apply producer progress performed on our behalf (e.g. the card wrote
    /// a response page).
    pub fn update_tail_by(&self, n: u32) {
        if n == 0 {
            return;
        }
        self.waitq.update_and_notify(|s| {
            s.tail = (s.tail + n) % self.size;
            if s.tail == s.head {
                s.is_full = true;
            }
        });
    }

    /// Wake all waiters and make every later acquire fail. Channel teardown.
    pub fn set_invalid(&self) {
        self.waitq.update_and_notify(|s| s.invalid = true);
    }

    fn copy_in(&self, offset: u32, at: u32, src: &[u8]) {
        let start = (offset + at) % self.size;
        let first = src.len().min((self.size - start) as usize);
        self.mem.write(start as usize, &src[..first]);
        if first < src.len() {
            self.mem.write(0, &src[first..]);
        }
    }

    fn copy_out(&self, offset: u32, at: u32, dst: &mut [u8]) {
        let start = (offset + at) % self.size;
        let first = dst.len().min((self.size - start) as usize);
        self.mem.read(start as usize, &mut dst[..first]);
        if first < dst.len() {
            self.mem.read(0, &mut dst[first..]);
        }
    }
}

/// A reserved span of producer space. Holds the ring lock; dropping without
/// [`FreeSpan::commit`] releases the reservation without advancing.
#[derive(Debug)]
pub struct FreeSpan<'a> {
    ring: &'a RingBuffer,
    guard: MutexGuard<'a, RingState>,
    offset: u32,
    cont: u32,
}

impl FreeSpan<'_> {
    /// Length of the contiguous part of the span.
    pub fn contiguous_len(&self) -> u32 {
        self.cont
    }

    /// Byte offset of the span inside the ring.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Write `src` starting `at` bytes into the span, wrapping as needed.
    pub fn write(&self, at: u32, src: &[u8]) {
        self.ring.copy_in(self.offset, at, src);
    }

    /// Fill the span region with `byte`.
    pub fn fill(&self, at: u32, len: u32, byte: u8) {
        let buf = vec![byte; len as usize];
        self.ring.copy_in(self.offset, at, &buf);
    }

    /// Advance the producer tail by `n` bytes and wake waiters. `n == 0`
    /// abandons the reservation.
    pub fn commit(self, n: u32) {
        let ring = self.ring;
        let mut guard = self.guard;
        if n > 0 {
            guard.tail = (guard.tail + n) % ring.size;
            if guard.tail == guard.head {
                guard.is_full = true;
            }
        }
        drop(guard);
        ring.waitq.notify_all();
    }
}

/// A claimed span of consumer data. Holds the ring lock.
#[derive(Debug)]
pub struct AvailSpan<'a> {
    ring: &'a RingBuffer,
    guard: MutexGuard<'a, RingState>,
    offset: u32,
    avail: u32,
    cont: u32,
}

impl AvailSpan<'_> {
    /// Total available bytes at claim time.
    pub fn available(&self) -> u32 {
        self.avail
    }

    /// Length of the contiguous part of the span.
    pub fn contiguous_len(&self) -> u32 {
        self.cont
    }

    /// Read `dst.len()` bytes starting `at` bytes into the span.
    pub fn read(&self, at: u32, dst: &mut [u8]) {
        self.ring.copy_out(self.offset, at, dst);
    }

    /// Advance the consumer head by `n` bytes and wake waiters.
    pub fn commit(self, n: u32) {
        let ring = self.ring;
        let mut guard = self.guard;
        if n > 0 {
            guard.head = (guard.head + n) % ring.size;
            guard.is_full = false;
        }
        drop(guard);
        ring.waitq.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(pages: usize) -> RingBuffer {
        RingBuffer::new(Arc::new(HostMemory::alloc(pages * 64)))
    }

    #[test]
    fn free_plus_avail_is_capacity() {
        let ring = ring_of(4);
        assert_eq!(ring.free_bytes() + ring.avail_bytes(), ring.capacity());
        let span = ring.lock_free_space(64, 0).unwrap();
        span.commit(64);
        assert_eq!(ring.free_bytes() + ring.avail_bytes(), ring.capacity());
        assert_eq!(ring.avail_bytes(), 64);
    }

    #[test]
    fn full_is_distinguished_from_empty() {
        let ring = ring_of(2);
        assert_eq!(ring.avail_bytes(), 0);
        let span = ring.lock_free_space(128, 0).unwrap();
        span.commit(128);
        // head == tail but the full bit keeps avail == capacity.
        assert_eq!(ring.avail_bytes(), 128);
        assert_eq!(ring.free_bytes(), 0);
        ring.update_head(128);
        assert_eq!(ring.free_bytes(), 128);
    }

    #[test]
    fn wraparound_yields_two_spans() {
        let ring = ring_of(4); // 256 bytes
        ring.lock_free_space(192, 0).unwrap().commit(192);
        ring.update_head(192);
        // tail at 192: a 128-byte reservation wraps.
        let span = ring.lock_free_space(128, 0).unwrap();
        assert_eq!(span.contiguous_len(), 64);
        let data: Vec<u8> = (0..128u8).collect();
        span.write(0, &data);
        span.commit(128);

        let avail = ring.lock_avail_space(128, 0).unwrap();
        let mut out = vec![0u8; 128];
        avail.read(0, &mut out);
        avail.commit(128);
        assert_eq!(out, data);
    }

    #[test]
    fn unlock_advances_by_exactly_n() {
        let ring = ring_of(4);
        for _ in 0..3 {
            let before = ring.free_bytes();
            ring.lock_free_space(64, 0).unwrap().commit(64);
            assert_eq!(ring.free_bytes(), before - 64);
        }
    }

    #[test]
    fn abandoned_reservation_leaves_state_untouched() {
        let ring = ring_of(2);
        let span = ring.lock_free_space(64, 0).unwrap();
        span.commit(0);
        assert_eq!(ring.avail_bytes(), 0);
    }

    #[test]
    fn invalid_ring_fails_producers() {
        let ring = ring_of(2);
        ring.set_invalid();
        assert_eq!(ring.lock_free_space(64, 0).unwrap_err(), AxonError::Io);
    }

    #[test]
    fn producer_times_out_when_full() {
        let ring = ring_of(2);
        ring.lock_free_space(128, 0).unwrap().commit(128);
        assert_eq!(
            ring.lock_free_space(64, 1000).unwrap_err(),
            AxonError::TimedOut
        );
    }
}
