//! Per-producer lock-free byte pipe.
//!
//! Each producing thread owns one [`StagingBuffer`]: a circular region that
//! carries variable-sized binary records from exactly one producer to the
//! single consumer thread, without locks. The producer advances
//! `producer_pos`, the consumer advances `consumer_pos`, and `end_of_data`
//! marks the tail of valid bytes whenever the producer wraps back to the
//! start. Records never straddle the wrap point: a reservation is always one
//! contiguous range.
//!
//! The buffer outlives its producing thread. A [`DestructGuard`] attached to
//! the thread marks the buffer at thread exit; the consumer frees it once it
//! is marked *and* fully drained.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Single-producer single-consumer circular byte pipe.
///
/// All three shared positions are byte offsets into `storage`. Only the
/// producer stores `producer_pos` and `end_of_data` (release ordering), only
/// the consumer stores `consumer_pos` (release ordering); each side reads
/// the other's offset with acquire ordering. No other fences are needed.
pub struct StagingBuffer {
    storage: Box<[UnsafeCell<u8>]>,
    capacity: usize,

    /// Next write offset. Producer-owned.
    producer_pos: AtomicUsize,
    /// One past the last valid byte when the producer has wrapped and the
    /// consumer has not. Producer-owned.
    end_of_data: AtomicUsize,
    /// Next read offset. Consumer-owned.
    consumer_pos: AtomicUsize,

    /// Producer-private cache of free bytes; refreshed from `consumer_pos`
    /// only when it runs out.
    available_bytes: Cell<usize>,

    buffer_id: u32,
    should_be_destructed: AtomicBool,
}

// SAFETY: the SPSC discipline is the synchronization story. `storage` bytes
// are only written inside a region the producer has reserved and not yet
// committed, and only read inside a region the consumer has peeked; the two
// regions are disjoint by construction of the three offsets, whose
// publication uses release/acquire ordering. `available_bytes` is touched by
// the producer alone.
unsafe impl Send for StagingBuffer {}
unsafe impl Sync for StagingBuffer {}

impl StagingBuffer {
    pub fn new(buffer_id: u32, capacity: usize) -> StagingBuffer {
        let storage: Box<[UnsafeCell<u8>]> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
        StagingBuffer {
            storage,
            capacity,
            producer_pos: AtomicUsize::new(0),
            end_of_data: AtomicUsize::new(capacity),
            consumer_pos: AtomicUsize::new(0),
            available_bytes: Cell::new(capacity),
            buffer_id,
            should_be_destructed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.buffer_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.capacity);
        // UnsafeCell<u8> is repr(transparent) over u8.
        unsafe { (self.storage.as_ptr() as *mut u8).add(offset) }
    }

    /// Reserves `n` contiguous writable bytes for the producer.
    ///
    /// In blocking mode this spins until the consumer frees enough space and
    /// never returns `None`; `n` must then be less than the capacity or the
    /// spin can never succeed. In non-blocking mode an unsatisfiable
    /// reservation returns `None` and the caller drops the record.
    ///
    /// Producer-side only.
    pub fn reserve(&self, n: usize, blocking: bool) -> Option<*mut u8> {
        debug_assert!(n < self.capacity || !blocking);

        if n < self.available_bytes.get() {
            return Some(self.ptr_at(self.producer_pos.load(Ordering::Relaxed)));
        }
        self.reserve_slow(n, blocking)
    }

    fn reserve_slow(&self, n: usize, blocking: bool) -> Option<*mut u8> {
        loop {
            let produce = self.producer_pos.load(Ordering::Relaxed);
            let cached_consumer = self.consumer_pos.load(Ordering::Acquire);

            if cached_consumer <= produce {
                // Consumer is behind us in linear order; the free region is
                // the tail, unless we wrap.
                let tail = self.capacity - produce;
                if tail > n {
                    self.available_bytes.set(tail);
                    return Some(self.ptr_at(produce));
                }

                // Tail too small. Publish the wrap so the consumer knows
                // where valid data ends, then start over from offset 0,
                // unless the consumer still sits at the start.
                self.end_of_data.store(produce, Ordering::Release);
                if cached_consumer != 0 {
                    self.producer_pos.store(0, Ordering::Release);
                    self.available_bytes.set(cached_consumer);
                } else {
                    self.available_bytes.set(tail);
                }
            } else {
                // Wrapped: writable bytes run up to the consumer.
                self.available_bytes.set(cached_consumer - produce);
            }

            if self.available_bytes.get() > n {
                return Some(self.ptr_at(self.producer_pos.load(Ordering::Relaxed)));
            }
            if !blocking {
                return None;
            }
            std::hint::spin_loop();
        }
    }

    /// Publishes `n` freshly written bytes. The write must lie inside the
    /// last reservation.
    ///
    /// Producer-side only.
    pub fn commit(&self, n: usize) {
        debug_assert!(n < self.available_bytes.get() || n == 0);
        self.available_bytes.set(self.available_bytes.get() - n);
        let produce = self.producer_pos.load(Ordering::Relaxed);
        self.producer_pos.store(produce + n, Ordering::Release);
    }

    /// Returns the longest contiguous readable slice. When the producer has
    /// wrapped, the tail up to `end_of_data` is returned first; once that is
    /// drained the read offset snaps back to the start.
    ///
    /// Consumer-side only.
    pub fn peek(&self) -> (*const u8, usize) {
        let cached_producer = self.producer_pos.load(Ordering::Acquire);
        let mut consumer = self.consumer_pos.load(Ordering::Relaxed);

        if cached_producer < consumer {
            let available = self.end_of_data.load(Ordering::Acquire) - consumer;
            if available > 0 {
                return (self.ptr_at(consumer), available);
            }
            self.consumer_pos.store(0, Ordering::Release);
            consumer = 0;
        }

        (self.ptr_at(consumer), cached_producer - consumer)
    }

    /// Releases `n` read bytes back to the producer.
    ///
    /// Consumer-side only.
    pub fn consume(&self, n: usize) {
        let consumer = self.consumer_pos.load(Ordering::Relaxed);
        debug_assert!(consumer + n <= self.capacity);
        self.consumer_pos.store(consumer + n, Ordering::Release);
    }

    /// True when every committed byte has been consumed. Unlike
    /// [`StagingBuffer::peek`] this mutates nothing and may be called from
    /// any thread; it can lag one consumer snap behind the truth when the
    /// producer has wrapped, which only delays a waiter by one poll.
    pub fn is_empty(&self) -> bool {
        self.consumer_pos.load(Ordering::Acquire) == self.producer_pos.load(Ordering::Acquire)
    }

    /// Called by the [`DestructGuard`] when the producing thread exits.
    pub fn mark_for_destruction(&self) {
        self.should_be_destructed.store(true, Ordering::Release);
    }

    /// True once the producer is gone and every committed byte has been
    /// consumed. Only then may the consumer drop the buffer.
    pub fn is_destroyable(&self) -> bool {
        self.should_be_destructed.load(Ordering::Acquire)
            && self.consumer_pos.load(Ordering::Acquire) == self.producer_pos.load(Ordering::Acquire)
    }
}

/// Scoped owner bound to a producing thread.
///
/// Lives in a thread-local slot; when the thread exits, the guard's drop
/// marks the bound staging buffer for destruction. The buffer's storage is
/// freed later, by the consumer, once the destroyable condition holds.
pub struct DestructGuard {
    staging_buffer: RefCell<Option<Arc<StagingBuffer>>>,
}

impl DestructGuard {
    pub const fn new() -> DestructGuard {
        DestructGuard {
            staging_buffer: RefCell::new(None),
        }
    }

    /// Binds the buffer this guard watches over.
    pub fn bind(&self, staging_buffer: Arc<StagingBuffer>) {
        *self.staging_buffer.borrow_mut() = Some(staging_buffer);
    }

    /// The bound buffer, if any.
    pub fn buffer(&self) -> Option<Arc<StagingBuffer>> {
        self.staging_buffer.borrow().clone()
    }
}

impl Default for DestructGuard {
    fn default() -> DestructGuard {
        DestructGuard::new()
    }
}

impl Drop for DestructGuard {
    fn drop(&mut self) {
        if let Some(buffer) = self.staging_buffer.borrow_mut().take() {
            buffer.mark_for_destruction();
        }
    }
}
