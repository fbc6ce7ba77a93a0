//! Core lock-free MPMC ring buffer algorithm.
//!
//! This module provides a bounded MPMC (Multi-Producer Multi-Consumer) ring
//! buffer using per-slot cycle counters for synchronization. Both sides are
//! lock-free: some thread always makes progress, though an individual thread
//! may retry under contention.
//!
//! # Algorithm
//!
//! Each slot carries an atomic cycle counter seeded with the slot's index.
//! Two monotone 64-bit cursors assign a globally ordered position to every
//! record: `head` for producers, `tail` for consumers. For a cursor value
//! `pos` landing on slot `off = pos & mask`:
//!
//! - `cycle[off] == pos` means the slot is empty and writable at `pos`
//! - `cycle[off] == pos + 1` means the slot is filled and readable at `pos`
//! - a smaller cycle means the other side has not caught up yet
//!   (queue full on the producer side, queue empty on the consumer side)
//! - a larger cycle means another thread already moved the cursor past
//!   `pos`, so the caller reloads the cursor and retries
//!
//! A producer claims `pos` by CAS on `head`, writes the payload, then
//! publishes with `cycle[off] = pos + 1`. A consumer claims by CAS on
//! `tail`, reads the payload, then releases with `cycle[off] = pos + N`,
//! which is exactly "empty at the next lap". Head and tail never inspect
//! each other; all producer/consumer coordination flows through the cycles.
//!
//! The behind/ahead test is a *signed* comparison on the wrapping difference
//! (`cycle.wrapping_sub(pos) as i64`). Comparing raw unsigned values would
//! misclassify slots once the counters near a lap boundary.
//!
//! # Memory ordering
//!
//! - Cursor and cycle loads are `Acquire`; the cycle load is what makes the
//!   other side's payload access visible before ours begins.
//! - Publication stores on a cycle are `Release`, pairing with those loads:
//!   every payload write happens-before the matching payload read.
//! - Cursor CAS is `AcqRel` on success; a failed CAS needs no ordering, the
//!   loop reloads everything.
//!
//! # Safety
//!
//! Payload slots are plain memory (`UnsafeCell<MaybeUninit<T>>`). The cycle
//! protocol partitions every slot in time: between a successful cursor CAS
//! and the subsequent cycle store, exactly one thread owns the slot. Each
//! unsafe access states which phase of the protocol grants it.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

// Cursors and cycles are 64-bit; slot indexing casts them to usize.
const _: () = assert!(
    usize::BITS >= 64,
    "cursor arithmetic requires 64-bit addressing"
);

/// Spins before a waiting loop falls back to `thread::yield_now`.
pub(crate) const SPIN_LIMIT: u32 = 64;

/// Errors surfaced at the ring buffer API boundary.
///
/// Full and empty are not errors; they are flow-control results
/// (`Err(record)` from push, `None` from pop, `Ok(0)` from the batch ops).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Requested capacity is zero or not a power of two.
    #[error("invalid capacity {capacity}: must be a nonzero power of two")]
    InvalidCapacity {
        /// The rejected capacity.
        capacity: u64,
    },
    /// Batch length exceeds the ring capacity; the transfer could never
    /// complete and would spin forever if attempted.
    #[error("batch of {len} records exceeds ring capacity {capacity}")]
    BatchTooLarge {
        /// Length of the rejected batch.
        len: usize,
        /// Capacity of the ring.
        capacity: u64,
    },
}

/// Producer cursor, alone on its cache line.
///
/// Explicit alignment keeps producer CAS traffic off the consumer's line;
/// layout is not left to compiler heuristics.
#[repr(align(64))]
struct ProducerCursor {
    /// Next position to claim for writing. Advanced only by successful CAS.
    head: AtomicU64,
}

/// Consumer cursor, alone on its cache line.
#[repr(align(64))]
struct ConsumerCursor {
    /// Next position to claim for reading. Advanced only by successful CAS.
    tail: AtomicU64,
}

/// Bounded lock-free MPMC ring buffer.
///
/// Capacity is fixed at construction and must be a nonzero power of two.
/// All operations are allocation-free; the two backing arrays are allocated
/// exactly once in [`Ring::with_capacity`].
#[repr(C)]
pub struct Ring<T> {
    /// Slot count. Read-mostly; shares a line with `mask`, not the cursors.
    capacity: u64,
    /// `capacity - 1`, for power-of-two index masking.
    mask: u64,
    producer: ProducerCursor,
    consumer: ConsumerCursor,
    /// One cycle counter per slot, seeded `cycle[i] = i`.
    cycle: Box<[AtomicU64]>,
    /// Payload array. Plain memory; ownership is arbitrated by `cycle`.
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: Ring is Send for T: Send; the backing arrays are owned and the
// cursors are atomics.
unsafe impl<T: Send> Send for Ring<T> {}

// SAFETY: Ring is Sync because every slot access is serialized by the cycle
// protocol: a thread touches slots[off] only inside the window granted by a
// successful cursor CAS (or an observed publication), and closes that window
// with a Release store on cycle[off]. No two threads are ever inside the
// same slot's window at once.
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> std::fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity)
            .field("mask", &self.mask)
            .finish_non_exhaustive()
    }
}

impl<T: Copy> Ring<T> {
    /// Creates a ring with the given slot count.
    ///
    /// Allocation happens exactly here; no steady-state operation allocates.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::InvalidCapacity`] if `capacity` is zero or not a
    /// power of two.
    pub fn with_capacity(capacity: u64) -> Result<Self, RingError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(RingError::InvalidCapacity { capacity });
        }

        // Every slot starts empty at lap 0.
        let cycle = (0..capacity).map(AtomicU64::new).collect();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Ok(Self {
            capacity,
            mask: capacity - 1,
            producer: ProducerCursor {
                head: AtomicU64::new(0),
            },
            consumer: ConsumerCursor {
                tail: AtomicU64::new(0),
            },
            cycle,
            slots,
        })
    }

    /// Attempts to enqueue one record (lock-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(record)` if the queue is full, handing the record back
    /// for retry.
    #[inline]
    pub fn try_push(&self, record: T) -> Result<(), T> {
        loop {
            let head = self.producer.head.load(Ordering::Acquire);
            let off = (head & self.mask) as usize;
            let seq = self.cycle[off].load(Ordering::Acquire);
            let lag = seq.wrapping_sub(head) as i64;

            if lag == 0 {
                // Slot is empty at this position; try to claim it.
                if self
                    .producer
                    .head
                    .compare_exchange_weak(
                        head,
                        head.wrapping_add(1),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // SAFETY: The CAS granted this thread the slot at `off`
                    // for position `head`. The consumer will not touch it
                    // until the cycle store below, and no producer can land
                    // on `off` again before a full lap.
                    unsafe {
                        (*self.slots[off].get()).write(record);
                    }
                    // Publish: slot filled at this position.
                    self.cycle[off].store(head.wrapping_add(1), Ordering::Release);
                    return Ok(());
                }
                // CAS lost to another producer; reload and retry.
            } else if lag < 0 {
                // The consumer a lap behind has not released this slot.
                return Err(record);
            } else {
                // Another producer already advanced head past this position.
                std::hint::spin_loop();
            }
        }
    }

    /// Attempts to dequeue one record (lock-free).
    ///
    /// Returns `None` if the queue is empty.
    #[inline]
    pub fn try_pop(&self) -> Option<T> {
        loop {
            let tail = self.consumer.tail.load(Ordering::Acquire);
            let off = (tail & self.mask) as usize;
            let seq = self.cycle[off].load(Ordering::Acquire);
            let lag = seq.wrapping_sub(tail.wrapping_add(1)) as i64;

            if lag == 0 {
                // Slot is filled at this position; try to claim it.
                if self
                    .consumer
                    .tail
                    .compare_exchange_weak(
                        tail,
                        tail.wrapping_add(1),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // SAFETY: The CAS granted this thread the slot at `off`
                    // for position `tail`, and the Acquire cycle load above
                    // observed the producer's publication, so the payload
                    // write is visible and initialized.
                    let record = unsafe { (*self.slots[off].get()).assume_init_read() };
                    // Release: slot empty at the next lap.
                    self.cycle[off].store(tail.wrapping_add(self.capacity), Ordering::Release);
                    return Some(record);
                }
            } else if lag < 0 {
                // No producer has published this position yet.
                return None;
            } else {
                // Another consumer already advanced tail past this position.
                std::hint::spin_loop();
            }
        }
    }

    /// Attempts to enqueue all of `records`, all-or-nothing.
    ///
    /// Returns `Ok(n)` with every record written, or `Ok(0)` with the queue
    /// untouched when fewer than `n` slots are free. An empty slice returns
    /// `Ok(0)` without touching the cursors.
    ///
    /// Only the two endpoint slots of the intended range are inspected
    /// before the CAS: cycles advance in lockstep with the cursors, so for
    /// `n <= capacity` an unreleased interior slot would imply an unreleased
    /// endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::BatchTooLarge`] if `records.len()` exceeds the
    /// capacity.
    pub fn try_push_batch(&self, records: &[T]) -> Result<u64, RingError> {
        let n = records.len() as u64;
        if n == 0 {
            return Ok(0);
        }
        if n > self.capacity {
            return Err(RingError::BatchTooLarge {
                len: records.len(),
                capacity: self.capacity,
            });
        }

        loop {
            let head = self.producer.head.load(Ordering::Acquire);
            let off = (head & self.mask) as usize;
            let lag = self.cycle[off].load(Ordering::Acquire).wrapping_sub(head) as i64;

            if lag < 0 {
                return Ok(0);
            }
            if lag > 0 {
                // Stale head; reload and retry.
                std::hint::spin_loop();
                continue;
            }

            // Endpoint pre-check: the last slot of the range must not still
            // be owned by a consumer one lap behind.
            let last = head.wrapping_add(n - 1);
            let last_off = (last & self.mask) as usize;
            if (self.cycle[last_off].load(Ordering::Acquire).wrapping_sub(last) as i64) < 0 {
                return Ok(0);
            }

            if self
                .producer
                .head
                .compare_exchange_weak(
                    head,
                    head.wrapping_add(n),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                for (i, record) in records.iter().enumerate() {
                    let pos = head.wrapping_add(i as u64);
                    let off = (pos & self.mask) as usize;
                    // SAFETY: The CAS granted this thread every position in
                    // [head, head + n). The endpoint pre-check plus cycle
                    // monotonicity guarantee each slot in the range has been
                    // released by its previous-lap consumer.
                    unsafe {
                        (*self.slots[off].get()).write(*record);
                    }
                    self.cycle[off].store(pos.wrapping_add(1), Ordering::Release);
                }
                return Ok(n);
            }
        }
    }

    /// Attempts to dequeue exactly `out.len()` records, all-or-nothing.
    ///
    /// Returns `Ok(n)` with `out` fully filled in cursor order, or `Ok(0)`
    /// with the queue untouched when fewer than `n` records are available.
    /// An empty buffer returns `Ok(0)` without touching the cursors.
    ///
    /// Reserving the range can outpace an interior producer's publication of
    /// its slot (producers publish their batches independently, so a later
    /// range can surface before an earlier one), and the copy loop waits per
    /// slot for that one in-flight store (brief spin, then cooperative
    /// yield). The wait is bounded by a single producer operation, never by
    /// unrelated activity.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::BatchTooLarge`] if `out.len()` exceeds the
    /// capacity.
    pub fn try_pop_batch(&self, out: &mut [T]) -> Result<u64, RingError> {
        let n = out.len() as u64;
        if n == 0 {
            return Ok(0);
        }
        if n > self.capacity {
            return Err(RingError::BatchTooLarge {
                len: out.len(),
                capacity: self.capacity,
            });
        }

        loop {
            let tail = self.consumer.tail.load(Ordering::Acquire);
            let off = (tail & self.mask) as usize;
            let lag = self.cycle[off]
                .load(Ordering::Acquire)
                .wrapping_sub(tail.wrapping_add(1)) as i64;

            if lag < 0 {
                return Ok(0);
            }
            if lag > 0 {
                std::hint::spin_loop();
                continue;
            }

            // Endpoint pre-check: the last position of the range must have
            // been published. Interior positions may still be in flight when
            // producers publish their batches out of order; the copy loop
            // below waits for those individually.
            let last = tail.wrapping_add(n - 1);
            let last_off = (last & self.mask) as usize;
            if (self.cycle[last_off]
                .load(Ordering::Acquire)
                .wrapping_sub(tail.wrapping_add(n)) as i64)
                < 0
            {
                return Ok(0);
            }

            if self
                .consumer
                .tail
                .compare_exchange_weak(
                    tail,
                    tail.wrapping_add(n),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                for (i, slot_out) in out.iter_mut().enumerate() {
                    let pos = tail.wrapping_add(i as u64);
                    let off = (pos & self.mask) as usize;

                    // The producer that claimed this position may still be
                    // writing; wait for exactly its publication store.
                    let mut spins = 0u32;
                    while self.cycle[off].load(Ordering::Acquire) != pos.wrapping_add(1) {
                        if spins < SPIN_LIMIT {
                            std::hint::spin_loop();
                            spins += 1;
                        } else {
                            std::thread::yield_now();
                        }
                    }

                    // SAFETY: The CAS granted this thread every position in
                    // [tail, tail + n), and the Acquire loop above observed
                    // this slot's publication, so the payload is initialized
                    // and visible.
                    *slot_out = unsafe { (*self.slots[off].get()).assume_init_read() };
                    self.cycle[off].store(pos.wrapping_add(self.capacity), Ordering::Release);
                }
                return Ok(n);
            }
        }
    }

    /// Slot count the ring was constructed with.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of records currently in flight (`head - tail`).
    ///
    /// A snapshot: exact only when producers and consumers are quiescent.
    #[must_use]
    pub fn len(&self) -> u64 {
        // Tail first: it trails head, so the difference never underflows.
        let tail = self.consumer.tail.load(Ordering::Acquire);
        let head = self.producer.head.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    /// Whether the ring appears empty. Same snapshot caveat as [`Ring::len`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
impl<T: Copy> Ring<T> {
    fn head(&self) -> u64 {
        self.producer.head.load(Ordering::Relaxed)
    }

    fn tail(&self) -> u64 {
        self.consumer.tail.load(Ordering::Relaxed)
    }

    fn cycle_at(&self, off: usize) -> u64 {
        self.cycle[off].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn rejects_zero_capacity() {
        let err = Ring::<u64>::with_capacity(0).unwrap_err();
        assert_eq!(err, RingError::InvalidCapacity { capacity: 0 });
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        let err = Ring::<u64>::with_capacity(3).unwrap_err();
        assert_eq!(err, RingError::InvalidCapacity { capacity: 3 });
    }

    #[test]
    fn fill_then_overflow_then_drain_fifo() {
        let ring = Ring::with_capacity(4).unwrap();

        for id in 1..=4u64 {
            assert!(ring.try_push(id).is_ok());
        }
        // Fifth push must report full and hand the record back.
        assert_eq!(ring.try_push(5), Err(5));

        for id in 1..=4u64 {
            assert_eq!(ring.try_pop(), Some(id));
        }
        assert_eq!(ring.try_pop(), None);
    }

    #[test]
    fn batch_roundtrip_in_order() {
        let ring = Ring::with_capacity(8).unwrap();

        let first: Vec<u64> = (0..4).collect();
        let second: Vec<u64> = (4..8).collect();
        assert_eq!(ring.try_push_batch(&first), Ok(4));
        assert_eq!(ring.try_push_batch(&second), Ok(4));

        let mut out = [0u64; 4];
        assert_eq!(ring.try_pop_batch(&mut out), Ok(4));
        assert_eq!(out, [0, 1, 2, 3]);
        assert_eq!(ring.try_pop_batch(&mut out), Ok(4));
        assert_eq!(out, [4, 5, 6, 7]);
    }

    #[test]
    fn empty_batches_do_not_touch_cursors() {
        let ring = Ring::<u64>::with_capacity(4).unwrap();

        assert_eq!(ring.try_push_batch(&[]), Ok(0));
        let mut out: [u64; 0] = [];
        assert_eq!(ring.try_pop_batch(&mut out), Ok(0));

        assert_eq!(ring.head(), 0);
        assert_eq!(ring.tail(), 0);
    }

    #[test]
    fn oversized_batch_rejected() {
        let ring = Ring::<u64>::with_capacity(4).unwrap();

        let records: Vec<u64> = (0..5).collect();
        assert_eq!(
            ring.try_push_batch(&records),
            Err(RingError::BatchTooLarge {
                len: 5,
                capacity: 4
            })
        );

        let mut out = [0u64; 5];
        assert_eq!(
            ring.try_pop_batch(&mut out),
            Err(RingError::BatchTooLarge {
                len: 5,
                capacity: 4
            })
        );
    }

    #[test]
    fn batch_is_all_or_nothing_when_short_of_room() {
        let ring = Ring::with_capacity(4).unwrap();

        assert!(ring.try_push(1u64).is_ok());
        assert!(ring.try_push(2u64).is_ok());

        // Two slots free, three requested: nothing may be written.
        assert_eq!(ring.try_push_batch(&[10, 11, 12]), Ok(0));
        assert_eq!(ring.len(), 2);

        // Two fit exactly.
        assert_eq!(ring.try_push_batch(&[10, 11]), Ok(2));
        assert_eq!(ring.try_pop(), Some(1));
        assert_eq!(ring.try_pop(), Some(2));
        assert_eq!(ring.try_pop(), Some(10));
        assert_eq!(ring.try_pop(), Some(11));
    }

    #[test]
    fn batch_pop_is_all_or_nothing_when_short_of_records() {
        let ring = Ring::with_capacity(8).unwrap();

        assert_eq!(ring.try_push_batch(&[1u64, 2, 3]), Ok(3));

        let mut out = [0u64; 4];
        assert_eq!(ring.try_pop_batch(&mut out), Ok(0));
        assert_eq!(ring.len(), 3);

        let mut out = [0u64; 3];
        assert_eq!(ring.try_pop_batch(&mut out), Ok(3));
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn emptiness_is_idempotent() {
        let ring = Ring::<u64>::with_capacity(4).unwrap();

        assert_eq!(ring.try_pop(), None);
        assert_eq!(ring.try_pop(), None);

        assert_eq!(ring.head(), 0);
        assert_eq!(ring.tail(), 0);
    }

    #[test]
    fn wraparound_across_many_laps() {
        let ring = Ring::with_capacity(4).unwrap();

        for lap in 0..50u64 {
            let base = lap * 4;
            for i in 0..4 {
                assert!(ring.try_push(base + i).is_ok());
            }
            for i in 0..4 {
                assert_eq!(ring.try_pop(), Some(base + i));
            }
            assert_eq!(ring.try_pop(), None);
        }
    }

    #[test]
    fn occupancy_stays_within_bounds() {
        let ring = Ring::with_capacity(8).unwrap();

        for round in 0..20u64 {
            for i in 0..8 {
                assert!(ring.try_push(round * 8 + i).is_ok());
                assert!(ring.len() <= ring.capacity());
            }
            assert_eq!(ring.try_push(999), Err(999));
            for _ in 0..8 {
                assert!(ring.try_pop().is_some());
            }
            assert!(ring.is_empty());
        }
    }

    // Every slot's cycle must read k*capacity + off (empty at lap k) or
    // k*capacity + off + 1 (filled at lap k) whenever no operation is in
    // flight.
    #[test]
    fn cycle_invariant_holds_at_quiescence() {
        let ring = Ring::with_capacity(4).unwrap();
        let cap = ring.capacity();

        let check = |ring: &Ring<u64>| {
            for off in 0..cap {
                let seq = ring.cycle_at(off as usize);
                let phase = seq.wrapping_sub(off) % cap;
                assert!(
                    phase == 0 || phase == 1,
                    "slot {off}: cycle {seq} is neither empty nor filled"
                );
            }
        };

        check(&ring);
        for i in 0..3u64 {
            ring.try_push(i).unwrap();
            check(&ring);
        }
        while ring.try_pop().is_some() {
            check(&ring);
        }
        // Push across the lap boundary.
        for i in 0..4u64 {
            ring.try_push(i).unwrap();
        }
        check(&ring);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 5_000;

        let ring = Arc::new(Ring::with_capacity(16).unwrap());

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let record = (p << 32) | i;
                    while ring.try_push(record).is_err() {
                        thread::yield_now();
                    }
                }
            }));
        }

        let drainer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut seen = Vec::with_capacity((PRODUCERS * PER_PRODUCER) as usize);
                while seen.len() < (PRODUCERS * PER_PRODUCER) as usize {
                    match ring.try_pop() {
                        Some(v) => seen.push(v),
                        None => thread::yield_now(),
                    }
                }
                seen
            })
        };

        for h in handles {
            h.join().unwrap();
        }
        let seen = drainer.join().unwrap();

        assert_eq!(seen.len(), (PRODUCERS * PER_PRODUCER) as usize);

        // Multiset equality and per-producer FIFO.
        let mut next = [0u64; PRODUCERS as usize];
        for v in seen {
            let p = (v >> 32) as usize;
            let i = v & u32::MAX as u64;
            assert_eq!(i, next[p], "producer {p} records out of order");
            next[p] += 1;
        }
        assert!(next.iter().all(|&n| n == PER_PRODUCER));
    }
}
