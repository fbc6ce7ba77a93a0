//! Lock-free MPMC queue endpoints for inter-thread communication.
//!
//! A bounded queue over a heap-allocated ring with per-slot cycle counters.
//!
//! # Overview
//!
//! - [`Producer`] - Write end; clone one per producer thread
//! - [`Consumer`] - Read end; clone one per consumer thread
//! - Lock-free: no mutexes or syscalls in the hot path
//!
//! Both endpoints are `Clone + Send + Sync`: any number of threads may push
//! and any number may pop concurrently. (The SPSC-style `PhantomUnsync`
//! guard would be wrong here; exclusivity is exactly what MPMC does not
//! require.)
//!
//! # Example
//!
//! ```
//! use rotor::sync::mpmc;
//!
//! let (tx, rx) = mpmc::channel::<u64>(16).unwrap();
//!
//! tx.push(42).unwrap();
//! assert_eq!(rx.pop(), Some(42));
//! ```
//!
//! # Backpressure
//!
//! The non-blocking ops report full/empty through their return value and
//! never park. The `*_blocking` variants layer a caller-side wait on top:
//! brief spinning, then cooperative yielding, bounded by a [`Timeout`].

use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;

use crate::mpmc::RingError;
use crate::mpmc::ring::{Ring, SPIN_LIMIT};
use crate::trace;

/// Timeout specification for the blocking operation variants.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

impl Timeout {
    fn deadline(self) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            Self::Duration(d) => Some(Instant::now() + d),
        }
    }
}

/// Write end of the MPMC queue.
pub struct Producer<T: Copy + Send> {
    ring: Arc<Ring<T>>,
}

/// Read end of the MPMC queue.
pub struct Consumer<T: Copy + Send> {
    ring: Arc<Ring<T>>,
}

impl<T: Copy + Send> std::fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer").finish_non_exhaustive()
    }
}

impl<T: Copy + Send> std::fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}

impl<T: Copy + Send> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T: Copy + Send> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

/// Creates a new MPMC channel with the given capacity.
///
/// Returns a `(Producer, Consumer)` pair sharing one ring. Clone either end
/// freely; the ring is dropped when the last endpoint goes away.
///
/// # Errors
///
/// Returns [`RingError::InvalidCapacity`] if `capacity` is zero or not a
/// power of two.
///
/// # Example
///
/// ```
/// use rotor::sync::mpmc;
///
/// let (tx, rx) = mpmc::channel::<u64>(1024).unwrap();
///
/// tx.push(7).unwrap();
/// assert_eq!(rx.pop(), Some(7));
/// ```
pub fn channel<T: Copy + Send>(capacity: u64) -> Result<(Producer<T>, Consumer<T>), RingError> {
    let ring = Arc::new(Ring::with_capacity(capacity)?);
    trace::debug!(capacity, "created mpmc channel");

    let producer = Producer {
        ring: Arc::clone(&ring),
    };
    let consumer = Consumer { ring };

    Ok((producer, consumer))
}

impl<T: Copy + Send> Producer<T> {
    /// Attempts to enqueue one record (lock-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(record)` if the queue is full, allowing retry.
    #[inline]
    pub fn push(&self, record: T) -> Result<(), T> {
        self.ring.try_push(record)
    }

    /// Retries `push` with spin-then-yield backpressure until it succeeds
    /// or the timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns `Err(record)` on timeout.
    pub fn push_blocking(&self, mut record: T, timeout: Timeout) -> Result<(), T> {
        let deadline = timeout.deadline();
        let mut spins = 0u32;
        loop {
            match self.push(record) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    record = returned;
                    if let Some(dl) = deadline
                        && Instant::now() > dl
                    {
                        trace::trace!("push_blocking timed out");
                        return Err(record);
                    }
                    if spins < SPIN_LIMIT {
                        std::hint::spin_loop();
                        spins += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    /// Attempts to enqueue all of `records`, all-or-nothing.
    ///
    /// Returns `Ok(n)` with every record written or `Ok(0)` with the queue
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::BatchTooLarge`] if the batch exceeds the
    /// capacity.
    #[inline]
    pub fn push_batch(&self, records: &[T]) -> Result<u64, RingError> {
        self.ring.try_push_batch(records)
    }

    /// Slot count of the underlying ring.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.ring.capacity()
    }

    /// Records currently in flight; exact only at quiescence.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.ring.len()
    }

    /// Whether the ring appears empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

impl<T: Copy + Send> Consumer<T> {
    /// Attempts to dequeue one record (lock-free).
    ///
    /// Returns `None` if the queue is empty.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        self.ring.try_pop()
    }

    /// Retries `pop` with spin-then-yield backpressure until a record
    /// arrives or the timeout elapses.
    ///
    /// Returns `None` on timeout.
    #[must_use]
    pub fn pop_blocking(&self, timeout: Timeout) -> Option<T> {
        let deadline = timeout.deadline();
        let mut spins = 0u32;
        loop {
            if let Some(record) = self.pop() {
                return Some(record);
            }
            if let Some(dl) = deadline
                && Instant::now() > dl
            {
                trace::trace!("pop_blocking timed out");
                return None;
            }
            if spins < SPIN_LIMIT {
                std::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Attempts to dequeue exactly `out.len()` records, all-or-nothing.
    ///
    /// Returns `Ok(n)` with `out` filled in cursor order or `Ok(0)` with
    /// the queue untouched.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::BatchTooLarge`] if `out` exceeds the capacity.
    #[inline]
    pub fn pop_batch(&self, out: &mut [T]) -> Result<u64, RingError> {
        self.ring.try_pop_batch(out)
    }

    /// Slot count of the underlying ring.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.ring.capacity()
    }

    /// Records currently in flight; exact only at quiescence.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.ring.len()
    }

    /// Whether the ring appears empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
