//! Bounded lock-free MPMC ring buffer for fixed-shape records.
//!
//! The queue transports trivially-copyable records between any number of
//! producer and consumer threads without locks, without blocking, and without
//! per-operation heap allocation. Coordination runs entirely through a
//! per-slot cycle counter plus compare-and-swap on the shared head/tail
//! cursors; see [`mpmc`] for the algorithm and [`sync::mpmc`] for the
//! endpoint handles most callers want.
//!
//! # Example
//!
//! ```
//! use rotor::sync::mpmc;
//!
//! let (tx, rx) = mpmc::channel::<u64>(1024).unwrap();
//!
//! tx.push(7).unwrap();
//! assert_eq!(rx.pop(), Some(7));
//! ```

pub mod mpmc;
pub mod sync;
pub mod trace;

#[doc(inline)]
pub use mpmc::RingError;
