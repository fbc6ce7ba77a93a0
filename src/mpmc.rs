//! Core MPMC (Multi-Producer Multi-Consumer) queue primitives.
//!
//! This module contains a bounded lock-free MPMC ring buffer algorithm.
//! Any number of threads may push and any number may pop concurrently;
//! per-slot cycle counters arbitrate slot ownership between the two sides.
//!
//! Used by:
//! - [`crate::sync::mpmc`] - Cloneable endpoint handles for inter-thread queues

pub(crate) mod ring;

pub use ring::RingError;
