//! In-process synchronization primitives built on the core ring algorithms.

pub mod mpmc;
