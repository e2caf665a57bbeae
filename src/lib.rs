//! proctree - polling snapshot of the Linux process/thread hierarchy.
//!
//! Provides:
//! - `collector::procfs` - record parsing, CPU-time normalization, per-entity
//!   refresh and the process tree itself
//! - `collector::affinity` - CPU / NUMA node pinning
//! - `collector::mock` - in-memory `/proc` fixtures for tests

pub mod collector;
