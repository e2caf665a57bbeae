//! Mock implementations for testing.
//!
//! This module provides `MockFs`, pre-built `/proc` scenarios and a
//! `MockAffinity` recorder, so the process tree can be exercised without a
//! live Linux `/proc` or the privileges affinity syscalls need.

mod affinity;
mod filesystem;
mod scenarios;

pub use affinity::MockAffinity;
pub use filesystem::MockFs;
pub use scenarios::{AGGREGATE_STAT, FamilyPids, ProcessFixture};
