//! Collectors for the Linux `/proc` filesystem.
//!
//! This module provides the record parsers, the system-wide CPU-time
//! normalizer, the per-entity updater and the tree that ties them together.

pub mod cpu_time;
pub mod parser;
pub mod process;
pub mod tree;

/// Process or thread id as the kernel reports it.
pub type Pid = i32;

pub use cpu_time::{AggregateError, CpuPeriod, CpuTime, FixedPeriod};
pub use parser::{ProcessRecord, RecordError};
pub use process::{EntitySummary, ProcessEntity, RefreshContext};
pub use tree::{Credentials, ProcessTree, TreeError, TreeOptions};
