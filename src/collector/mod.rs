//! Process tree sampler for Linux.
//!
//! This module reads process and thread records from the `/proc` filesystem,
//! keeps them as a tree refreshed in place every cycle, and pins entities to
//! CPUs or NUMA nodes. All filesystem access goes through [`FileSystem`], so
//! the whole pipeline runs against in-memory fixtures in tests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ProcessTree                          │
//! │  ┌─────────────────────┐   ┌─────────────────────────────┐  │
//! │  │   ProcessEntity     │   │         CpuTime             │  │
//! │  │  - task/<id>/stat   │◄──│  - /proc/stat (cpu line)    │  │
//! │  │  - children, task/  │   │  - period per core          │  │
//! │  └──────────┬──────────┘   └──────────────┬──────────────┘  │
//! │             └──────────────┬──────────────┘                 │
//! │                            │                                │
//! │          ┌─────────────────┼─────────────────┐              │
//! │   ┌──────▼──────┐                    ┌───────▼───────┐      │
//! │   │  FileSystem │ (trait)            │  CpuAffinity  │      │
//! │   └──────┬──────┘                    └───────┬───────┘      │
//! └──────────┼───────────────────────────────────┼──────────────┘
//!            │                                   │
//!     ┌──────┴───────┐                   ┌───────┴────────┐
//!     │              │                   │                │
//! ┌───▼────┐   ┌─────▼────┐      ┌───────▼──────┐  ┌──────▼───────┐
//! │ RealFs │   │  MockFs  │      │SchedAffinity │  │ MockAffinity │
//! └────────┘   └──────────┘      └──────────────┘  └──────────────┘
//! ```
//!
//! # Usage
//!
//! ## Production (Linux)
//!
//! ```ignore
//! use proctree::collector::ProcessTree;
//!
//! let mut tree = ProcessTree::new()?;
//! tree.update()?;
//! for entity in &tree {
//!     println!("{entity}");
//! }
//! ```
//!
//! ## Testing (with MockFs)
//!
//! ```
//! use proctree::collector::mock::{MockAffinity, MockFs};
//! use proctree::collector::{Credentials, ProcessTree, TreeOptions};
//!
//! let options = TreeOptions::default()
//!     .with_credentials(Credentials::new(0))
//!     .with_cpus(4);
//! let tree = ProcessTree::with_options(MockFs::family_tree(), MockAffinity::default(), options)
//!     .unwrap();
//! assert_eq!(tree.size(), 5);
//! ```

pub mod affinity;
pub mod mock;
pub mod procfs;
pub mod traits;

pub use affinity::{AffinityError, AffinityErrorKind, CpuAffinity, NumaTopology, SchedAffinity};
pub use mock::MockFs;
pub use procfs::tree::{DEFAULT_NODE_PATH, DEFAULT_PROC_PATH, DEFAULT_ROOT, UpdateStats};
pub use procfs::{
    AggregateError, CpuPeriod, CpuTime, Credentials, EntitySummary, FixedPeriod, Pid, ProcessEntity,
    ProcessRecord, ProcessTree, RecordError, TreeError, TreeOptions,
};
pub use traits::{FileSystem, RealFs};
