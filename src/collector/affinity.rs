//! CPU affinity syscalls and NUMA topology.
//!
//! Pinning goes through the [`CpuAffinity`] trait so the tree can be driven
//! against [`SchedAffinity`] (real `sched_setaffinity(2)`) or a recorder in
//! tests. NUMA membership is read from sysfs `node<N>/cpulist` files; a
//! machine without that directory is treated as a single node 0 holding
//! every CPU.

use std::collections::BTreeMap;
use std::path::Path;

use nix::errno::Errno;
use nix::sched::{CpuSet, sched_getaffinity, sched_setaffinity};
use thiserror::Error;
use tracing::debug;

use crate::collector::procfs::Pid;
use crate::collector::procfs::parser::parse_cpu_list;
use crate::collector::traits::FileSystem;

/// Cause of a failed affinity request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AffinityErrorKind {
    #[error("a supplied memory address was invalid")]
    BadAddress,

    #[error("the mask contains no processor physically on the system")]
    InvalidMask,

    #[error("the caller lacks the privileges for the request")]
    PermissionDenied,

    #[error("no such process")]
    NoSuchProcess,

    #[error("unknown error (errno {0})")]
    Unknown(i32),
}

impl From<Errno> for AffinityErrorKind {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::EFAULT => Self::BadAddress,
            Errno::EINVAL => Self::InvalidMask,
            Errno::EPERM => Self::PermissionDenied,
            Errno::ESRCH => Self::NoSuchProcess,
            other => Self::Unknown(other as i32),
        }
    }
}

/// A failed affinity request for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot set affinity of {pid}: {kind}")]
pub struct AffinityError {
    pub pid: Pid,
    pub kind: AffinityErrorKind,
}

impl AffinityError {
    pub fn new(pid: Pid, kind: AffinityErrorKind) -> Self {
        Self { pid, kind }
    }
}

/// Capability to restrict an entity to a set of CPUs.
pub trait CpuAffinity {
    /// Restricts `pid` to exactly `cpus`.
    fn set_affinity(&self, pid: Pid, cpus: &[usize]) -> Result<(), AffinityErrorKind>;

    /// CPUs the calling process may run on.
    fn own_affinity(&self) -> Result<Vec<usize>, AffinityErrorKind>;
}

/// Affinity through `sched_setaffinity(2)` / `sched_getaffinity(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchedAffinity;

impl CpuAffinity for SchedAffinity {
    fn set_affinity(&self, pid: Pid, cpus: &[usize]) -> Result<(), AffinityErrorKind> {
        let mut set = CpuSet::new();
        for &cpu in cpus {
            set.set(cpu)?;
        }
        sched_setaffinity(nix::unistd::Pid::from_raw(pid), &set)?;
        Ok(())
    }

    fn own_affinity(&self) -> Result<Vec<usize>, AffinityErrorKind> {
        let set = sched_getaffinity(nix::unistd::Pid::from_raw(0))?;
        Ok((0..CpuSet::count())
            .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
            .collect())
    }
}

/// NUMA node membership of every CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaTopology {
    nodes: BTreeMap<usize, Vec<usize>>,
}

impl NumaTopology {
    /// Single node 0 holding CPUs `0..cpus`.
    pub fn uma(cpus: usize) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(0, (0..cpus.max(1)).collect());
        Self { nodes }
    }

    /// Builds a topology from explicit node to CPU lists.
    pub fn from_nodes(nodes: impl IntoIterator<Item = (usize, Vec<usize>)>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
        }
    }

    /// Reads `<node_path>/node<N>/cpulist`.
    ///
    /// Falls back to [`NumaTopology::uma`] when no node is readable.
    pub fn load<F: FileSystem>(fs: &F, node_path: &Path, cpus: usize) -> Self {
        let entries = match fs.read_dir(node_path) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %node_path.display(), error = %e, "no NUMA topology, assuming one node");
                return Self::uma(cpus);
            }
        };

        let mut nodes = BTreeMap::new();
        for entry in entries {
            let Some(id) = entry
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("node"))
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };

            let Ok(list) = fs.read_to_string(&entry.join("cpulist")) else {
                continue;
            };
            nodes.insert(id, parse_cpu_list(&list));
        }

        if nodes.is_empty() {
            Self::uma(cpus)
        } else {
            Self { nodes }
        }
    }

    /// Node holding `cpu`. CPUs absent from every list map to node 0.
    pub fn node_of_cpu(&self, cpu: usize) -> usize {
        self.nodes
            .iter()
            .find(|(_, cpus)| cpus.contains(&cpu))
            .map(|(&node, _)| node)
            .unwrap_or(0)
    }

    /// CPUs of `node`, if the node exists.
    pub fn cpus_of(&self, node: usize) -> Option<&[usize]> {
        self.nodes.get(&node).map(Vec::as_slice)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
