//! Recording stand-in for the affinity syscalls.

use std::cell::{Cell, RefCell};

use crate::collector::affinity::{AffinityErrorKind, CpuAffinity};
use crate::collector::procfs::Pid;

/// Records every affinity request instead of issuing it.
#[derive(Debug)]
pub struct MockAffinity {
    cpus: usize,
    calls: RefCell<Vec<(Pid, Vec<usize>)>>,
    failure: Cell<Option<AffinityErrorKind>>,
}

impl MockAffinity {
    /// Creates a recorder whose own mask covers `cpus` CPUs.
    pub fn new(cpus: usize) -> Self {
        Self {
            cpus,
            calls: RefCell::new(Vec::new()),
            failure: Cell::new(None),
        }
    }

    /// Makes every following request fail with `kind` (or succeed with `None`).
    pub fn fail_with(&self, kind: Option<AffinityErrorKind>) {
        self.failure.set(kind);
    }

    /// Requests seen so far, in order.
    pub fn calls(&self) -> Vec<(Pid, Vec<usize>)> {
        self.calls.borrow().clone()
    }

    /// The last mask requested for `pid`.
    pub fn last_mask(&self, pid: Pid) -> Option<Vec<usize>> {
        self.calls
            .borrow()
            .iter()
            .rev()
            .find(|(p, _)| *p == pid)
            .map(|(_, mask)| mask.clone())
    }
}

impl Default for MockAffinity {
    fn default() -> Self {
        Self::new(4)
    }
}

impl CpuAffinity for MockAffinity {
    fn set_affinity(&self, pid: Pid, cpus: &[usize]) -> Result<(), AffinityErrorKind> {
        self.calls.borrow_mut().push((pid, cpus.to_vec()));
        match self.failure.get() {
            Some(kind) => Err(kind),
            None => Ok(()),
        }
    }

    fn own_affinity(&self) -> Result<Vec<usize>, AffinityErrorKind> {
        Ok((0..self.cpus).collect())
    }
}
