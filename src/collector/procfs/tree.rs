//! Process tree: discovery, refresh, linkage and retirement of entities.
//!
//! Every [`ProcessTree::update`] is one sampling cycle:
//!
//! 1. the CPU-time normalizer is refreshed;
//! 2. entities are walked breadth-first from the root (targeted mode) or from
//!    every numeric entry of the proc root (full-scan mode, when the root is
//!    pid 1), each id refreshed at most once;
//! 3. each entity is linked under its effective parent;
//! 4. previously tracked ids that were not refreshed are retired.
//!
//! Entities vanishing mid-cycle are skipped; malformed records abort the cycle.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::collections::btree_map::Entry;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::collector::affinity::{AffinityError, CpuAffinity, NumaTopology, SchedAffinity};
use crate::collector::procfs::Pid;
use crate::collector::procfs::cpu_time::{AggregateError, CpuTime, online_cpus};
use crate::collector::procfs::parser::{ProcessRecord, RecordError, pid_from_path};
use crate::collector::procfs::process::{ProcessEntity, RefreshContext};
use crate::collector::traits::{FileSystem, RealFs};

/// Root id that switches the tree to full-scan mode.
pub const DEFAULT_ROOT: Pid = 1;

/// Default proc filesystem mount point.
pub const DEFAULT_PROC_PATH: &str = "/proc";

/// Default sysfs directory holding `node<N>/cpulist`.
pub const DEFAULT_NODE_PATH: &str = "/sys/devices/system/node";

/// Indentation per tree level in the text dump.
const TAB_SIZE: usize = 3;

/// Error type for tree construction, sampling and pinning.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("proc path {} is not a directory", .0.display())]
    InvalidProcPath(PathBuf),

    #[error("root process {0} is not valid")]
    InvalidRoot(Pid),

    #[error("the process tree is empty")]
    EmptyTree,

    #[error("process {0} is not tracked")]
    NotTracked(Pid),

    #[error("cannot list {}: {source}", .path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Affinity(#[from] AffinityError),

    #[error("failed to unpin {} entities", .failures.len())]
    Unpin { failures: Vec<AffinityError> },
}

/// Identity of the sampling process, captured once per tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    uid: u32,
}

impl Credentials {
    /// Real user id of the calling process.
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
        }
    }

    pub fn new(uid: u32) -> Self {
        Self { uid }
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Root may change the affinity of any process.
    pub fn is_privileged(&self) -> bool {
        self.uid == 0
    }
}

/// Configuration of a [`ProcessTree`].
#[derive(Debug, Clone)]
pub struct TreeOptions {
    /// Root id. [`DEFAULT_ROOT`] selects full-scan mode.
    pub root: Pid,
    /// Proc filesystem root, e.g. a fixture directory in tests.
    pub proc_path: PathBuf,
    /// Sysfs NUMA node directory.
    pub node_path: PathBuf,
    pub credentials: Credentials,
    /// Logical CPU count; detected when `None`.
    pub cpus: Option<usize>,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT,
            proc_path: PathBuf::from(DEFAULT_PROC_PATH),
            node_path: PathBuf::from(DEFAULT_NODE_PATH),
            credentials: Credentials::current(),
            cpus: None,
        }
    }
}

impl TreeOptions {
    pub fn with_root(mut self, root: Pid) -> Self {
        self.root = root;
        self
    }

    pub fn with_proc_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.proc_path = path.into();
        self
    }

    pub fn with_node_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.node_path = path.into();
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = Some(cpus);
        self
    }
}

/// Counters of one sampling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateStats {
    /// Entities refreshed or created.
    pub refreshed: usize,
    /// Entities newly tracked.
    pub inserted: usize,
    /// Ids skipped because their records vanished.
    pub vanished: usize,
    /// Tracked ids removed at the end of the cycle.
    pub retired: usize,
    pub duration: Duration,
}

/// Everything entities read from during a refresh.
struct Source<F: FileSystem> {
    fs: F,
    proc_path: PathBuf,
    cpu_time: CpuTime,
    topology: NumaTopology,
    credentials: Credentials,
}

impl<F: FileSystem> Source<F> {
    fn context(&self) -> RefreshContext<'_, F> {
        RefreshContext {
            fs: &self.fs,
            proc_path: &self.proc_path,
            period: &self.cpu_time,
            topology: &self.topology,
            credentials: self.credentials,
        }
    }

    /// Numeric top-level entries of the proc root, ascending.
    fn scan(&self) -> Result<Vec<Pid>, TreeError> {
        let entries = self
            .fs
            .read_dir(&self.proc_path)
            .map_err(|source| TreeError::Scan {
                path: self.proc_path.clone(),
                source,
            })?;

        let mut pids: Vec<Pid> = entries
            .iter()
            .filter(|entry| self.fs.is_dir(entry))
            .filter_map(|entry| pid_from_path(entry))
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }
}

/// Ids seen during one cycle.
#[derive(Default)]
struct Cycle {
    visited: HashSet<Pid>,
    updated: HashSet<Pid>,
    stats: UpdateStats,
}

/// Snapshot of a process hierarchy, keyed by id.
///
/// Relations (children, tasks, parent) are stored as ids and resolved through
/// the tree on demand.
pub struct ProcessTree<F: FileSystem = RealFs, A: CpuAffinity = SchedAffinity> {
    source: Source<F>,
    affinity: A,
    root: Pid,
    processes: BTreeMap<Pid, ProcessEntity>,
    last_stats: Option<UpdateStats>,
}

impl ProcessTree {
    /// Tree of the whole system, in full-scan mode.
    pub fn new() -> Result<Self, TreeError> {
        Self::with_options(RealFs::new(), SchedAffinity, TreeOptions::default())
    }

    /// Tree of `root` and its descendants on the live system.
    pub fn with_root(root: Pid) -> Result<Self, TreeError> {
        Self::with_options(
            RealFs::new(),
            SchedAffinity,
            TreeOptions::default().with_root(root),
        )
    }
}

impl<F: FileSystem, A: CpuAffinity> ProcessTree<F, A> {
    /// Validates the proc root, samples once and checks the root was found.
    pub fn with_options(fs: F, affinity: A, options: TreeOptions) -> Result<Self, TreeError> {
        if !fs.is_dir(&options.proc_path) {
            return Err(TreeError::InvalidProcPath(options.proc_path));
        }

        let cpus = options.cpus.unwrap_or_else(online_cpus);
        let topology = NumaTopology::load(&fs, &options.node_path, cpus);

        let mut tree = Self {
            source: Source {
                fs,
                proc_path: options.proc_path,
                cpu_time: CpuTime::with_cpus(cpus),
                topology,
                credentials: options.credentials,
            },
            affinity,
            root: options.root,
            processes: BTreeMap::new(),
            last_stats: None,
        };

        tree.update()?;

        if !tree.processes.contains_key(&tree.root) {
            // A full scan that found nothing at all points at a bad proc root.
            if tree.full_scan() && tree.processes.is_empty() {
                return Err(TreeError::EmptyTree);
            }
            return Err(TreeError::InvalidRoot(tree.root));
        }

        info!(
            root = tree.root,
            proc_path = %tree.source.proc_path.display(),
            entities = tree.processes.len(),
            numa_nodes = tree.source.topology.node_count(),
            "process tree initialized"
        );

        Ok(tree)
    }

    /// Runs one sampling cycle.
    pub fn update(&mut self) -> Result<UpdateStats, TreeError> {
        let start = Instant::now();

        self.source
            .cpu_time
            .update(&self.source.fs, &self.source.proc_path)?;

        let old: Vec<Pid> = self.processes.keys().copied().collect();
        let mut cycle = Cycle::default();

        if self.full_scan() {
            for pid in self.source.scan()? {
                if !cycle.visited.contains(&pid) {
                    self.walk(pid, &mut cycle)?;
                }
            }
        } else {
            self.walk(self.root, &mut cycle)?;
        }

        self.reconcile_parents();

        for pid in old {
            if !cycle.updated.contains(&pid) {
                self.processes.remove(&pid);
                cycle.stats.retired += 1;
                debug!(pid, "retired");
            }
        }
        self.prune_relations();

        cycle.stats.duration = start.elapsed();
        trace!(
            refreshed = cycle.stats.refreshed,
            inserted = cycle.stats.inserted,
            vanished = cycle.stats.vanished,
            retired = cycle.stats.retired,
            "update finished"
        );
        self.last_stats = Some(cycle.stats.clone());
        Ok(cycle.stats)
    }

    fn full_scan(&self) -> bool {
        self.root == DEFAULT_ROOT
    }

    /// Breadth-first refresh of `seed` and everything it reports.
    fn walk(&mut self, seed: Pid, cycle: &mut Cycle) -> Result<(), TreeError> {
        let mut queue: VecDeque<(Pid, Option<PathBuf>)> = VecDeque::from([(seed, None)]);

        while let Some((pid, path)) = queue.pop_front() {
            if !cycle.visited.insert(pid) {
                continue;
            }

            let ctx = self.source.context();
            let result = match self.processes.entry(pid) {
                Entry::Occupied(mut entry) => entry.get_mut().refresh(&ctx),
                Entry::Vacant(entry) => ProcessEntity::new(pid, path, &ctx).map(|entity| {
                    entry.insert(entity);
                    cycle.stats.inserted += 1;
                }),
            };

            match result {
                Ok(()) => {
                    cycle.updated.insert(pid);
                    cycle.stats.refreshed += 1;
                }
                Err(e) if e.is_transient() => {
                    debug!(pid, error = %e, "entity vanished during update");
                    cycle.stats.vanished += 1;
                    continue;
                }
                Err(e) => {
                    warn!(pid, error = %e, "malformed record, aborting update");
                    return Err(e.into());
                }
            }

            if let Some(entity) = self.processes.get(&pid) {
                for tid in entity.tasks() {
                    let task_path = entity.path().join("task").join(tid.to_string());
                    queue.push_back((*tid, Some(task_path)));
                }
                for child in entity.children() {
                    queue.push_back((*child, None));
                }
            }
        }

        Ok(())
    }

    /// Links every entity under its effective parent, when tracked.
    fn reconcile_parents(&mut self) {
        let links: Vec<(Pid, Pid, bool)> = self
            .processes
            .values()
            .filter(|entity| entity.pid() != self.root)
            .map(|entity| (entity.effective_ppid(), entity.pid(), entity.is_thread()))
            .collect();

        for (owner, pid, thread) in links {
            if let Some(parent) = self.processes.get_mut(&owner) {
                if thread {
                    parent.add_task(pid);
                } else {
                    parent.add_child(pid);
                }
            }
        }
    }

    /// Drops relations pointing at untracked ids.
    fn prune_relations(&mut self) {
        let tracked: BTreeSet<Pid> = self.processes.keys().copied().collect();
        for entity in self.processes.values_mut() {
            entity.retain_relations(|pid| tracked.contains(&pid));
        }
    }

    /// Tracks `pid` from `<proc>/<pid>` if it is not tracked yet.
    pub fn insert(&mut self, pid: Pid) -> Result<&ProcessEntity, TreeError> {
        self.insert_at(pid, None)
    }

    /// Tracks `pid` from an explicit path if it is not tracked yet.
    pub fn insert_at(
        &mut self,
        pid: Pid,
        path: Option<PathBuf>,
    ) -> Result<&ProcessEntity, TreeError> {
        let entity: &ProcessEntity = match self.processes.entry(pid) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let entity = ProcessEntity::new(pid, path, &self.source.context())?;
                trace!(pid, "inserted");
                entry.insert(entity)
            }
        };
        Ok(entity)
    }

    /// Returns the entity for `pid`, tracking it on first access.
    ///
    /// `None` when the id does not exist.
    pub fn get(&mut self, pid: Pid) -> Option<&ProcessEntity> {
        match self.insert(pid) {
            Ok(entity) => Some(entity),
            Err(e) => {
                trace!(pid, error = %e, "lookup failed");
                None
            }
        }
    }

    /// Returns an already tracked entity.
    pub fn find(&self, pid: Pid) -> Result<&ProcessEntity, TreeError> {
        self.processes.get(&pid).ok_or(TreeError::NotTracked(pid))
    }

    /// Stops tracking `pid`. Returns whether it was tracked.
    pub fn erase(&mut self, pid: Pid) -> bool {
        if self.processes.remove(&pid).is_none() {
            return false;
        }
        self.prune_relations();
        true
    }

    pub fn alive(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn size(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn root(&self) -> Pid {
        self.root
    }

    pub fn proc_path(&self) -> &Path {
        &self.source.proc_path
    }

    pub fn cpu_time(&self) -> &CpuTime {
        &self.source.cpu_time
    }

    pub fn topology(&self) -> &NumaTopology {
        &self.source.topology
    }

    pub fn credentials(&self) -> Credentials {
        self.source.credentials
    }

    /// Counters of the last [`ProcessTree::update`].
    pub fn last_stats(&self) -> Option<&UpdateStats> {
        self.last_stats.as_ref()
    }

    /// Tracked entities in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &ProcessEntity> + '_ {
        self.processes.values()
    }

    pub fn children(&self, pid: Pid) -> BTreeSet<Pid> {
        self.processes
            .get(&pid)
            .map(|entity| entity.children().clone())
            .unwrap_or_default()
    }

    pub fn tasks(&self, pid: Pid) -> BTreeSet<Pid> {
        self.processes
            .get(&pid)
            .map(|entity| entity.tasks().clone())
            .unwrap_or_default()
    }

    pub fn children_and_tasks(&self, pid: Pid) -> BTreeSet<Pid> {
        self.processes
            .get(&pid)
            .map(|entity| entity.children_and_tasks().collect())
            .unwrap_or_default()
    }

    /// Transitive children and tasks of `pid`.
    pub fn all_children_of(&self, pid: Pid) -> BTreeSet<Pid> {
        let mut descendants = BTreeSet::new();
        let mut queue = VecDeque::from([pid]);

        while let Some(current) = queue.pop_front() {
            let Some(entity) = self.processes.get(&current) else {
                continue;
            };
            for related in entity.children_and_tasks() {
                if related != pid && descendants.insert(related) {
                    queue.push_back(related);
                }
            }
        }

        descendants
    }

    pub fn record(&self, pid: Pid) -> Result<&ProcessRecord, TreeError> {
        Ok(self.find(pid)?.record())
    }

    pub fn state(&self, pid: Pid) -> Result<char, TreeError> {
        Ok(self.find(pid)?.state())
    }

    pub fn running(&self, pid: Pid) -> Result<bool, TreeError> {
        Ok(self.find(pid)?.running())
    }

    pub fn ppid(&self, pid: Pid) -> Result<Pid, TreeError> {
        Ok(self.find(pid)?.ppid())
    }

    pub fn priority(&self, pid: Pid) -> Result<i64, TreeError> {
        Ok(self.find(pid)?.priority())
    }

    pub fn nice(&self, pid: Pid) -> Result<i64, TreeError> {
        Ok(self.find(pid)?.nice())
    }

    pub fn processor(&self, pid: Pid) -> Result<usize, TreeError> {
        Ok(self.find(pid)?.processor())
    }

    pub fn numa_node(&self, pid: Pid) -> Result<usize, TreeError> {
        Ok(self.find(pid)?.numa_node())
    }

    pub fn cpu_use(&self, pid: Pid) -> Result<f64, TreeError> {
        Ok(self.find(pid)?.cpu_use())
    }

    pub fn cmdline(&self, pid: Pid) -> Result<&str, TreeError> {
        Ok(self.find(pid)?.cmdline())
    }

    pub fn migratable(&self, pid: Pid) -> Result<bool, TreeError> {
        Ok(self.find(pid)?.migratable())
    }

    pub fn is_thread(&self, pid: Pid) -> Result<bool, TreeError> {
        Ok(self.find(pid)?.is_thread())
    }

    pub fn pin_to_cpu(&mut self, pid: Pid, cpu: usize) -> Result<(), TreeError> {
        let entity = self.processes.get_mut(&pid).ok_or(TreeError::NotTracked(pid))?;
        entity.pin_to_cpu(cpu, &self.affinity)?;
        Ok(())
    }

    /// Pins `pid` to the CPU it was last observed on.
    pub fn pin_to_observed_cpu(&mut self, pid: Pid) -> Result<(), TreeError> {
        let entity = self.processes.get_mut(&pid).ok_or(TreeError::NotTracked(pid))?;
        entity.pin_to_observed_cpu(&self.affinity)?;
        Ok(())
    }

    pub fn pin_to_numa_node(&mut self, pid: Pid, node: usize) -> Result<(), TreeError> {
        let entity = self.processes.get_mut(&pid).ok_or(TreeError::NotTracked(pid))?;
        entity.pin_to_numa_node(node, &self.source.topology, &self.affinity)?;
        Ok(())
    }

    /// Pins `pid` to the NUMA node of the CPU it was last observed on.
    pub fn pin_to_observed_numa_node(&mut self, pid: Pid) -> Result<(), TreeError> {
        let entity = self.processes.get_mut(&pid).ok_or(TreeError::NotTracked(pid))?;
        entity.pin_to_observed_numa_node(&self.source.topology, &self.affinity)?;
        Ok(())
    }

    pub fn unpin(&mut self, pid: Pid) -> Result<(), TreeError> {
        let entity = self.processes.get_mut(&pid).ok_or(TreeError::NotTracked(pid))?;
        entity.unpin(&self.affinity)?;
        Ok(())
    }

    /// Unpins every tracked entity, continuing past failures.
    pub fn unpin_all(&mut self) -> Result<(), TreeError> {
        let mut failures = Vec::new();
        for entity in self.processes.values_mut() {
            if let Err(e) = entity.unpin(&self.affinity) {
                warn!(pid = e.pid, error = %e, "unpin failed");
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TreeError::Unpin { failures })
        }
    }

    /// Indented text dump of the tree below the root.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl<'a, F: FileSystem, A: CpuAffinity> IntoIterator for &'a ProcessTree<F, A> {
    type Item = &'a ProcessEntity;
    type IntoIter = std::collections::btree_map::Values<'a, Pid, ProcessEntity>;

    fn into_iter(self) -> Self::IntoIter {
        self.processes.values()
    }
}

impl<F: FileSystem, A: CpuAffinity> fmt::Display for ProcessTree<F, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Process tree with {} entries.", self.processes.len())?;

        let mut stack = vec![(self.root, 0usize)];
        let mut printed = HashSet::new();

        while let Some((pid, level)) = stack.pop() {
            if !printed.insert(pid) {
                continue;
            }
            let Some(entity) = self.processes.get(&pid) else {
                continue;
            };

            for i in 0..level * TAB_SIZE {
                f.write_str(if i % TAB_SIZE == 0 && i > 0 { "│" } else { " " })?;
            }
            if level > 0 {
                f.write_str("├─ ")?;
            }
            writeln!(f, "{entity}")?;

            let related: Vec<Pid> = entity.children_and_tasks().collect();
            for child in related.into_iter().rev() {
                stack.push((child, level + 1));
            }
        }

        Ok(())
    }
}
