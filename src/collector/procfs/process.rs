//! One tracked process or thread.
//!
//! A [`ProcessEntity`] is created the first time its id is discovered and then
//! refreshed in place every sampling cycle, so pinning overrides survive
//! across cycles. Two layouts are understood:
//!
//! ```text
//! <proc>/<pid>/                  process
//!     cmdline
//!     task/<pid>/stat            record of the process itself
//!     task/<pid>/children        child process ids
//!     task/<tid>/                one directory per thread
//!
//! <proc>/<owner>/task/<tid>/     thread of <owner>
//!     cmdline
//!     stat
//!     children
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::trace;

use crate::collector::affinity::{AffinityError, AffinityErrorKind, CpuAffinity, NumaTopology};
use crate::collector::procfs::Pid;
use crate::collector::procfs::cpu_time::CpuPeriod;
use crate::collector::procfs::parser::{
    ProcessRecord, RecordError, owner_from_task_path, parse_cmdline, parse_pid_list,
    pid_from_path, read_process_record, task_dir,
};
use crate::collector::procfs::tree::Credentials;
use crate::collector::traits::FileSystem;

/// Kernel thread flag, from `linux/sched.h`.
const PF_KTHREAD: u32 = 0x0020_0000;

/// Everything an entity needs from its tree during a refresh.
pub struct RefreshContext<'a, F: FileSystem> {
    pub fs: &'a F,
    pub proc_path: &'a Path,
    pub period: &'a dyn CpuPeriod,
    pub topology: &'a NumaTopology,
    pub credentials: Credentials,
}

/// A tracked process or thread.
#[derive(Debug, Clone)]
pub struct ProcessEntity {
    pid: Pid,
    path: PathBuf,
    /// Reached through its owner's `task/` directory.
    task: bool,
    /// Whether `<proc>/<pid>` existed when the entity was created.
    standalone: bool,
    thread: bool,
    effective_ppid: Pid,
    owner_uid: u32,
    migratable: bool,
    record: ProcessRecord,
    cmdline: String,
    /// utime + stime at the previous refresh.
    last_times: Option<u64>,
    cpu_use: f64,
    children: BTreeSet<Pid>,
    tasks: BTreeSet<Pid>,
    observed_node: usize,
    pinned_processor: Option<usize>,
    pinned_numa_node: Option<usize>,
    last_update: Instant,
}

/// Flat view of an entity for machine-readable output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySummary {
    pub pid: Pid,
    pub ppid: Pid,
    pub state: char,
    pub thread: bool,
    pub processor: usize,
    pub numa_node: usize,
    pub cpu_use: f64,
    pub migratable: bool,
    pub cmdline: String,
}

impl ProcessEntity {
    /// Creates and refreshes the entity for `pid`.
    ///
    /// `path` defaults to `<proc>/<pid>`; threads pass their owner-relative
    /// `<proc>/<owner>/task/<tid>` path instead.
    pub fn new<F: FileSystem>(
        pid: Pid,
        path: Option<PathBuf>,
        ctx: &RefreshContext<'_, F>,
    ) -> Result<Self, RecordError> {
        let standalone_path = ctx.proc_path.join(pid.to_string());
        let standalone = ctx.fs.is_dir(&standalone_path);
        let path = path.unwrap_or(standalone_path);
        let task = owner_from_task_path(&path).is_some();

        // A missing cmdline (kernel threads, races) is not fatal.
        let cmdline = ctx
            .fs
            .read_to_string(&path.join("cmdline"))
            .map(|content| parse_cmdline(&content))
            .unwrap_or_default();

        let mut entity = Self {
            pid,
            path,
            task,
            standalone,
            thread: !standalone,
            effective_ppid: 0,
            owner_uid: 0,
            migratable: false,
            record: ProcessRecord::default(),
            cmdline,
            last_times: None,
            cpu_use: 0.0,
            children: BTreeSet::new(),
            tasks: BTreeSet::new(),
            observed_node: 0,
            pinned_processor: None,
            pinned_numa_node: None,
            last_update: Instant::now(),
        };
        entity.refresh_inner(ctx, true)?;
        Ok(entity)
    }

    /// Re-reads the record, usage, relations and ownership of the entity.
    ///
    /// On error nothing is modified.
    pub fn refresh<F: FileSystem>(
        &mut self,
        ctx: &RefreshContext<'_, F>,
    ) -> Result<(), RecordError> {
        self.refresh_inner(ctx, false)
    }

    fn refresh_inner<F: FileSystem>(
        &mut self,
        ctx: &RefreshContext<'_, F>,
        first: bool,
    ) -> Result<(), RecordError> {
        let dir = task_dir(&self.path, self.pid, self.task);
        let record = read_process_record(ctx.fs, &dir.join("stat"), self.pid)?;
        let owner_uid = ctx
            .fs
            .owner_uid(&self.path)
            .map_err(|source| RecordError::Vanished {
                pid: self.pid,
                source,
            })?;

        let time = record.time();
        self.cpu_use = match self.last_times {
            Some(last) => usage_percent(time.saturating_sub(last), ctx.period.period()),
            None => 0.0,
        };
        self.last_times = Some(time);

        self.thread = record.pgrp != self.pid
            || record.flags & PF_KTHREAD != 0
            || (first && !self.standalone);

        self.effective_ppid = owner_from_task_path(&self.path).unwrap_or(record.ppid);

        self.tasks = if self.task {
            BTreeSet::new()
        } else {
            read_tasks(ctx.fs, &self.path, self.pid)
        };

        self.children = ctx
            .fs
            .read_to_string(&dir.join("children"))
            .map(|content| parse_pid_list(&content))
            .unwrap_or_default()
            .into_iter()
            .filter(|&child| child != self.pid && !self.tasks.contains(&child))
            .collect();

        self.owner_uid = owner_uid;
        self.migratable = if self.pid <= 0 {
            false
        } else {
            ctx.credentials.is_privileged() || owner_uid == ctx.credentials.uid()
        };

        self.observed_node = ctx.topology.node_of_cpu(observed_cpu(&record));
        self.record = record;
        self.last_update = Instant::now();

        trace!(
            pid = self.pid,
            cpu_use = self.cpu_use,
            children = self.children.len(),
            tasks = self.tasks.len(),
            "refreshed"
        );

        Ok(())
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Parent id as reported by the kernel.
    ///
    /// Threads report the parent of their process here.
    pub fn ppid(&self) -> Pid {
        self.record.ppid
    }

    /// Id the entity links under: the owning process for a thread reached
    /// through `task/`, the reported parent otherwise.
    pub fn effective_ppid(&self) -> Pid {
        self.effective_ppid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    pub fn state(&self) -> char {
        self.record.state
    }

    pub fn running(&self) -> bool {
        self.record.state == 'R'
    }

    pub fn priority(&self) -> i64 {
        self.record.priority
    }

    pub fn nice(&self) -> i64 {
        self.record.nice
    }

    /// Pinned CPU if any, otherwise the CPU the entity last ran on.
    pub fn processor(&self) -> usize {
        self.pinned_processor
            .unwrap_or_else(|| observed_cpu(&self.record))
    }

    /// Pinned NUMA node if any, otherwise the node of the last observed CPU.
    pub fn numa_node(&self) -> usize {
        self.pinned_numa_node.unwrap_or(self.observed_node)
    }

    /// CPU usage in percent of one core, in `[0, 100]`.
    pub fn cpu_use(&self) -> f64 {
        self.cpu_use
    }

    pub fn is_thread(&self) -> bool {
        self.thread
    }

    pub fn is_task(&self) -> bool {
        self.task
    }

    pub fn migratable(&self) -> bool {
        self.migratable
    }

    pub fn owner_uid(&self) -> u32 {
        self.owner_uid
    }

    pub fn record(&self) -> &ProcessRecord {
        &self.record
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    /// Scheduled ticks at the last refresh.
    pub fn time(&self) -> u64 {
        self.record.time()
    }

    pub fn children(&self) -> &BTreeSet<Pid> {
        &self.children
    }

    pub fn tasks(&self) -> &BTreeSet<Pid> {
        &self.tasks
    }

    pub fn children_and_tasks(&self) -> impl Iterator<Item = Pid> + '_ {
        self.children.iter().chain(self.tasks.iter()).copied()
    }

    /// Registers `pid` as a child process. Returns false if already related.
    pub fn add_child(&mut self, pid: Pid) -> bool {
        if self.is_related(pid) {
            return false;
        }
        self.children.insert(pid)
    }

    /// Registers `pid` as a thread. Returns false if already related.
    pub fn add_task(&mut self, pid: Pid) -> bool {
        if self.is_related(pid) {
            return false;
        }
        self.tasks.insert(pid)
    }

    fn is_related(&self, pid: Pid) -> bool {
        pid == self.pid || self.children.contains(&pid) || self.tasks.contains(&pid)
    }

    /// Drops relations whose id fails `keep`.
    pub(crate) fn retain_relations(&mut self, mut keep: impl FnMut(Pid) -> bool) {
        self.children.retain(|&pid| keep(pid));
        self.tasks.retain(|&pid| keep(pid));
    }

    /// Restricts the entity to `cpu`.
    pub fn pin_to_cpu<A: CpuAffinity + ?Sized>(
        &mut self,
        cpu: usize,
        affinity: &A,
    ) -> Result<(), AffinityError> {
        if self.pinned_processor == Some(cpu) {
            return Ok(());
        }
        affinity
            .set_affinity(self.pid, &[cpu])
            .map_err(|kind| AffinityError::new(self.pid, kind))?;
        self.pinned_processor = Some(cpu);
        Ok(())
    }

    /// Pins to the last observed CPU unless a CPU override already exists.
    pub fn pin_to_observed_cpu<A: CpuAffinity + ?Sized>(
        &mut self,
        affinity: &A,
    ) -> Result<(), AffinityError> {
        if self.pinned_processor.is_some() {
            return Ok(());
        }
        let cpu = usize::try_from(self.record.processor)
            .map_err(|_| AffinityError::new(self.pid, AffinityErrorKind::InvalidMask))?;
        self.pin_to_cpu(cpu, affinity)
    }

    /// Restricts the entity to the CPUs of `node`.
    pub fn pin_to_numa_node<A: CpuAffinity + ?Sized>(
        &mut self,
        node: usize,
        topology: &NumaTopology,
        affinity: &A,
    ) -> Result<(), AffinityError> {
        if self.pinned_numa_node == Some(node) {
            return Ok(());
        }
        let cpus = topology
            .cpus_of(node)
            .ok_or(AffinityError::new(self.pid, AffinityErrorKind::InvalidMask))?;
        affinity
            .set_affinity(self.pid, cpus)
            .map_err(|kind| AffinityError::new(self.pid, kind))?;
        self.pinned_numa_node = Some(node);
        Ok(())
    }

    /// Pins to the node of the last observed CPU unless a node override exists.
    pub fn pin_to_observed_numa_node<A: CpuAffinity + ?Sized>(
        &mut self,
        topology: &NumaTopology,
        affinity: &A,
    ) -> Result<(), AffinityError> {
        if self.pinned_numa_node.is_some() {
            return Ok(());
        }
        self.pin_to_numa_node(self.observed_node, topology, affinity)
    }

    /// Restores the caller's own affinity mask and clears both overrides.
    ///
    /// The overrides are cleared even when the syscall fails.
    pub fn unpin<A: CpuAffinity + ?Sized>(&mut self, affinity: &A) -> Result<(), AffinityError> {
        if self.pinned_processor.is_none() && self.pinned_numa_node.is_none() {
            return Ok(());
        }
        self.pinned_processor = None;
        self.pinned_numa_node = None;

        affinity
            .own_affinity()
            .and_then(|mask| affinity.set_affinity(self.pid, &mask))
            .map_err(|kind| AffinityError::new(self.pid, kind))
    }

    pub fn pinned_processor(&self) -> Option<usize> {
        self.pinned_processor
    }

    pub fn pinned_numa_node(&self) -> Option<usize> {
        self.pinned_numa_node
    }

    pub fn summary(&self) -> EntitySummary {
        EntitySummary {
            pid: self.pid,
            ppid: self.ppid(),
            state: self.state(),
            thread: self.thread,
            processor: self.processor(),
            numa_node: self.numa_node(),
            cpu_use: self.cpu_use,
            migratable: self.migratable,
            cmdline: self.cmdline.clone(),
        }
    }
}

impl fmt::Display for ProcessEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PID {:>6} PPID {:>6} NODE {:>2} CPU {:>3} ({:.1}%) LWP {:>5} CMDLINE {}",
            self.pid,
            self.ppid(),
            self.numa_node(),
            self.processor(),
            self.cpu_use,
            self.thread,
            self.cmdline
        )
    }
}

fn observed_cpu(record: &ProcessRecord) -> usize {
    usize::try_from(record.processor).unwrap_or(0)
}

/// Percentage of one period spent scheduled.
///
/// Parents can account for more ticks than a period holds, hence the clamp.
fn usage_percent(delta: u64, period: f64) -> f64 {
    let usage = 100.0 * delta as f64 / period;
    if usage.is_finite() {
        usage.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Thread ids listed under `<path>/task`, without `pid` itself.
fn read_tasks<F: FileSystem>(fs: &F, path: &Path, pid: Pid) -> BTreeSet<Pid> {
    let Ok(entries) = fs.read_dir(&path.join("task")) else {
        return BTreeSet::new();
    };
    entries
        .iter()
        .filter(|entry| fs.is_dir(entry))
        .filter_map(|entry| pid_from_path(entry))
        .filter(|&tid| tid != pid)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::{FamilyPids, MockAffinity, MockFs, ProcessFixture};
    use crate::collector::procfs::cpu_time::FixedPeriod;

    struct Env {
        fs: MockFs,
        period: FixedPeriod,
        topology: NumaTopology,
        credentials: Credentials,
    }

    impl Env {
        fn new() -> Self {
            Self {
                fs: MockFs::family_tree(),
                period: FixedPeriod(10.0),
                topology: NumaTopology::from_nodes([(0, vec![0, 1, 2, 3]), (1, vec![4, 5, 6, 7])]),
                credentials: Credentials::new(0),
            }
        }

        fn ctx(&self) -> RefreshContext<'_, MockFs> {
            RefreshContext {
                fs: &self.fs,
                proc_path: Path::new("/proc"),
                period: &self.period,
                topology: &self.topology,
                credentials: self.credentials,
            }
        }
    }

    fn task_path(owner: Pid, tid: Pid) -> PathBuf {
        PathBuf::from(format!("/proc/{owner}/task/{tid}"))
    }

    #[test]
    fn test_entity_process_relations() {
        let env = Env::new();
        let root = ProcessEntity::new(FamilyPids::ROOT, None, &env.ctx()).unwrap();

        assert_eq!(root.pid(), 1);
        assert_eq!(root.path(), Path::new("/proc/1"));
        assert_eq!(root.cmdline(), "root");
        assert!(!root.is_task());
        assert!(!root.is_thread());
        assert_eq!(root.effective_ppid(), 0);
        assert_eq!(root.children().iter().copied().collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(root.tasks().iter().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(root.children_and_tasks().count(), 4);
    }

    #[test]
    fn test_entity_task_has_owner_as_effective_parent() {
        let env = Env::new();
        let task = ProcessEntity::new(
            FamilyPids::TASK1,
            Some(task_path(FamilyPids::ROOT, FamilyPids::TASK1)),
            &env.ctx(),
        )
        .unwrap();

        assert!(task.is_task());
        assert!(task.is_thread());
        assert_eq!(task.ppid(), 0);
        assert_eq!(task.effective_ppid(), FamilyPids::ROOT);
        assert!(task.tasks().is_empty());
        assert_eq!(task.cmdline(), "task1");
    }

    #[test]
    fn test_entity_child_process() {
        let env = Env::new();
        let child = ProcessEntity::new(FamilyPids::CHILD1, None, &env.ctx()).unwrap();
        assert!(!child.is_thread());
        assert_eq!(child.effective_ppid(), FamilyPids::ROOT);
        assert!(child.children().is_empty());
        assert_eq!(child.state(), 'S');
        assert!(!child.running());
        assert_eq!(child.priority(), 20);
        assert_eq!(child.nice(), 0);
    }

    #[test]
    fn test_entity_kernel_thread_flag() {
        let mut env = Env::new();
        let mut kthread = ProcessFixture::new(9, "kworker", 2);
        kthread.flags = PF_KTHREAD;
        env.fs.add_fixture_process("/proc", &kthread);

        let entity = ProcessEntity::new(9, None, &env.ctx()).unwrap();
        assert!(entity.is_thread());
    }

    #[test]
    fn test_entity_missing_standalone_dir_marks_thread_at_creation() {
        let mut env = Env::new();
        let mut orphan = ProcessFixture::new(12, "orphan", 1);
        orphan.pgrp = 12;
        env.fs.add_fixture_task("/proc", 11, &orphan);

        let entity = ProcessEntity::new(12, Some(task_path(11, 12)), &env.ctx()).unwrap();
        assert!(entity.is_thread());
    }

    #[test]
    fn test_entity_missing_records() {
        let env = Env::new();
        let err = ProcessEntity::new(77, None, &env.ctx()).unwrap_err();
        assert!(err.is_transient());

        let mut env = Env::new();
        env.fs.remove("/proc/4/task/4/children");
        env.fs.remove("/proc/4/cmdline");
        let child = ProcessEntity::new(FamilyPids::CHILD1, None, &env.ctx()).unwrap();
        assert!(child.children().is_empty());
        assert_eq!(child.cmdline(), "");
    }

    #[test]
    fn test_entity_malformed_record_is_fatal() {
        let mut env = Env::new();
        env.fs.add_file("/proc/4/task/4/stat", "4 (child1) S 1");
        let err = ProcessEntity::new(FamilyPids::CHILD1, None, &env.ctx()).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_entity_relations_exclude_self_and_tasks() {
        let mut env = Env::new();
        let mut root = ProcessFixture::new(1, "root", 0);
        root.children = vec![1, 2, 4];
        env.fs.add_fixture_process("/proc", &root);

        let mut entity = ProcessEntity::new(1, None, &env.ctx()).unwrap();
        assert_eq!(entity.children().iter().copied().collect::<Vec<_>>(), vec![4]);
        assert!(entity.tasks().contains(&2));

        assert!(!entity.add_child(1));
        assert!(!entity.add_child(2));
        assert!(!entity.add_task(4));
        assert!(entity.add_child(6));
        assert!(!entity.add_child(6));
        assert!(entity.add_task(7));
    }

    #[test]
    fn test_entity_cpu_use() {
        let mut env = Env::new();
        let mut entity = ProcessEntity::new(FamilyPids::CHILD1, None, &env.ctx()).unwrap();
        assert_eq!(entity.cpu_use(), 0.0);
        assert_eq!(entity.time(), 230);

        let mut child = ProcessFixture::new(FamilyPids::CHILD1, "child1", FamilyPids::ROOT);
        child.utime += 5;
        env.fs.add_fixture_process("/proc", &child);
        entity.refresh(&env.ctx()).unwrap();
        assert_eq!(entity.cpu_use(), 50.0);

        child.utime += 1000;
        env.fs.add_fixture_process("/proc", &child);
        entity.refresh(&env.ctx()).unwrap();
        assert_eq!(entity.cpu_use(), 100.0);

        // Counter reset.
        child.utime = 0;
        env.fs.add_fixture_process("/proc", &child);
        entity.refresh(&env.ctx()).unwrap();
        assert_eq!(entity.cpu_use(), 0.0);
    }

    #[test]
    fn test_entity_cpu_use_degenerate_period() {
        let mut env = Env::new();
        env.period = FixedPeriod(0.0);
        let mut entity = ProcessEntity::new(FamilyPids::CHILD1, None, &env.ctx()).unwrap();

        entity.refresh(&env.ctx()).unwrap();
        assert_eq!(entity.cpu_use(), 0.0);

        let mut child = ProcessFixture::new(FamilyPids::CHILD1, "child1", FamilyPids::ROOT);
        child.stime += 3;
        env.fs.add_fixture_process("/proc", &child);
        entity.refresh(&env.ctx()).unwrap();
        assert!(entity.cpu_use().is_finite());
        assert_eq!(entity.cpu_use(), 0.0);
    }

    #[test]
    fn test_entity_failed_refresh_keeps_state() {
        let mut env = Env::new();
        let mut entity = ProcessEntity::new(FamilyPids::CHILD1, None, &env.ctx()).unwrap();
        let before = entity.record().clone();

        env.fs.remove("/proc/4");
        assert!(entity.refresh(&env.ctx()).is_err());
        assert_eq!(entity.record(), &before);
        assert_eq!(entity.cmdline(), "child1");
    }

    #[test]
    fn test_entity_migratable() {
        let mut env = Env::new();
        env.fs.set_owner("/proc/4", 1000);
        env.credentials = Credentials::new(1000);
        let entity = ProcessEntity::new(FamilyPids::CHILD1, None, &env.ctx()).unwrap();
        assert!(entity.migratable());
        assert_eq!(entity.owner_uid(), 1000);

        env.credentials = Credentials::new(1001);
        let entity = ProcessEntity::new(FamilyPids::CHILD1, None, &env.ctx()).unwrap();
        assert!(!entity.migratable());

        env.credentials = Credentials::new(0);
        let entity = ProcessEntity::new(FamilyPids::CHILD1, None, &env.ctx()).unwrap();
        assert!(entity.migratable());
    }

    #[test]
    fn test_entity_pin_to_cpu() {
        let env = Env::new();
        let affinity = MockAffinity::new(8);
        let mut entity = ProcessEntity::new(FamilyPids::CHILD1, None, &env.ctx()).unwrap();
        assert_eq!(entity.processor(), 6);
        assert_eq!(entity.numa_node(), 1);

        entity.pin_to_cpu(2, &affinity).unwrap();
        assert_eq!(entity.processor(), 2);
        assert_eq!(affinity.last_mask(4), Some(vec![2]));

        // Already pinned there: no syscall.
        entity.pin_to_cpu(2, &affinity).unwrap();
        assert_eq!(affinity.calls().len(), 1);

        entity.unpin(&affinity).unwrap();
        assert_eq!(entity.pinned_processor(), None);
        assert_eq!(entity.processor(), 6);
        assert_eq!(affinity.last_mask(4), Some((0..8).collect::<Vec<_>>()));
    }

    #[test]
    fn test_entity_pin_to_observed_cpu_is_idempotent() {
        let env = Env::new();
        let affinity = MockAffinity::default();
        let mut entity = ProcessEntity::new(FamilyPids::CHILD1, None, &env.ctx()).unwrap();

        let cpu = entity.processor();
        let node = entity.numa_node();
        entity.pin_to_observed_cpu(&affinity).unwrap();
        entity.pin_to_observed_cpu(&affinity).unwrap();

        assert_eq!(entity.processor(), cpu);
        assert_eq!(entity.numa_node(), node);
        assert_eq!(affinity.calls(), vec![(4, vec![6])]);
    }

    #[test]
    fn test_entity_pin_to_numa_node() {
        let env = Env::new();
        let affinity = MockAffinity::default();
        let mut entity = ProcessEntity::new(FamilyPids::CHILD2, None, &env.ctx()).unwrap();

        entity
            .pin_to_numa_node(0, &env.topology, &affinity)
            .unwrap();
        assert_eq!(entity.numa_node(), 0);
        assert_eq!(affinity.last_mask(5), Some(vec![0, 1, 2, 3]));

        let err = entity
            .pin_to_numa_node(3, &env.topology, &affinity)
            .unwrap_err();
        assert_eq!(err.kind, AffinityErrorKind::InvalidMask);
        assert_eq!(entity.numa_node(), 0);

        entity.unpin(&affinity).unwrap();
        entity
            .pin_to_observed_numa_node(&env.topology, &affinity)
            .unwrap();
        assert_eq!(entity.pinned_numa_node(), Some(1));
        assert_eq!(affinity.last_mask(5), Some(vec![4, 5, 6, 7]));
    }

    #[test]
    fn test_entity_pin_failure_keeps_override_unset() {
        let env = Env::new();
        let affinity = MockAffinity::default();
        affinity.fail_with(Some(AffinityErrorKind::PermissionDenied));
        let mut entity = ProcessEntity::new(FamilyPids::CHILD1, None, &env.ctx()).unwrap();

        let err = entity.pin_to_cpu(1, &affinity).unwrap_err();
        assert_eq!(err, AffinityError::new(4, AffinityErrorKind::PermissionDenied));
        assert_eq!(entity.pinned_processor(), None);
    }

    #[test]
    fn test_entity_unpin_clears_overrides_on_failure() {
        let env = Env::new();
        let affinity = MockAffinity::default();
        let mut entity = ProcessEntity::new(FamilyPids::CHILD1, None, &env.ctx()).unwrap();

        // Nothing pinned: no syscall.
        entity.unpin(&affinity).unwrap();
        assert!(affinity.calls().is_empty());

        entity.pin_to_cpu(1, &affinity).unwrap();
        affinity.fail_with(Some(AffinityErrorKind::NoSuchProcess));
        let err = entity.unpin(&affinity).unwrap_err();
        assert_eq!(err.kind, AffinityErrorKind::NoSuchProcess);
        assert_eq!(entity.pinned_processor(), None);
        assert_eq!(entity.processor(), 6);
    }

    #[test]
    fn test_entity_display() {
        let env = Env::new();
        let entity = ProcessEntity::new(FamilyPids::CHILD1, None, &env.ctx()).unwrap();
        assert_eq!(
            entity.to_string(),
            "PID      4 PPID      1 NODE  1 CPU   6 (0.0%) LWP false CMDLINE child1"
        );
    }

    #[test]
    fn test_entity_summary_serializes() {
        let env = Env::new();
        let entity = ProcessEntity::new(FamilyPids::ROOT, None, &env.ctx()).unwrap();
        let json = serde_json::to_value(entity.summary()).unwrap();
        assert_eq!(json["pid"], 1);
        assert_eq!(json["cmdline"], "root");
        assert_eq!(json["state"], "S");
    }
}
