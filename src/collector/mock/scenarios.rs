//! Pre-built mock filesystem scenarios for testing.
//!
//! These scenarios provide `/proc` layouts with processes, their threads
//! and children, laid out the way the kernel exposes them.

use std::path::Path;

use super::filesystem::MockFs;
use crate::collector::procfs::Pid;

/// Aggregate line used by the scenarios.
pub const AGGREGATE_STAT: &str = "cpu  10000 500 3000 80000 1000 200 100 0 0 0\n";

/// Values written to one synthetic `stat` record.
///
/// Fields not listed here are fixed to plausible constants.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessFixture {
    pub pid: Pid,
    pub name: String,
    pub state: char,
    pub ppid: Pid,
    pub pgrp: i32,
    pub flags: u32,
    pub utime: u64,
    pub stime: u64,
    pub priority: i64,
    pub nice: i64,
    pub processor: i32,
    pub children: Vec<Pid>,
}

impl Default for ProcessFixture {
    fn default() -> Self {
        Self {
            pid: 123456789,
            name: "my-mock-pid".into(),
            state: 'S',
            ppid: 4456,
            pgrp: 4487,
            flags: 4194304,
            utime: 142,
            stime: 88,
            priority: 20,
            nice: 0,
            processor: 6,
            children: Vec::new(),
        }
    }
}

impl ProcessFixture {
    /// Creates a fixture for `pid` leading its own process group.
    pub fn new(pid: Pid, name: &str, ppid: Pid) -> Self {
        Self {
            pid,
            name: name.into(),
            ppid,
            pgrp: pid,
            ..Self::default()
        }
    }

    /// Formats the record as `/proc/[pid]/stat` would.
    pub fn stat_line(&self) -> String {
        format!(
            "{} ({}) {} {} {} 4487 34816 13349 {} 48695 385441 77 353 {} {} 486 406 {} {} 1 0 29218 \
             23072768 3432 184467440737095 94317919137792 94317919912838 140733960279152 0 0 0 2 \
             3686400 134295555 1 0 0 17 {} 0 0 0 0 0 94317920029408 94317920058604 94317926449152 \
             140733960280484 140733960280488 140733960280488 140733960282091 0\n",
            self.pid,
            self.name,
            self.state,
            self.ppid,
            self.pgrp,
            self.flags,
            self.utime,
            self.stime,
            self.priority,
            self.nice,
            self.processor,
        )
    }

    /// Formats the children listing, one trailing space per id.
    pub fn children_line(&self) -> String {
        self.children.iter().map(|child| format!("{child} ")).collect()
    }
}

/// Ids used by [`MockFs::family_tree`].
#[derive(Debug, Clone, Copy)]
pub struct FamilyPids;

impl FamilyPids {
    pub const ROOT: Pid = 1;
    pub const TASK1: Pid = 2;
    pub const TASK2: Pid = 3;
    pub const CHILD1: Pid = 4;
    pub const CHILD2: Pid = 5;
}

impl MockFs {
    /// Writes a process at `<proc>/<pid>`.
    ///
    /// The stat and children records go into `<proc>/<pid>/task/<pid>`.
    pub fn add_fixture_process(&mut self, proc_path: impl AsRef<Path>, process: &ProcessFixture) {
        let base = proc_path.as_ref().join(process.pid.to_string());
        let task = base.join("task").join(process.pid.to_string());
        self.add_dir(&base);
        self.add_file(base.join("cmdline"), format!("{}\n", process.name));
        self.add_file(task.join("stat"), process.stat_line());
        self.add_file(task.join("children"), process.children_line());
    }

    /// Writes a thread of `owner` at `<proc>/<owner>/task/<tid>`.
    pub fn add_fixture_task(
        &mut self,
        proc_path: impl AsRef<Path>,
        owner: Pid,
        task: &ProcessFixture,
    ) {
        let base = proc_path
            .as_ref()
            .join(owner.to_string())
            .join("task")
            .join(task.pid.to_string());
        self.add_dir(&base);
        self.add_file(base.join("cmdline"), format!("{}\n", task.name));
        self.add_file(base.join("stat"), task.stat_line());
        self.add_file(base.join("children"), task.children_line());
    }

    /// Creates a small family under `/proc`.
    ///
    /// Root (1) owns two threads (2, 3) and has two child processes (4, 5).
    pub fn family_tree() -> Self {
        let mut fs = Self::new();
        let proc_path = Path::new("/proc");
        fs.add_file(proc_path.join("stat"), AGGREGATE_STAT);

        for (pid, name, ppid) in family_members() {
            let mut process = ProcessFixture::new(pid, name, ppid);
            match pid {
                FamilyPids::ROOT => {
                    process.children = vec![FamilyPids::CHILD1, FamilyPids::CHILD2];
                    fs.add_fixture_process(proc_path, &process);
                }
                FamilyPids::TASK1 | FamilyPids::TASK2 => {
                    process.pgrp = FamilyPids::ROOT;
                    fs.add_fixture_task(proc_path, FamilyPids::ROOT, &process);
                }
                _ => fs.add_fixture_process(proc_path, &process),
            }
        }

        fs
    }

    /// Rewrites the aggregate line of `<proc>/stat`.
    pub fn set_aggregate(&mut self, proc_path: impl AsRef<Path>, line: &str) {
        self.add_file(proc_path.as_ref().join("stat"), format!("{line}\n"));
    }
}

fn family_members() -> [(Pid, &'static str, Pid); 5] {
    [
        (FamilyPids::ROOT, "root", 0),
        (FamilyPids::TASK1, "task1", 0),
        (FamilyPids::TASK2, "task2", 0),
        (FamilyPids::CHILD1, "child1", FamilyPids::ROOT),
        (FamilyPids::CHILD2, "child2", FamilyPids::ROOT),
    ]
}
