//! End-to-end sampling against a `/proc` layout written to disk.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use proctree::collector::mock::{AGGREGATE_STAT, MockAffinity, ProcessFixture};
use proctree::collector::{Credentials, ProcessTree, RealFs, TreeError, TreeOptions};

struct DiskProc {
    _dir: TempDir,
    proc_path: PathBuf,
}

impl DiskProc {
    /// Root 1 with threads 2 and 3, children 4 and 5.
    fn family() -> Self {
        let dir = TempDir::new().unwrap();
        let proc_path = dir.path().join("proc");
        fs::create_dir_all(&proc_path).unwrap();
        fs::write(proc_path.join("stat"), AGGREGATE_STAT).unwrap();

        let mut root = ProcessFixture::new(1, "root", 0);
        root.children = vec![4, 5];
        write_process(&proc_path, &root, "root   \n");

        for tid in [2, 3] {
            let mut task = ProcessFixture::new(tid, &format!("task{tid}"), 0);
            task.pgrp = 1;
            write_task(&proc_path, 1, &task);
        }

        write_process(
            &proc_path,
            &ProcessFixture::new(4, "sleep", 1),
            "/bin/sleep\u{0}100\u{0}",
        );
        write_process(&proc_path, &ProcessFixture::new(5, "child2", 1), "child2\n");

        Self {
            _dir: dir,
            proc_path,
        }
    }

    fn options(&self) -> TreeOptions {
        TreeOptions::default()
            .with_proc_path(&self.proc_path)
            .with_node_path(self.proc_path.join("no-such-node-dir"))
            .with_credentials(Credentials::new(0))
            .with_cpus(4)
    }

    fn tree(&self) -> ProcessTree<RealFs, MockAffinity> {
        ProcessTree::with_options(RealFs::new(), MockAffinity::default(), self.options()).unwrap()
    }
}

fn write_process(proc_path: &Path, process: &ProcessFixture, cmdline: &str) {
    let base = proc_path.join(process.pid.to_string());
    let task = base.join("task").join(process.pid.to_string());
    fs::create_dir_all(&task).unwrap();
    fs::write(base.join("cmdline"), cmdline).unwrap();
    fs::write(task.join("stat"), process.stat_line()).unwrap();
    fs::write(task.join("children"), process.children_line()).unwrap();
}

fn write_task(proc_path: &Path, owner: i32, task: &ProcessFixture) {
    let base = proc_path
        .join(owner.to_string())
        .join("task")
        .join(task.pid.to_string());
    fs::create_dir_all(&base).unwrap();
    fs::write(base.join("stat"), task.stat_line()).unwrap();
    fs::write(base.join("children"), task.children_line()).unwrap();
}

fn ids(set: impl IntoIterator<Item = i32>) -> Vec<i32> {
    set.into_iter().collect()
}

#[test]
fn test_full_scan_links_children_and_tasks() {
    let proc = DiskProc::family();
    let tree = proc.tree();

    assert_eq!(tree.size(), 5);
    assert_eq!(ids(tree.children(1)), vec![4, 5]);
    assert_eq!(ids(tree.tasks(1)), vec![2, 3]);
    assert!(tree.is_thread(2).unwrap());
    assert!(!tree.is_thread(4).unwrap());
    assert_eq!(tree.find(3).unwrap().effective_ppid(), 1);
}

#[test]
fn test_cmdline_is_normalized() {
    let proc = DiskProc::family();
    let tree = proc.tree();

    assert_eq!(tree.cmdline(1).unwrap(), "root");
    assert_eq!(tree.cmdline(4).unwrap(), "/bin/sleep 100");
    assert_eq!(tree.cmdline(2).unwrap(), "");
}

#[test]
fn test_records_survive_disk_round_trip() {
    let proc = DiskProc::family();
    let tree = proc.tree();

    let record = tree.record(5).unwrap();
    assert_eq!(record.pid, 5);
    assert_eq!(record.comm, "child2");
    assert_eq!(record.ppid, 1);
    assert_eq!(record.utime, 142);
    assert_eq!(record.stime, 88);
    assert_eq!(tree.processor(5).unwrap(), 6);
}

#[test]
fn test_vanished_process_is_retired() {
    let proc = DiskProc::family();
    let mut tree = proc.tree();

    fs::remove_dir_all(proc.proc_path.join("5")).unwrap();
    fs::write(proc.proc_path.join("1/task/1/children"), "4 ").unwrap();

    let stats = tree.update().unwrap();
    assert_eq!(stats.retired, 1);
    assert_eq!(tree.size(), 4);
    assert!(!tree.alive(5));
    assert_eq!(ids(tree.children(1)), vec![4]);
    assert!(tree.get(5).is_none());
}

#[test]
fn test_subtree_mode_from_child() {
    let proc = DiskProc::family();
    let tree =
        ProcessTree::with_options(RealFs::new(), MockAffinity::default(), proc.options().with_root(4))
            .unwrap();

    assert_eq!(tree.root(), 4);
    assert_eq!(tree.size(), 1);
    assert!(!tree.alive(1));
}

#[test]
fn test_missing_root_in_subtree_mode() {
    let proc = DiskProc::family();
    let result =
        ProcessTree::with_options(RealFs::new(), MockAffinity::default(), proc.options().with_root(77));

    assert!(matches!(result, Err(TreeError::InvalidRoot(77))));
}

#[test]
fn test_invalid_proc_path() {
    let dir = TempDir::new().unwrap();
    let options = TreeOptions::default()
        .with_proc_path(dir.path().join("missing"))
        .with_credentials(Credentials::new(0))
        .with_cpus(4);

    let result = ProcessTree::with_options(RealFs::new(), MockAffinity::default(), options);
    assert!(matches!(result, Err(TreeError::InvalidProcPath(_))));
}

#[test]
fn test_pin_records_observed_cpu() {
    let proc = DiskProc::family();
    let mut tree = proc.tree();

    tree.pin_to_cpu(4, 2).unwrap();
    assert_eq!(tree.processor(4).unwrap(), 2);

    tree.unpin(4).unwrap();
    assert_eq!(tree.processor(4).unwrap(), 6);
}
