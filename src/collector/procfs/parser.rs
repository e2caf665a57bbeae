//! Parsers for `/proc` filesystem files.
//!
//! These are pure functions that parse the content of various `/proc` files
//! into structured data. They are designed to be easily testable with string inputs.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::sched::CpuSet;
use serde::Serialize;
use thiserror::Error;

use crate::collector::procfs::Pid;
use crate::collector::traits::FileSystem;

/// Number of fields following the `(comm)` field of `/proc/[pid]/stat`.
pub const STAT_FIELDS_AFTER_COMM: usize = 50;

/// Number of counters following the `cpu` marker of the `/proc/stat` aggregate line.
pub const CPU_LINE_FIELDS: usize = 10;

/// Error type for generic parsing failures.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("parse error: {message}")]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

/// Failure to read or trust one per-entity stat record.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The record could not be opened: the entity exited.
    #[error("process {pid} vanished: {source}")]
    Vanished {
        pid: Pid,
        #[source]
        source: io::Error,
    },

    /// The record belongs to another id (the pid was reused mid-read).
    #[error("stat record for {expected} reports pid {found}")]
    PidMismatch { expected: Pid, found: Pid },

    /// The record does not have the expected layout.
    #[error("malformed stat record for {pid}: {reason}")]
    Format { pid: Pid, reason: String },
}

impl RecordError {
    /// Whether the failure is routine churn (entity gone or replaced)
    /// rather than a malformed source.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Vanished { .. } | Self::PidMismatch { .. })
    }

    fn format(pid: Pid, reason: impl Into<String>) -> Self {
        Self::Format {
            pid,
            reason: reason.into(),
        }
    }
}

/// Parsed data from `/proc/[pid]/stat` (or `/proc/[pid]/task/[tid]/stat`).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub pid: Pid,
    pub comm: String,
    pub state: char,
    pub ppid: Pid,
    pub pgrp: i32,
    pub session: i32,
    pub tty_nr: i32,
    pub tpgid: i32,
    pub flags: u32,
    pub minflt: u64,
    pub cminflt: u64,
    pub majflt: u64,
    pub cmajflt: u64,
    pub utime: u64,
    pub stime: u64,
    pub cutime: i64,
    pub cstime: i64,
    pub priority: i64,
    pub nice: i64,
    pub num_threads: i64,
    pub itrealvalue: i64,
    pub starttime: u64,
    pub vsize: u64,
    pub rss: i64,
    pub rsslim: u64,
    pub startcode: u64,
    pub endcode: u64,
    pub startstack: u64,
    pub kstkesp: u64,
    pub kstkeip: u64,
    pub signal: u64,
    pub blocked: u64,
    pub sigignore: u64,
    pub sigcatch: u64,
    pub wchan: u64,
    pub nswap: u64,
    pub cnswap: u64,
    pub exit_signal: i32,
    pub processor: i32,
    pub rt_priority: u32,
    pub policy: u32,
    pub delayacct_blkio_ticks: u64,
    pub guest_time: u64,
    pub cguest_time: i64,
    pub start_data: u64,
    pub end_data: u64,
    pub start_brk: u64,
    pub arg_start: u64,
    pub arg_end: u64,
    pub env_start: u64,
    pub env_end: u64,
    pub exit_code: i32,
}

impl ProcessRecord {
    /// Scheduled ticks in user and kernel mode.
    pub fn time(&self) -> u64 {
        self.utime.saturating_add(self.stime)
    }
}

/// Whitespace-split fields after the `(comm)` field.
struct StatFields<'a> {
    pid: Pid,
    values: Vec<&'a str>,
}

impl StatFields<'_> {
    fn get<T: FromStr>(&self, idx: usize, name: &str) -> Result<T, RecordError> {
        let raw = self
            .values
            .get(idx)
            .ok_or_else(|| RecordError::format(self.pid, format!("missing field {name}")))?;
        raw.parse()
            .map_err(|_| RecordError::format(self.pid, format!("invalid {name}: {raw:?}")))
    }
}

/// Parses `/proc/[pid]/stat` content and checks it belongs to `expected`.
///
/// The comm field can contain spaces and parentheses, so it spans from the
/// first `(` to the last `)`. Trailing blanks inside the parentheses are dropped.
pub fn parse_process_record(content: &str, expected: Pid) -> Result<ProcessRecord, RecordError> {
    let content = content.trim();

    let open_paren = content
        .find('(')
        .ok_or_else(|| RecordError::format(expected, "missing '('"))?;
    let close_paren = content
        .rfind(')')
        .ok_or_else(|| RecordError::format(expected, "missing ')'"))?;

    if close_paren <= open_paren {
        return Err(RecordError::format(expected, "invalid parentheses"));
    }

    let pid: Pid = content[..open_paren]
        .trim()
        .parse()
        .map_err(|_| RecordError::format(expected, "invalid pid"))?;

    if pid != expected {
        return Err(RecordError::PidMismatch {
            expected,
            found: pid,
        });
    }

    let comm = content[open_paren + 1..close_paren].trim_end().to_string();

    let values: Vec<&str> = content[close_paren + 1..].split_whitespace().collect();
    if values.len() != STAT_FIELDS_AFTER_COMM {
        return Err(RecordError::format(
            pid,
            format!(
                "expected {} fields after comm, got {}",
                STAT_FIELDS_AFTER_COMM,
                values.len()
            ),
        ));
    }

    let fields = StatFields { pid, values };
    let state = fields.values[0]
        .chars()
        .next()
        .ok_or_else(|| RecordError::format(pid, "empty state"))?;

    Ok(ProcessRecord {
        pid,
        comm,
        state,
        ppid: fields.get(1, "ppid")?,
        pgrp: fields.get(2, "pgrp")?,
        session: fields.get(3, "session")?,
        tty_nr: fields.get(4, "tty_nr")?,
        tpgid: fields.get(5, "tpgid")?,
        flags: fields.get(6, "flags")?,
        minflt: fields.get(7, "minflt")?,
        cminflt: fields.get(8, "cminflt")?,
        majflt: fields.get(9, "majflt")?,
        cmajflt: fields.get(10, "cmajflt")?,
        utime: fields.get(11, "utime")?,
        stime: fields.get(12, "stime")?,
        cutime: fields.get(13, "cutime")?,
        cstime: fields.get(14, "cstime")?,
        priority: fields.get(15, "priority")?,
        nice: fields.get(16, "nice")?,
        num_threads: fields.get(17, "num_threads")?,
        itrealvalue: fields.get(18, "itrealvalue")?,
        starttime: fields.get(19, "starttime")?,
        vsize: fields.get(20, "vsize")?,
        rss: fields.get(21, "rss")?,
        rsslim: fields.get(22, "rsslim")?,
        startcode: fields.get(23, "startcode")?,
        endcode: fields.get(24, "endcode")?,
        startstack: fields.get(25, "startstack")?,
        kstkesp: fields.get(26, "kstkesp")?,
        kstkeip: fields.get(27, "kstkeip")?,
        signal: fields.get(28, "signal")?,
        blocked: fields.get(29, "blocked")?,
        sigignore: fields.get(30, "sigignore")?,
        sigcatch: fields.get(31, "sigcatch")?,
        wchan: fields.get(32, "wchan")?,
        nswap: fields.get(33, "nswap")?,
        cnswap: fields.get(34, "cnswap")?,
        exit_signal: fields.get(35, "exit_signal")?,
        processor: fields.get(36, "processor")?,
        rt_priority: fields.get(37, "rt_priority")?,
        policy: fields.get(38, "policy")?,
        delayacct_blkio_ticks: fields.get(39, "delayacct_blkio_ticks")?,
        guest_time: fields.get(40, "guest_time")?,
        cguest_time: fields.get(41, "cguest_time")?,
        start_data: fields.get(42, "start_data")?,
        end_data: fields.get(43, "end_data")?,
        start_brk: fields.get(44, "start_brk")?,
        arg_start: fields.get(45, "arg_start")?,
        arg_end: fields.get(46, "arg_end")?,
        env_start: fields.get(47, "env_start")?,
        env_end: fields.get(48, "env_end")?,
        exit_code: fields.get(49, "exit_code")?,
    })
}

/// Reads and parses the stat record at `path`.
///
/// A record that cannot be opened is reported as [`RecordError::Vanished`].
pub fn read_process_record<F: FileSystem>(
    fs: &F,
    path: &Path,
    pid: Pid,
) -> Result<ProcessRecord, RecordError> {
    let content = fs
        .read_to_string(path)
        .map_err(|source| RecordError::Vanished { pid, source })?;
    parse_process_record(&content, pid)
}

/// Raw counters of the aggregate `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuCounters {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
}

/// Parses the aggregate `cpu` line of `/proc/stat`.
///
/// The line must start with a `cpu` marker followed by exactly ten counters.
pub fn parse_cpu_line(line: &str) -> Result<CpuCounters, ParseError> {
    let mut parts = line.split_whitespace();

    let marker = parts
        .next()
        .ok_or_else(|| ParseError::new("empty cpu line"))?;
    if !marker.starts_with("cpu") {
        return Err(ParseError::new(format!("invalid cpu marker: {marker:?}")));
    }

    let values = parts
        .map(|s| {
            s.parse::<u64>()
                .map_err(|_| ParseError::new(format!("invalid cpu counter: {s:?}")))
        })
        .collect::<Result<Vec<u64>, ParseError>>()?;

    if values.len() != CPU_LINE_FIELDS {
        return Err(ParseError::new(format!(
            "expected {} cpu counters, got {}",
            CPU_LINE_FIELDS,
            values.len()
        )));
    }

    Ok(CpuCounters {
        user: values[0],
        nice: values[1],
        system: values[2],
        idle: values[3],
        iowait: values[4],
        irq: values[5],
        softirq: values[6],
        steal: values[7],
        guest: values[8],
        guest_nice: values[9],
    })
}

/// Parses a whitespace-separated id list such as `/proc/[pid]/task/[tid]/children`.
///
/// Parsing stops at the first token that is not an id.
pub fn parse_pid_list(content: &str) -> Vec<Pid> {
    content
        .split_whitespace()
        .map_while(|s| s.parse().ok())
        .collect()
}

/// Parses `/proc/[pid]/cmdline` content.
///
/// Arguments are separated by NUL bytes on Linux; fixtures may use whitespace.
/// Tokens are joined with single spaces and trailing whitespace is dropped.
pub fn parse_cmdline(content: &str) -> String {
    content
        .split(|c: char| c == '\0' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses a sysfs cpu list such as `0-3,8,10-11`.
///
/// Ids outside what a `cpu_set_t` can hold are skipped.
pub fn parse_cpu_list(s: &str) -> Vec<usize> {
    let limit = CpuSet::count();
    let mut result = Vec::new();
    for part in s.trim().split(',') {
        let part = part.trim();
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(s), Ok(e)) = (start.parse::<usize>(), end.parse::<usize>())
                && e < limit
            {
                result.extend(s..=e);
            }
        } else if let Ok(n) = part.parse::<usize>()
            && n < limit
        {
            result.push(n);
        }
    }
    result
}

/// Extracts the numeric name of a `/proc` entry, e.g. `/proc/1234` -> `1234`.
pub fn pid_from_path(path: &Path) -> Option<Pid> {
    path.file_name()?.to_str()?.parse().ok()
}

/// Returns the owner id of a task directory `<proc>/<owner>/task/<tid>`.
pub fn owner_from_task_path(path: &Path) -> Option<Pid> {
    let task_dir = path.parent()?;
    if task_dir.file_name()? != "task" {
        return None;
    }
    pid_from_path(task_dir.parent()?)
}

/// Directory of `pid`'s stat and children records.
///
/// For a process this is `<dir>/task/<pid>`; a task path already is one.
pub fn task_dir(path: &Path, pid: Pid, is_task: bool) -> PathBuf {
    if is_task {
        path.to_path_buf()
    } else {
        path.join("task").join(pid.to_string())
    }
}
