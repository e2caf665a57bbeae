//! System-wide CPU time normalizer backed by the aggregate line of `/proc/stat`.
//!
//! Every refresh turns the ten raw counters into a *period*: the average
//! number of ticks one core advanced since the previous refresh. Process CPU
//! usage is the process tick delta divided by that period.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::collector::procfs::parser::{CpuCounters, ParseError, parse_cpu_line};
use crate::collector::traits::FileSystem;

/// Failure to refresh the normalizer. Always fatal for the caller.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("cannot read {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed aggregate cpu line: {0}")]
    Format(String),
}

impl From<ParseError> for AggregateError {
    fn from(e: ParseError) -> Self {
        AggregateError::Format(e.message)
    }
}

/// Anything that can tell how many ticks one core advanced in the last cycle.
pub trait CpuPeriod {
    /// Current normalization period. Always strictly positive.
    fn period(&self) -> f64;
}

/// Constant period, for tests and offline replays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedPeriod(pub f64);

impl CpuPeriod for FixedPeriod {
    fn period(&self) -> f64 {
        self.0
    }
}

/// Number of online logical CPUs, at least one.
pub fn online_cpus() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 { n as usize } else { 1 }
}

/// Last observed aggregate counters and the period derived from them.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuTime {
    cpus: usize,
    counters: CpuCounters,
    idle_total_time: u64,
    system_total_time: u64,
    virt_total_time: u64,
    total_time: u64,
    total_period: u64,
    last_total_time: u64,
    period: f64,
}

impl Default for CpuTime {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuTime {
    /// Creates a normalizer sized for the online CPUs of this machine.
    pub fn new() -> Self {
        Self::with_cpus(online_cpus())
    }

    /// Creates a normalizer for `cpus` logical CPUs.
    ///
    /// A zero count is treated as one.
    pub fn with_cpus(cpus: usize) -> Self {
        let cpus = cpus.max(1);
        Self {
            cpus,
            counters: CpuCounters::default(),
            idle_total_time: 0,
            system_total_time: 0,
            virt_total_time: 0,
            total_time: 0,
            total_period: 1,
            last_total_time: 0,
            period: 1.0 / cpus as f64,
        }
    }

    /// Re-reads the first line of `<proc_path>/stat`.
    pub fn update<F: FileSystem>(
        &mut self,
        fs: &F,
        proc_path: &Path,
    ) -> Result<(), AggregateError> {
        let path = proc_path.join("stat");
        let content = fs
            .read_to_string(&path)
            .map_err(|source| AggregateError::Unreadable {
                path: path.clone(),
                source,
            })?;
        let line = content.lines().next().unwrap_or_default();
        self.update_from_line(line)
    }

    /// Folds one aggregate line into the normalizer.
    ///
    /// The line is fully validated before any state changes.
    pub fn update_from_line(&mut self, line: &str) -> Result<(), AggregateError> {
        let raw = parse_cpu_line(line)?;

        // Guest time is already counted in user and nice.
        let counters = CpuCounters {
            user: raw.user.saturating_sub(raw.guest),
            nice: raw.nice.saturating_sub(raw.guest_nice),
            ..raw
        };

        let idle_total_time = counters.idle.saturating_add(counters.iowait);
        let system_total_time = counters
            .system
            .saturating_add(counters.irq)
            .saturating_add(counters.softirq);
        let virt_total_time = counters.guest.saturating_add(counters.guest_nice);
        let total_time = [
            counters.nice,
            system_total_time,
            idle_total_time,
            counters.steal,
            virt_total_time,
        ]
        .into_iter()
        .fold(counters.user, u64::saturating_add);

        let total_period = if total_time > self.last_total_time {
            total_time - self.last_total_time
        } else {
            1
        };

        self.counters = counters;
        self.idle_total_time = idle_total_time;
        self.system_total_time = system_total_time;
        self.virt_total_time = virt_total_time;
        self.total_time = total_time;
        self.total_period = total_period;
        self.last_total_time = total_time;
        self.period = total_period as f64 / self.cpus as f64;

        Ok(())
    }

    pub fn cpus(&self) -> usize {
        self.cpus
    }

    pub fn user_time(&self) -> u64 {
        self.counters.user
    }

    pub fn nice_time(&self) -> u64 {
        self.counters.nice
    }

    pub fn system_time(&self) -> u64 {
        self.counters.system
    }

    pub fn idle_time(&self) -> u64 {
        self.counters.idle
    }

    pub fn io_wait(&self) -> u64 {
        self.counters.iowait
    }

    pub fn irq(&self) -> u64 {
        self.counters.irq
    }

    pub fn soft_irq(&self) -> u64 {
        self.counters.softirq
    }

    pub fn steal(&self) -> u64 {
        self.counters.steal
    }

    pub fn guest(&self) -> u64 {
        self.counters.guest
    }

    pub fn guest_nice(&self) -> u64 {
        self.counters.guest_nice
    }

    pub fn idle_total_time(&self) -> u64 {
        self.idle_total_time
    }

    pub fn system_total_time(&self) -> u64 {
        self.system_total_time
    }

    pub fn virt_total_time(&self) -> u64 {
        self.virt_total_time
    }

    pub fn total_time(&self) -> u64 {
        self.total_time
    }

    /// Tick delta of the last refresh, never below one.
    pub fn total_period(&self) -> u64 {
        self.total_period
    }

    pub fn last_total_time(&self) -> u64 {
        self.last_total_time
    }
}

impl CpuPeriod for CpuTime {
    fn period(&self) -> f64 {
        self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    const LINE: &str = "cpu  1000 200 300 4000 50 6 7 8 90 10";

    #[test]
    fn test_cpu_time_derived_totals() {
        let mut cpu = CpuTime::with_cpus(4);
        cpu.update_from_line(LINE).unwrap();

        assert_eq!(cpu.user_time(), 910);
        assert_eq!(cpu.nice_time(), 190);
        assert_eq!(cpu.system_time(), 300);
        assert_eq!(cpu.idle_time(), 4000);
        assert_eq!(cpu.io_wait(), 50);
        assert_eq!(cpu.irq(), 6);
        assert_eq!(cpu.soft_irq(), 7);
        assert_eq!(cpu.steal(), 8);
        assert_eq!(cpu.guest(), 90);
        assert_eq!(cpu.guest_nice(), 10);

        assert_eq!(cpu.idle_total_time(), 4050);
        assert_eq!(cpu.system_total_time(), 313);
        assert_eq!(cpu.virt_total_time(), 100);
        assert_eq!(cpu.total_time(), 910 + 190 + 313 + 4050 + 8 + 100);
        assert_eq!(cpu.total_period(), cpu.total_time());
        assert_eq!(cpu.last_total_time(), cpu.total_time());
        assert_eq!(cpu.period(), cpu.total_time() as f64 / 4.0);
    }

    #[test]
    fn test_cpu_time_period_is_delta_per_core() {
        let mut cpu = CpuTime::with_cpus(2);
        cpu.update_from_line("cpu  100 0 0 100 0 0 0 0 0 0").unwrap();
        cpu.update_from_line("cpu  150 0 0 250 0 0 0 0 0 0").unwrap();

        assert_eq!(cpu.total_period(), 200);
        assert_eq!(cpu.period(), 100.0);
    }

    #[test]
    fn test_cpu_time_stalled_counter_keeps_period_positive() {
        let mut cpu = CpuTime::with_cpus(8);
        cpu.update_from_line(LINE).unwrap();
        cpu.update_from_line(LINE).unwrap();
        assert_eq!(cpu.total_period(), 1);
        assert!(cpu.period() > 0.0);

        // Wrapped counters go backwards.
        cpu.update_from_line("cpu  1 0 0 1 0 0 0 0 0 0").unwrap();
        assert_eq!(cpu.total_period(), 1);
        assert_eq!(cpu.period(), 1.0 / 8.0);
    }

    #[test]
    fn test_cpu_time_initial_period_positive() {
        let cpu = CpuTime::with_cpus(0);
        assert_eq!(cpu.cpus(), 1);
        assert_eq!(cpu.period(), 1.0);
        assert!(CpuTime::new().period() > 0.0);
    }

    #[test]
    fn test_cpu_time_guest_larger_than_user_saturates() {
        let mut cpu = CpuTime::with_cpus(1);
        cpu.update_from_line("cpu  5 1 0 0 0 0 0 0 10 4").unwrap();
        assert_eq!(cpu.user_time(), 0);
        assert_eq!(cpu.nice_time(), 0);
    }

    #[test]
    fn test_cpu_time_huge_counters_saturate() {
        let mut cpu = CpuTime::with_cpus(1);
        cpu.update_from_line("cpu  18446744073709551615 0 0 1 0 0 0 0 0 0")
            .unwrap();
        assert_eq!(cpu.total_time(), u64::MAX);
        assert!(cpu.period() > 0.0);

        cpu.update_from_line("cpu  18446744073709551615 9 9 9 9 9 9 9 9 9")
            .unwrap();
        assert_eq!(cpu.total_time(), u64::MAX);
        assert_eq!(cpu.total_period(), 1);
        assert!(cpu.period() > 0.0);
    }

    #[test]
    fn test_cpu_time_malformed_line_leaves_state() {
        let mut cpu = CpuTime::with_cpus(4);
        cpu.update_from_line(LINE).unwrap();
        let before = cpu.clone();

        for line in [
            "cpu  1 2 3 4 5 6 7 8 9",
            "cpu  1 2 3 4 5 6 7 8 9 10 11",
            "ctxt 1 2 3 4 5 6 7 8 9 10",
            "",
        ] {
            let err = cpu.update_from_line(line).unwrap_err();
            assert!(matches!(err, AggregateError::Format(_)), "{line:?}");
        }

        assert_eq!(cpu, before);
    }

    #[test]
    fn test_cpu_time_update_reads_first_line() {
        let mut fs = MockFs::new();
        fs.add_file(
            "/proc/stat",
            "cpu  100 0 0 100 0 0 0 0 0 0\ncpu0 100 0 0 100 0 0 0 0 0 0\nintr 1\n",
        );

        let mut cpu = CpuTime::with_cpus(1);
        cpu.update(&fs, Path::new("/proc")).unwrap();
        assert_eq!(cpu.total_time(), 200);
    }

    #[test]
    fn test_cpu_time_update_missing_file() {
        let fs = MockFs::new();
        let mut cpu = CpuTime::with_cpus(1);
        let err = cpu.update(&fs, Path::new("/proc")).unwrap_err();
        assert!(matches!(err, AggregateError::Unreadable { .. }));
    }

    #[test]
    fn test_fixed_period() {
        assert_eq!(FixedPeriod(2.5).period(), 2.5);
    }
}
