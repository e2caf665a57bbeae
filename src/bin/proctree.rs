//! proctree - process tree sampler.
//!
//! Samples a process (or the whole system) at a fixed interval and reports
//! per-process and per-thread CPU usage, optionally pinning the root process
//! to the CPU it was observed on for the duration of the run.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use proctree::collector::{
    DEFAULT_NODE_PATH, DEFAULT_PROC_PATH, DEFAULT_ROOT, EntitySummary, Pid, ProcessTree, RealFs,
    SchedAffinity, TreeError, TreeOptions,
};

/// Process tree sampler with CPU usage and affinity pinning.
#[derive(Parser)]
#[command(name = "proctree", about = "Process tree sampler", version)]
struct Args {
    /// Root process id. Pid 1 scans the whole system.
    #[arg(short, long, default_value_t = DEFAULT_ROOT)]
    pid: Pid,

    /// Path to /proc filesystem (for testing/mocking).
    #[arg(long, default_value = DEFAULT_PROC_PATH)]
    proc_path: String,

    /// Path to the sysfs NUMA node directory.
    #[arg(long, default_value = DEFAULT_NODE_PATH)]
    node_path: String,

    /// Sampling interval in seconds (e.g., "1", "0.5").
    #[arg(short, long, default_value = "1", value_parser = parse_seconds)]
    interval: Duration,

    /// Stop after this many seconds. Runs until interrupted when omitted.
    #[arg(short, long, value_parser = parse_seconds)]
    duration: Option<Duration>,

    /// Only report entities using at least this percentage of one CPU.
    #[arg(short = 't', long, default_value = "0")]
    cpu_threshold: f64,

    /// Pin the root process to its current CPU; everything is unpinned on exit.
    #[arg(long)]
    pin: bool,

    /// Print the whole tree after every sample.
    #[arg(long, conflicts_with = "json")]
    tree: bool,

    /// Emit one JSON object per sample.
    #[arg(long)]
    json: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("cannot serialize sample: {0}")]
    Json(#[from] serde_json::Error),
}

/// One line of `--json` output.
#[derive(Serialize)]
struct Sample<'a> {
    timestamp: String,
    sample: u64,
    root: Pid,
    entities: usize,
    processes: &'a [EntitySummary],
}

/// Parses a positive number of seconds into a duration.
fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("invalid number of seconds: {s}"))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("seconds must be positive: {s}"));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Initializes tracing subscriber with the specified verbosity level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = format!("proctree={}", level).parse() {
        filter = filter.add_directive(directive);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), CliError> {
    let options = TreeOptions::default()
        .with_root(args.pid)
        .with_proc_path(&args.proc_path)
        .with_node_path(&args.node_path);
    let mut tree = ProcessTree::with_options(RealFs::new(), SchedAffinity, options)?;

    info!(
        "Tracking {} entities from pid {} ({})",
        tree.size(),
        tree.root(),
        if tree.root() == DEFAULT_ROOT {
            "full scan"
        } else {
            "subtree"
        }
    );

    if args.pin {
        match tree.pin_to_observed_cpu(args.pid) {
            Ok(()) => info!(
                "Pinned pid {} to CPU {}",
                args.pid,
                tree.processor(args.pid)?
            ),
            Err(e) => warn!("Pinning failed: {}", e),
        }
    }

    // Setup graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let started = Instant::now();
    let mut sample_count: u64 = 0;
    let mut result = Ok(());

    while running.load(Ordering::SeqCst) {
        // Sleep with periodic checks for shutdown signal
        let sleep_interval = Duration::from_millis(100);
        let mut remaining = args.interval;
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            let sleep_time = remaining.min(sleep_interval);
            std::thread::sleep(sleep_time);
            remaining = remaining.saturating_sub(sleep_time);
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }

        match tree.update() {
            Ok(stats) => {
                sample_count += 1;
                debug!(
                    "Sample #{}: {} entities, {} new, {} vanished, {} retired in {:?}",
                    sample_count,
                    tree.size(),
                    stats.inserted,
                    stats.vanished,
                    stats.retired,
                    stats.duration
                );
                if let Err(e) = report(&tree, args, sample_count) {
                    result = Err(e);
                    break;
                }
            }
            Err(e) => {
                // Malformed records are not retried.
                result = Err(e.into());
                break;
            }
        }

        if !tree.alive(tree.root()) {
            info!("Root process {} exited", tree.root());
            break;
        }

        if args.duration.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
    }

    if args.pin
        && let Err(e) = tree.unpin_all()
    {
        warn!("Unpinning on shutdown: {}", e);
    }

    info!("Shutdown after {} samples", sample_count);
    result
}

/// Prints one sample in the selected format.
fn report(tree: &ProcessTree, args: &Args, sample: u64) -> Result<(), CliError> {
    if args.tree {
        println!("{}", tree.render());
        return Ok(());
    }

    let mut busy: Vec<EntitySummary> = tree
        .iter()
        .filter(|entity| entity.cpu_use() >= args.cpu_threshold)
        .map(|entity| entity.summary())
        .collect();
    busy.sort_by(|a, b| b.cpu_use.total_cmp(&a.cpu_use).then(a.pid.cmp(&b.pid)));

    if args.json {
        let line = serde_json::to_string(&Sample {
            timestamp: Utc::now().to_rfc3339(),
            sample,
            root: tree.root(),
            entities: tree.size(),
            processes: &busy,
        })?;
        println!("{line}");
        return Ok(());
    }

    println!(
        "--- {} sample #{} ({} entities) ---",
        Utc::now().format("%H:%M:%S"),
        sample,
        tree.size()
    );
    for summary in &busy {
        if let Ok(entity) = tree.find(summary.pid) {
            println!("{entity}");
        }
    }

    Ok(())
}
