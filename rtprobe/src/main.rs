//! # rtprobe - Demo Harness
//!
//! Runs a synthetic workload under the agent with a real `SIGALRM`, writing
//! the trace stream to `--output` and the summary to `--stats`. Useful for
//! checking a monitor against a known producer.
//!
//! Workload per iteration: a CPU-bound burst under a CPU timer, a short
//! sleep under a wall timer, a counter bump, a message tag and a fake
//! instrumentation cycle charge.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use rtprobe_common::ExitStats;
use serde::Serialize;

use rtprobe::cli::Args;
use rtprobe::clock::SystemClock;
use rtprobe::config::{AgentConfig, SAMPLE_INTERVAL_ENV};
use rtprobe::domain::TimerKind;
use rtprobe::registry::Counter;
use rtprobe::summary::render_summary;
use rtprobe::timer::Timer;
use rtprobe::Agent;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

static COMPUTE_TIME: Timer = Timer::new(1, TimerKind::ProcessTime);
static WAIT_TIME: Timer = Timer::new(2, TimerKind::WallTime);
static ITERATIONS: Counter = Counter::new(3);
static INSTRUMENTATION_COST: Counter = Counter::new(4);

/// What `--json` prints
#[derive(Serialize)]
struct RunReport<'a> {
    config: &'a AgentConfig,
    iterations: u64,
    stats: ExitStats,
}

/// Cycles charged to the cost model per iteration
const CYCLES_PER_ITERATION: u64 = 1_200;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.to_string().to_lowercase().starts_with("invalid") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    if args.duration_ms == 0 {
        bail!("Invalid --duration-ms: must be greater than zero");
    }

    let output = File::create(&args.output)
        .with_context(|| format!("Failed to create trace file {}", args.output.display()))?;

    let mut config = AgentConfig::from_env(output.as_raw_fd())
        .with_sample_multiple(args.sample_multiple)
        .with_stats_path(&args.stats);
    if let Some(us) = args.interval_us {
        config = config.with_sample_interval(us);
    }

    if !args.quiet {
        println!("rtprobe v{}", env!("CARGO_PKG_VERSION"));
        println!("trace: {}", args.output.display());
        println!(
            "interval: {}us (override with --interval-us or {SAMPLE_INTERVAL_ENV})",
            config.sample_interval_us
        );
    }

    let agent = Arc::new(Agent::new(config, SystemClock));
    agent.initialize(true);
    agent.register_timer(&COMPUTE_TIME);
    agent.register_timer(&WAIT_TIME);
    agent.register_counter(&ITERATIONS);

    let iterations = run_workload(&agent, Duration::from_millis(args.duration_ms));
    info!("Workload finished after {iterations} iterations");

    agent.report_cost(&INSTRUMENTATION_COST);
    agent.report_new_tags();
    let stats = agent.shutdown();
    drop(output);

    if args.json {
        let report = RunReport { config: agent.config(), iterations, stats };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !args.quiet {
        let mut stdout = std::io::stdout().lock();
        render_summary(&mut stdout, &stats).context("Failed to print summary")?;
    }
    Ok(())
}

fn run_workload(agent: &Agent, duration: Duration) -> u64 {
    let started = Instant::now();
    let mut iterations = 0u64;
    while started.elapsed() < duration {
        agent.start_timer(&COMPUTE_TIME);
        std::hint::black_box(burn(20_000));
        agent.stop_timer(&COMPUTE_TIME);

        agent.start_timer(&WAIT_TIME);
        std::thread::sleep(Duration::from_millis(5));
        agent.stop_timer(&WAIT_TIME);

        ITERATIONS.add(1);
        #[allow(clippy::cast_possible_truncation)]
        agent.record_tag((iterations % 4) as i32);
        agent.record_instrumentation_cycles(CYCLES_PER_ITERATION);
        iterations += 1;
    }
    iterations
}

fn burn(rounds: u64) -> u64 {
    (0..rounds).fold(0u64, |acc, i| acc.wrapping_mul(31).wrapping_add(i ^ (acc >> 7)))
}
