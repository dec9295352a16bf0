//! # Lifecycle Controller
//!
//! [`Agent`] is the one context object holding everything the runtime
//! shares between instrumented code and the alarm handler: the trace
//! channel, the sampled timers and counters, the tag table, the cost meter,
//! the tick state, and the two top-level timers bounding the run.
//!
//! ## Lifecycle
//!
//! ```text
//! new ──► initialize ──► (ticks, start/stop/report from instrumented code) ──► shutdown
//!              ▲                              │
//!              └──── handle_fork(child) ◄─────┘
//! ```
//!
//! `initialize` calibrates the cost constant, arms the alarm and starts the
//! top-level timers. `shutdown` is terminal: it disarms, stops the timers,
//! writes the summary file and emits the Exit record.
//!
//! Every entry point here handles its own faults. An environment [`Fault`]
//! ends the process through [`fatal`]; a channel fault only turns trace
//! output off. The `try_*` variants return the fault instead, for callers
//! that want to inspect it.

#![allow(unsafe_code)] // kill(getpid(), SIGSTOP) for the startup break point

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{error, info, warn};
use rtprobe_common::{
    CostUpdate, ExitStats, ForkRecord, NewResource, SampleRecord, TraceRecord, DEFAULT_STREAM,
};

use crate::clock::Clock;
use crate::config::{AgentConfig, AlarmMode};
use crate::cost::{calibrate_cycles_per_second, cycles_to_seconds, CostMeter};
use crate::domain::{fatal, fatal_in_handler, AtomicF64, Fault, Pid, TimerKind};
use crate::registry::{Counter, SampleSet, TagRegistry};
use crate::sampling::{self, SamplingState, TickOutcome};
use crate::summary::{write_summary, SummaryLine};
use crate::timer::Timer;
use crate::trace::TraceChannel;

/// Id of the top-level wall-time timer (never sent as a sample)
pub const ELAPSED_WALL_TIMER_ID: u32 = u32::MAX - 1;

/// Id of the top-level CPU-time timer (never sent as a sample)
pub const ELAPSED_CPU_TIMER_ID: u32 = u32::MAX;

const MICROS: f64 = 1.0e6;

/// Per-process agent context
pub struct Agent {
    config: AgentConfig,
    clock: Box<dyn Clock + Send + Sync>,
    channel: TraceChannel,
    sampled: SampleSet,
    tags: TagRegistry,
    cost: CostMeter,
    sampling: SamplingState,
    elapsed_wall: Timer,
    elapsed_cpu: Timer,
    cycles_to_usec: AtomicF64,
    calibrations: AtomicU64,
    sampling_rate: AtomicF64,
    last_wall: AtomicU64,
    last_cpu: AtomicU64,
    prev_cost: AtomicF64,
    samples_reported: AtomicU64,
    pause_done: AtomicBool,
    exit_stats: Mutex<Option<ExitStats>>,
}

impl Agent {
    /// Build an idle agent; nothing is measured until [`Agent::initialize`]
    pub fn new(config: AgentConfig, clock: impl Clock + Send + Sync + 'static) -> Self {
        Self {
            channel: TraceChannel::new(config.controller_fd),
            sampling: SamplingState::new(config.sample_multiple),
            config,
            clock: Box::new(clock),
            sampled: SampleSet::new(),
            tags: TagRegistry::new(),
            cost: CostMeter::new(),
            elapsed_wall: Timer::new(ELAPSED_WALL_TIMER_ID, TimerKind::WallTime),
            elapsed_cpu: Timer::new(ELAPSED_CPU_TIMER_ID, TimerKind::ProcessTime),
            cycles_to_usec: AtomicF64::zero(),
            calibrations: AtomicU64::new(0),
            sampling_rate: AtomicF64::zero(),
            last_wall: AtomicU64::new(0),
            last_cpu: AtomicU64::new(0),
            prev_cost: AtomicF64::zero(),
            samples_reported: AtomicU64::new(0),
            pause_done: AtomicBool::new(false),
            exit_stats: Mutex::new(None),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start measuring this process, aborting on a signal setup failure
    ///
    /// Unless `skip_break` is set the process stops itself with `SIGSTOP`
    /// before the top-level timers start, so a controller can attach.
    pub fn initialize(self: &Arc<Self>, skip_break: bool) {
        if let Err(fault) = self.try_initialize(skip_break) {
            fatal(&fault);
        }
    }

    /// Start measuring this process
    ///
    /// # Errors
    /// Returns [`Fault::SignalSetup`] if the alarm cannot be armed.
    pub fn try_initialize(self: &Arc<Self>, skip_break: bool) -> Result<(), Fault> {
        self.reset_process_state();

        let cps = calibrate_cycles_per_second(self.clock(), self.config.calibration_loops);
        self.cycles_to_usec.store(MICROS / cps);
        self.calibrations.fetch_add(1, Ordering::SeqCst);
        info!("Calibrated {cps:.0} cycles/s ({})", Pid::current());

        self.last_cpu.store(self.clock.cpu_time(), Ordering::SeqCst);
        self.last_wall.store(self.clock.wall_time(), Ordering::SeqCst);

        let interval = self.config.sample_interval_us;
        self.sampling_rate.store(f64::from(interval) / MICROS);
        if self.config.alarm == AlarmMode::Signal {
            sampling::arm(self, interval)?;
        }

        #[allow(clippy::cast_precision_loss)]
        let cpu_at_main = self.clock.cpu_time() as f64;
        info!("Time at main {cpu_at_main} us");
        if !skip_break {
            self.break_point();
        }

        self.elapsed_wall.start(self.clock());
        self.elapsed_cpu.start(self.clock());
        Ok(())
    }

    /// Propagate a `fork`
    ///
    /// With a positive `pid` this is the parent: a Fork record is sent. Any
    /// other value is the child, which re-initializes itself so it gets its
    /// own calibration, alarm and top-level timers.
    pub fn handle_fork(self: &Arc<Self>, pid: i32) {
        let pid = Pid(pid);
        info!("fork called with {pid}");
        if pid.is_child_pid() {
            let record = ForkRecord { ppid: Pid::current().0, pid: pid.0, npids: 1, stride: 0 };
            self.emit(&TraceRecord::Fork(record), true);
        } else {
            self.initialize(true);
        }
    }

    /// Finish the run and return its summary
    ///
    /// Disarms the alarm, stops the top-level timers, writes the summary
    /// file and sends the Exit record. Later calls return the same summary
    /// without doing anything.
    pub fn shutdown(&self) -> ExitStats {
        let mut done = self.exit_stats.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stats) = *done {
            return stats;
        }

        sampling::disarm(self);
        self.elapsed_cpu.stop(self.clock());
        self.elapsed_wall.stop(self.clock());

        let stats = self.exit_stats_now();
        if let Err(e) = write_summary(&self.config.stats_path, &stats) {
            error!("{e}");
        }
        self.emit(&TraceRecord::Exit(stats), true);

        info!("rtprobe finished ({}): {}", Pid::current(), SummaryLine(&stats));
        if let Some(errno) = self.channel.disabled_errno() {
            warn!("Trace output was disabled during the run (errno={errno})");
        }

        *done = Some(stats);
        stats
    }

    /// Spin until [`Agent::continue_process`] is called
    ///
    /// Busy-waits instead of blocking so alarm ticks keep running.
    pub fn pause_process(&self) {
        self.pause_done.store(false, Ordering::SeqCst);
        while !self.pause_done.load(Ordering::SeqCst) {
            std::hint::spin_loop();
        }
    }

    pub fn continue_process(&self) {
        self.pause_done.store(true, Ordering::SeqCst);
    }

    /// Stop the process with `SIGSTOP` until a controller continues it
    pub fn break_point(&self) {
        // SAFETY: kill has no memory-safety preconditions
        unsafe { libc::kill(libc::getpid(), libc::SIGSTOP) };
    }

    // ========================================================================
    // Sampling
    // ========================================================================

    /// One alarm delivery; called by the signal handler or, in
    /// [`AlarmMode::Manual`], by the embedding
    pub fn on_alarm(&self) -> TickOutcome {
        self.sampling.on_alarm(self.clock(), || self.sample_tick())
    }

    fn sample_tick(&self) {
        self.cost.fold();
        for timer in self.sampled.timers() {
            self.report_timer(timer);
        }
        for counter in self.sampled.counters() {
            self.report_counter(counter);
        }
        self.report_cost_update();
        self.report_new_tags();
    }

    fn report_cost_update(&self) {
        let cycles = self.cost.observed(true);
        let observed_cost = cycles_to_seconds(cycles, self.cycles_to_usec.load());

        let cpu = self.clock.cpu_time();
        let wall = self.clock.wall_time();
        let elapsed_wall = wall.wrapping_sub(self.last_wall.swap(wall, Ordering::SeqCst));
        let elapsed_cpu = cpu.wrapping_sub(self.last_cpu.swap(cpu, Ordering::SeqCst));
        // Negative when CPU time outran wall time (several threads on CPU)
        #[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
        let pause_us = elapsed_wall.wrapping_sub(elapsed_cpu) as i64 as f64;

        let update = CostUpdate { slots_executed: 0, observed_cost, pause_time: pause_us / MICROS };
        self.emit(&TraceRecord::CostUpdate(update), false);
    }

    pub fn set_sample_multiple(&self, multiple: u32) {
        self.sampling.set_sample_multiple(multiple);
    }

    // ========================================================================
    // Timers and counters
    // ========================================================================

    pub fn start_timer(&self, timer: &Timer) {
        timer.start(self.clock());
    }

    pub fn stop_timer(&self, timer: &Timer) {
        timer.stop(self.clock());
    }

    /// Send the current value of `timer` as a Sample record
    pub fn report_timer(&self, timer: &Timer) {
        if let Err(fault) = self.try_report_timer(timer) {
            self.fail(&fault);
        }
    }

    /// # Errors
    /// Returns the timer's [`Fault`] if its value went backwards or its
    /// clock did.
    pub fn try_report_timer(&self, timer: &Timer) -> Result<(), Fault> {
        let reading = timer.try_sample(self.clock())?;
        self.samples_reported.fetch_add(1, Ordering::Relaxed);
        let sample = SampleRecord { id: timer.id(), value: reading.value };
        self.emit(&TraceRecord::Sample(sample), false);
        Ok(())
    }

    /// Send the current value of `counter` as a Sample record
    #[allow(clippy::cast_precision_loss)]
    pub fn report_counter(&self, counter: &Counter) {
        self.samples_reported.fetch_add(1, Ordering::Relaxed);
        let sample = SampleRecord { id: counter.id(), value: counter.value() as f64 };
        self.emit(&TraceRecord::Sample(sample), false);
    }

    /// Send the cumulative instrumentation cost (seconds) under `counter`'s id
    pub fn report_cost(&self, counter: &Counter) {
        if let Err(fault) = self.try_report_cost(counter) {
            self.fail(&fault);
        }
    }

    /// # Errors
    /// Returns [`Fault::CostRegressed`] if the cost is below the previous
    /// report.
    pub fn try_report_cost(&self, counter: &Counter) -> Result<(), Fault> {
        let cycles = self.cost.observed(self.sampling.in_sample());
        let cost = cycles_to_seconds(cycles, self.cycles_to_usec.load());
        let prev = self.prev_cost.load();
        if cost < prev {
            return Err(Fault::CostRegressed { cost, prev });
        }
        self.prev_cost.store(cost);

        self.samples_reported.fetch_add(1, Ordering::Relaxed);
        self.emit(&TraceRecord::Sample(SampleRecord { id: counter.id(), value: cost }), false);
        Ok(())
    }

    /// Add `timer` to the set every performing tick reports
    pub fn register_timer(&self, timer: &'static Timer) {
        if let Err(fault) = self.sampled.add_timer(timer) {
            self.fail(&fault);
        }
    }

    /// Add `counter` to the set every performing tick reports
    pub fn register_counter(&self, counter: &'static Counter) {
        if let Err(fault) = self.sampled.add_counter(counter) {
            self.fail(&fault);
        }
    }

    /// Cycles the injected instrumentation spent, for the cost model
    pub fn record_instrumentation_cycles(&self, cycles: u64) {
        self.cost.record(cycles);
    }

    // ========================================================================
    // Tags
    // ========================================================================

    /// Remember a message tag; overflowing the table is fatal
    pub fn record_tag(&self, tag: i32) {
        if let Err(fault) = self.tags.record(tag) {
            self.fail(&fault);
        }
    }

    /// Announce every tag recorded since the last pass as a NewResource
    pub fn report_new_tags(&self) {
        self.tags.drain_unreported(|tag| {
            self.emit(&TraceRecord::NewResource(NewResource::message_tag(tag)), true);
        });
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &(dyn Clock + Send + Sync) {
        self.clock.as_ref()
    }

    #[must_use]
    pub fn channel(&self) -> &TraceChannel {
        &self.channel
    }

    #[must_use]
    pub fn sampling(&self) -> &SamplingState {
        &self.sampling
    }

    #[must_use]
    pub fn tags(&self) -> &TagRegistry {
        &self.tags
    }

    #[must_use]
    pub fn sampled(&self) -> &SampleSet {
        &self.sampled
    }

    /// Microseconds per instrumentation cycle from the last calibration
    #[must_use]
    pub fn cycles_to_usec(&self) -> f64 {
        self.cycles_to_usec.load()
    }

    /// Number of times this agent has calibrated (once per initialize)
    #[must_use]
    pub fn calibrations(&self) -> u64 {
        self.calibrations.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn samples_reported(&self) -> u64 {
        self.samples_reported.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn elapsed_wall(&self) -> &Timer {
        &self.elapsed_wall
    }

    #[must_use]
    pub fn elapsed_cpu(&self) -> &Timer {
        &self.elapsed_cpu
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        sampling::is_armed(self)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn reset_process_state(&self) {
        self.elapsed_wall.reset();
        self.elapsed_cpu.reset();
        self.sampling.reset();
        self.cost.reset();
        self.prev_cost.store(0.0);
        self.samples_reported.store(0, Ordering::Relaxed);
        *self.exit_stats.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    #[allow(clippy::cast_precision_loss)]
    fn exit_stats_now(&self) -> ExitStats {
        let inst_cycles = self.cost.observed(false);
        ExitStats {
            alarms: self.sampling.alarms(),
            num_reported: self.sampling.performed(),
            inst_cycles,
            inst_time: cycles_to_seconds(inst_cycles, self.cycles_to_usec.load()),
            handler_cost: self.sampling.handler_cpu_us() as f64 / MICROS,
            total_cpu_time: self.elapsed_cpu.total() as f64 / MICROS,
            total_wall_time: self.elapsed_wall.total() as f64 / MICROS,
            samples_reported: self.samples_reported(),
            sampling_rate: self.sampling_rate.load(),
            user_ticks: 0,
            inst_ticks: 0,
        }
    }

    /// Abort on `fault`, without touching the logger inside a tick
    fn fail(&self, fault: &Fault) -> ! {
        if self.sampling.in_sample() {
            fatal_in_handler(fault)
        } else {
            fatal(fault)
        }
    }

    fn emit(&self, record: &TraceRecord, flush: bool) {
        let in_tick = self.sampling.in_sample();
        // A tick only writes; syncing is left to mainline records
        let result = self.channel.emit(self.clock(), DEFAULT_STREAM, record, flush && !in_tick);
        if let Err(e) = result {
            // Nothing may be formatted inside a tick; shutdown reports it
            if !in_tick {
                warn!("{e}, disabling further data logging ({})", Pid::current());
            }
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        sampling::disarm(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rtprobe_common::{Frame, FrameIter};
    use std::os::fd::AsRawFd;
    use tempfile::{NamedTempFile, TempDir};

    struct Harness {
        agent: Arc<Agent>,
        clock: Arc<ManualClock>,
        trace: NamedTempFile,
        dir: TempDir,
    }

    impl Harness {
        fn new(sample_multiple: u32) -> Self {
            let trace = NamedTempFile::new().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let config = AgentConfig::new(trace.as_file().as_raw_fd())
                .with_alarm(AlarmMode::Manual)
                .with_sample_interval(100_000)
                .with_sample_multiple(sample_multiple)
                .with_calibration_loops(10)
                .with_stats_path(dir.path().join("stats.out"));
            let clock = Arc::new(ManualClock::new());
            let agent = Arc::new(Agent::new(config, Arc::clone(&clock)));
            agent.initialize(true);
            Self { agent, clock, trace, dir }
        }

        fn frames(&self) -> Vec<Frame> {
            let bytes = std::fs::read(self.trace.path()).unwrap();
            FrameIter::new(&bytes).map(Result::unwrap).collect()
        }

        fn count(&self, pred: impl Fn(&TraceRecord) -> bool) -> usize {
            self.frames().iter().filter(|f| pred(&f.record)).count()
        }
    }

    fn is_cost_update(r: &TraceRecord) -> bool {
        matches!(r, TraceRecord::CostUpdate(_))
    }

    #[test]
    fn test_initialize_starts_top_level_timers() {
        let h = Harness::new(1);
        assert!(h.agent.elapsed_wall().is_running());
        assert!(h.agent.elapsed_cpu().is_running());
        assert_eq!(h.agent.calibrations(), 1);
        assert!(h.agent.cycles_to_usec() > 0.0);
        assert!(!h.agent.is_armed());
    }

    #[test]
    fn test_tick_reports_registered_timers_and_counters() {
        static TIMER: Timer = Timer::new(11, TimerKind::WallTime);
        static COUNTER: Counter = Counter::new(12);

        let h = Harness::new(1);
        h.agent.register_timer(&TIMER);
        h.agent.register_counter(&COUNTER);
        h.agent.start_timer(&TIMER);
        h.clock.advance_wall(2_000_000);
        COUNTER.add(5);

        assert_eq!(h.agent.on_alarm(), TickOutcome::Performed);

        let samples: Vec<SampleRecord> = h
            .frames()
            .into_iter()
            .filter_map(|f| match f.record {
                TraceRecord::Sample(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].id, 11);
        assert!((samples[0].value - 2.0).abs() < 1e-9);
        assert_eq!(samples[1], SampleRecord { id: 12, value: 5.0 });
        assert_eq!(h.count(is_cost_update), 1);
        assert_eq!(h.agent.samples_reported(), 2);
    }

    #[test]
    fn test_decimation_controls_cost_updates() {
        let h = Harness::new(3);
        for _ in 0..7 {
            h.agent.on_alarm();
        }
        assert_eq!(h.count(is_cost_update), 2);
        assert_eq!(h.agent.sampling().alarms(), 7);
        assert_eq!(h.agent.sampling().performed(), 2);

        h.agent.set_sample_multiple(1);
        h.agent.on_alarm();
        assert_eq!(h.count(is_cost_update), 3);
    }

    #[test]
    fn test_cost_update_carries_pause_time() {
        let h = Harness::new(1);
        h.clock.advance_wall(1_000);
        h.clock.advance_cpu(400);
        h.agent.record_instrumentation_cycles(2_560_000);
        h.agent.on_alarm();

        let update = h
            .frames()
            .into_iter()
            .find_map(|f| match f.record {
                TraceRecord::CostUpdate(c) => Some(c),
                _ => None,
            })
            .unwrap();
        assert_eq!(update.slots_executed, 0);
        assert!((update.pause_time - 0.0006).abs() < 1e-12);
        // 10 calibration loops in a zero-length (clamped to 1us) interval
        // gives 2560 cycles per microsecond
        assert!((update.observed_cost - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_fork_parent_emits_fork_record() {
        let h = Harness::new(1);
        h.agent.handle_fork(4242);

        let forks: Vec<ForkRecord> = h
            .frames()
            .into_iter()
            .filter_map(|f| match f.record {
                TraceRecord::Fork(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(
            forks,
            vec![ForkRecord { ppid: Pid::current().0, pid: 4242, npids: 1, stride: 0 }]
        );
        assert_eq!(h.agent.calibrations(), 1);
    }

    #[test]
    fn test_fork_child_reinitializes() {
        let h = Harness::new(2);
        h.agent.on_alarm();
        h.clock.advance(5_000);

        h.agent.handle_fork(0);

        assert_eq!(h.agent.calibrations(), 2);
        assert_eq!(h.agent.sampling().alarms(), 0);
        assert!(h.agent.elapsed_wall().is_running());
        assert_eq!(h.agent.elapsed_wall().total(), 0);
        assert_eq!(h.count(|r| matches!(r, TraceRecord::Fork(_))), 0);
    }

    #[test]
    fn test_shutdown_writes_summary_and_exit_record_once() {
        let h = Harness::new(1);
        h.agent.on_alarm();
        h.clock.advance_wall(2_000_000);
        h.clock.advance_cpu(500_000);

        let stats = h.agent.shutdown();
        assert_eq!(stats.alarms, 1);
        assert_eq!(stats.num_reported, 1);
        assert!((stats.total_wall_time - 2.0).abs() < 1e-9);
        assert!((stats.total_cpu_time - 0.5).abs() < 1e-9);
        assert!((stats.sampling_rate - 0.1).abs() < 1e-9);
        assert!(!h.agent.elapsed_wall().is_running());

        let text = std::fs::read_to_string(h.dir.path().join("stats.out")).unwrap();
        assert!(text.contains("Elapsed wall time of program 2.000000"));
        assert!(text.contains("Total alarm expirations 1"));

        assert_eq!(h.agent.shutdown(), stats);
        let exits: Vec<Frame> = h
            .frames()
            .into_iter()
            .filter(|f| matches!(f.record, TraceRecord::Exit(_)))
            .collect();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].record, TraceRecord::Exit(stats));
        assert!(!h.agent.channel().is_open());
    }

    #[test]
    fn test_new_tags_announced_once() {
        let h = Harness::new(1);
        h.agent.record_tag(5);
        h.agent.record_tag(6);
        h.agent.record_tag(5);
        h.agent.report_new_tags();
        h.agent.report_new_tags();

        h.agent.record_tag(7);
        h.agent.on_alarm();

        let names: Vec<String> = h
            .frames()
            .into_iter()
            .filter_map(|f| match f.record {
                TraceRecord::NewResource(r) => {
                    assert_eq!(r.abstraction(), "BASE");
                    Some(r.name().to_string())
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            names,
            vec!["SyncObject/MsgTag/5", "SyncObject/MsgTag/6", "SyncObject/MsgTag/7"]
        );
    }

    #[test]
    fn test_tick_never_syncs_the_trace_file() {
        static TIMER: Timer = Timer::new(13, TimerKind::WallTime);

        let h = Harness::new(1);
        h.agent.register_timer(&TIMER);
        for tag in 20..25 {
            h.agent.record_tag(tag);
        }

        assert_eq!(h.agent.on_alarm(), TickOutcome::Performed);
        assert_eq!(h.count(|r| matches!(r, TraceRecord::NewResource(_))), 5);
        assert_eq!(h.agent.channel().syncs_issued(), 0);

        // Mainline records still reach the disk
        h.agent.handle_fork(4242);
        assert_eq!(h.agent.channel().syncs_issued(), 1);
    }

    #[test]
    fn test_report_cost_is_cumulative() {
        static COST: Counter = Counter::new(30);

        let h = Harness::new(1);
        h.agent.record_instrumentation_cycles(2_560_000);
        h.agent.report_cost(&COST);
        h.agent.record_instrumentation_cycles(2_560_000);
        h.agent.report_cost(&COST);

        let values: Vec<f64> = h
            .frames()
            .into_iter()
            .filter_map(|f| match f.record {
                TraceRecord::Sample(s) if s.id == 30 => Some(s.value),
                _ => None,
            })
            .collect();
        assert_eq!(values.len(), 2);
        assert!((values[0] - 0.001).abs() < 1e-12);
        assert!((values[1] - 0.002).abs() < 1e-12);
    }

    #[test]
    fn test_cost_regression_is_a_fault() {
        static COST: Counter = Counter::new(31);

        let h = Harness::new(1);
        h.agent.record_instrumentation_cycles(2_560_000);
        h.agent.try_report_cost(&COST).unwrap();
        h.agent.prev_cost.store(1.0);
        assert!(matches!(
            h.agent.try_report_cost(&COST),
            Err(Fault::CostRegressed { prev, .. }) if (prev - 1.0).abs() < f64::EPSILON
        ));
    }

    #[test]
    fn test_cost_regression_aborts() {
        use std::os::unix::process::ExitStatusExt;

        const NAME: &str = "agent::tests::test_cost_regression_aborts";
        const CASE_ENV: &str = "RTPROBE_FATAL_CASE";
        static COST: Counter = Counter::new(32);

        if std::env::var(CASE_ENV).is_ok_and(|case| case == NAME) {
            let h = Harness::new(1);
            h.agent.record_instrumentation_cycles(2_560_000);
            h.agent.report_cost(&COST);
            h.agent.prev_cost.store(1.0);
            h.agent.report_cost(&COST);
            unreachable!("report_cost accepted a smaller cost");
        }

        let output = std::process::Command::new(std::env::current_exe().unwrap())
            .args([NAME, "--exact", "--nocapture", "--test-threads=1"])
            .env(CASE_ENV, NAME)
            .output()
            .unwrap();
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert_eq!(output.status.signal(), Some(libc::SIGABRT), "child did not abort");
        assert!(stderr.contains("cost counter went backwards"));
    }

    #[test]
    fn test_broken_channel_does_not_stop_sampling() {
        static TIMER: Timer = Timer::new(40, TimerKind::ProcessTime);

        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::new(-1)
            .with_alarm(AlarmMode::Manual)
            .with_calibration_loops(10)
            .with_stats_path(dir.path().join("stats.out"));
        let agent = Arc::new(Agent::new(config, ManualClock::new()));
        agent.initialize(true);
        agent.register_timer(&TIMER);

        assert_eq!(agent.on_alarm(), TickOutcome::Performed);
        assert_eq!(agent.on_alarm(), TickOutcome::Performed);
        assert!(agent.channel().is_disabled());
        assert_eq!(agent.samples_reported(), 2);

        let stats = agent.shutdown();
        assert_eq!(stats.num_reported, 2);
        assert!(dir.path().join("stats.out").exists());
    }

    #[test]
    fn test_pause_until_continue() {
        let h = Harness::new(1);
        let agent = Arc::clone(&h.agent);
        let released = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&released);
        let waker = std::thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(1));
                agent.continue_process();
            }
        });
        h.agent.pause_process();
        released.store(true, Ordering::SeqCst);
        waker.join().unwrap();
    }
}
