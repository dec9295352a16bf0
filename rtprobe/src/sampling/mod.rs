//! # Sampling Engine
//!
//! One boolean state machine driven by the periodic alarm:
//!
//! ```text
//!            alarm                     every Nth alarm
//!   Idle ───────────► Sampling ──────────────────────────► save FPU
//!    ▲                   │  │                                 │
//!    │   other alarms    │  │ reentrant alarm: dropped        ▼
//!    └───────────────────┘  └──────────(no count)      timers, counters,
//!    ▲                                                 cost, tags, flush
//!    └───────────────────────────── restore FPU ◄─────────────┘
//! ```
//!
//! A delivery that finds a tick already running is dropped without being
//! counted. Every other delivery counts towards the alarm total and the
//! decimation counter; only every `sample_multiple`th one does the work.
//!
//! The guard and the counters are plain atomics with no lock: a tick never
//! waits, so two overlapping deliveries resolve to one tick and one drop.

mod alarm;
mod fpu;

pub use alarm::{arm, disarm, is_armed};
pub use fpu::FpuContext;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::clock::Clock;

/// What a single alarm delivery did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A tick was already in progress; nothing was counted
    Reentrant,
    /// Counted, but skipped by decimation
    Decimated,
    /// Counted and sampled
    Performed,
}

/// Tick guard, decimation and tick accounting
#[derive(Debug)]
pub struct SamplingState {
    in_sample: AtomicBool,
    sample_multiple: AtomicU32,
    num_sampled: AtomicU64,
    alarms: AtomicU64,
    performed: AtomicU64,
    handler_cpu_us: AtomicU64,
}

impl SamplingState {
    #[must_use]
    pub const fn new(sample_multiple: u32) -> Self {
        Self {
            in_sample: AtomicBool::new(false),
            sample_multiple: AtomicU32::new(if sample_multiple == 0 { 1 } else { sample_multiple }),
            num_sampled: AtomicU64::new(0),
            alarms: AtomicU64::new(0),
            performed: AtomicU64::new(0),
            handler_cpu_us: AtomicU64::new(0),
        }
    }

    /// Run one alarm delivery, calling `work` if this tick performs
    ///
    /// The floating-point context of the interrupted code is saved before
    /// `work` and restored after it, and the CPU time `work` takes is added
    /// to the handler cost.
    pub fn on_alarm<C, F>(&self, clock: &C, work: F) -> TickOutcome
    where
        C: Clock + ?Sized,
        F: FnOnce(),
    {
        if self.in_sample.swap(true, Ordering::SeqCst) {
            return TickOutcome::Reentrant;
        }

        self.alarms.fetch_add(1, Ordering::Relaxed);
        let n = self.num_sampled.fetch_add(1, Ordering::Relaxed) + 1;
        let multiple = u64::from(self.sample_multiple.load(Ordering::Relaxed).max(1));

        let outcome = if n % multiple == 0 {
            let mut fpu = FpuContext::new();
            fpu.save();
            let start = clock.cpu_time();

            work();

            let end = clock.cpu_time();
            self.handler_cpu_us.fetch_add(end.saturating_sub(start), Ordering::Relaxed);
            self.performed.fetch_add(1, Ordering::Relaxed);
            fpu.restore();
            TickOutcome::Performed
        } else {
            TickOutcome::Decimated
        };

        self.in_sample.store(false, Ordering::SeqCst);
        outcome
    }

    /// True while a tick is running
    #[must_use]
    pub fn in_sample(&self) -> bool {
        self.in_sample.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn sample_multiple(&self) -> u32 {
        self.sample_multiple.load(Ordering::Relaxed)
    }

    /// Change decimation; 0 behaves as 1
    pub fn set_sample_multiple(&self, multiple: u32) {
        self.sample_multiple.store(multiple.max(1), Ordering::Relaxed);
    }

    /// Deliveries counted (decimated ones included, reentrant ones not)
    #[must_use]
    pub fn alarms(&self) -> u64 {
        self.alarms.load(Ordering::Relaxed)
    }

    /// Ticks that performed a sample
    #[must_use]
    pub fn performed(&self) -> u64 {
        self.performed.load(Ordering::Relaxed)
    }

    /// CPU microseconds spent inside performing ticks
    #[must_use]
    pub fn handler_cpu_us(&self) -> u64 {
        self.handler_cpu_us.load(Ordering::Relaxed)
    }

    /// Zero the counters, keeping the decimation setting
    pub fn reset(&self) {
        self.num_sampled.store(0, Ordering::Relaxed);
        self.alarms.store(0, Ordering::Relaxed);
        self.performed.store(0, Ordering::Relaxed);
        self.handler_cpu_us.store(0, Ordering::Relaxed);
        self.in_sample.store(false, Ordering::SeqCst);
    }
}
