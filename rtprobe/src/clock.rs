//! Clock sources
//!
//! Timers, trace timestamps and calibration read time through the [`Clock`]
//! trait, in microseconds. [`SystemClock`] is what an injected agent uses;
//! [`ManualClock`] lets tests and simulations script every reading,
//! including readings that go backwards.

#![allow(unsafe_code)] // clock_gettime() requires unsafe

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::domain::TimerKind;

/// Monotonic CPU-time and wall-time source, microsecond resolution
///
/// Implementations must be safe to call from the alarm signal handler: no
/// allocation, no locks.
pub trait Clock {
    /// CPU time consumed by the process
    fn cpu_time(&self) -> u64;

    /// Wall-clock time from an arbitrary fixed origin
    fn wall_time(&self) -> u64;

    /// Reading for a timer of the given kind
    fn now(&self, kind: TimerKind) -> u64 {
        match kind {
            TimerKind::ProcessTime => self.cpu_time(),
            TimerKind::WallTime => self.wall_time(),
        }
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn cpu_time(&self) -> u64 {
        (**self).cpu_time()
    }

    fn wall_time(&self) -> u64 {
        (**self).wall_time()
    }
}

/// `clock_gettime` backed clock
///
/// CPU time is `CLOCK_PROCESS_CPUTIME_ID`, wall time is `CLOCK_MONOTONIC`.
/// Both are async-signal-safe.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    #[allow(clippy::cast_sign_loss)]
    fn read(clock_id: libc::clockid_t) -> u64 {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        // SAFETY: ts is a valid, writable timespec
        let rc = unsafe { libc::clock_gettime(clock_id, &mut ts) };
        if rc != 0 {
            return 0;
        }
        ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
    }
}

impl Clock for SystemClock {
    fn cpu_time(&self) -> u64 {
        Self::read(libc::CLOCK_PROCESS_CPUTIME_ID)
    }

    fn wall_time(&self) -> u64 {
        Self::read(libc::CLOCK_MONOTONIC)
    }
}

/// Scripted clock for tests and simulations
///
/// Each read returns the current value and then advances it by the
/// configured step (0 by default), so a sequence of reads can be made to
/// move forward on its own.
#[derive(Debug, Default)]
pub struct ManualClock {
    cpu: AtomicU64,
    wall: AtomicU64,
    cpu_step: AtomicU64,
    wall_step: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cpu(&self, us: u64) {
        self.cpu.store(us, Ordering::SeqCst);
    }

    pub fn set_wall(&self, us: u64) {
        self.wall.store(us, Ordering::SeqCst);
    }

    pub fn advance_cpu(&self, us: u64) {
        self.cpu.fetch_add(us, Ordering::SeqCst);
    }

    pub fn advance_wall(&self, us: u64) {
        self.wall.fetch_add(us, Ordering::SeqCst);
    }

    /// Advance both clocks by the same amount
    pub fn advance(&self, us: u64) {
        self.advance_cpu(us);
        self.advance_wall(us);
    }

    /// Amount each read advances its clock by afterwards
    pub fn set_auto_step(&self, cpu_step: u64, wall_step: u64) {
        self.cpu_step.store(cpu_step, Ordering::SeqCst);
        self.wall_step.store(wall_step, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn cpu_time(&self) -> u64 {
        self.cpu.fetch_add(self.cpu_step.load(Ordering::SeqCst), Ordering::SeqCst)
    }

    fn wall_time(&self) -> u64 {
        self.wall.fetch_add(self.wall_step.load(Ordering::SeqCst), Ordering::SeqCst)
    }
}
