//! Instrumentation cost model
//!
//! Injected code reports the cycles its own instrumentation consumed. The
//! meter turns that into seconds using a cycles-per-second constant that
//! the agent calibrates at startup by timing a fixed busy loop.

#![allow(unsafe_code)] // inline nop body for the calibration loop

use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock::Clock;

/// Instructions in one iteration of the calibration loop
pub const NOPS_PER_LOOP: u64 = 256;

/// Cycles spent in instrumentation, split into a committed total and cycles
/// recorded since the last fold
///
/// The alarm handler reads only the committed total so a tick that lands
/// in the middle of `record` never sees a half-applied update.
#[derive(Debug, Default)]
pub struct CostMeter {
    committed: AtomicU64,
    pending: AtomicU64,
}

impl CostMeter {
    #[must_use]
    pub const fn new() -> Self {
        Self { committed: AtomicU64::new(0), pending: AtomicU64::new(0) }
    }

    /// Add cycles reported by instrumented code
    pub fn record(&self, cycles: u64) {
        self.pending.fetch_add(cycles, Ordering::SeqCst);
    }

    /// Observed instrumentation cycles so far
    ///
    /// Outside the alarm handler, pending cycles are folded into the total
    /// first.
    pub fn observed(&self, in_alarm: bool) -> u64 {
        if !in_alarm {
            self.fold();
        }
        self.committed.load(Ordering::SeqCst)
    }

    /// Move pending cycles into the committed total
    pub fn fold(&self) {
        let pending = self.pending.swap(0, Ordering::SeqCst);
        if pending > 0 {
            self.committed.fetch_add(pending, Ordering::SeqCst);
        }
    }

    pub fn reset(&self) {
        self.pending.store(0, Ordering::SeqCst);
        self.committed.store(0, Ordering::SeqCst);
    }
}

#[inline(never)]
fn nop_body() {
    for _ in 0..NOPS_PER_LOOP {
        // SAFETY: a nop has no operands or side effects
        unsafe { std::arch::asm!("nop", options(nomem, nostack, preserves_flags)) };
    }
}

/// Estimate how many instructions the CPU retires per second of CPU time
///
/// Runs `loops` iterations of a [`NOPS_PER_LOOP`] nop body and divides by
/// the CPU time it took. An elapsed time of zero counts as one microsecond.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn calibrate_cycles_per_second<C: Clock + ?Sized>(clock: &C, loops: u64) -> f64 {
    let start = clock.cpu_time();
    for _ in 0..loops {
        nop_body();
    }
    let elapsed = clock.cpu_time().saturating_sub(start).max(1);
    1.0e6 * NOPS_PER_LOOP as f64 * loops as f64 / elapsed as f64
}

/// Convert a cycle count to seconds given microseconds per cycle
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn cycles_to_seconds(cycles: u64, cycles_to_usec: f64) -> f64 {
    cycles as f64 * cycles_to_usec / 1.0e6
}
