//! # Timer Engine
//!
//! Nestable start/stop accumulators of CPU or wall time that the alarm
//! handler can read at any instruction boundary without a lock.
//!
//! ## Consistency Protocol
//!
//! The only window where a reader could see a torn value is the outermost
//! `stop`, which rewrites `total`. It runs in this order:
//!
//! ```text
//! now      = clock()
//! snapshot = now - start + total      // value as of the first read
//! in_update = true                    // readers use snapshot from here
//! depth    = 0
//! total    = clock() - start + total  // second read bounds the window
//! in_update = false                   // readers use total again
//! ```
//!
//! A reader checks `in_update` first, then `depth` (extrapolate a running
//! interval), then falls back to `total`. The interrupting context only ever
//! reads a timer that the interrupted code is writing, which is what makes
//! a flag sufficient here.
//!
//! All fields are `SeqCst` atomics: the signal handler runs on the same
//! thread as the code it interrupts, so the orderings matter only to keep
//! the compiler from reordering the protocol steps.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::clock::Clock;
use crate::domain::{fatal, Fault, TimerKind};

/// Microseconds per second; the normalization applied to timer reports
pub const MICROS_PER_SECOND: u64 = 1_000_000;

/// Elapsed time for one measured region class
#[derive(Debug)]
pub struct Timer {
    id: u32,
    kind: TimerKind,
    start: AtomicU64,
    total: AtomicU64,
    depth: AtomicU32,
    snapshot: AtomicU64,
    in_update: AtomicBool,
    last_reported: AtomicU64,
    normalize: AtomicU64,
}

/// One report of a timer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerReading {
    /// Accumulated microseconds
    pub total: u64,
    /// `total` divided by the normalization factor (seconds)
    pub value: f64,
}

impl Timer {
    #[must_use]
    pub const fn new(id: u32, kind: TimerKind) -> Self {
        Self {
            id,
            kind,
            start: AtomicU64::new(0),
            total: AtomicU64::new(0),
            depth: AtomicU32::new(0),
            snapshot: AtomicU64::new(0),
            in_update: AtomicBool::new(false),
            last_reported: AtomicU64::new(0),
            normalize: AtomicU64::new(MICROS_PER_SECOND),
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    /// Microseconds accumulated over closed intervals
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Count of unmatched `start` calls
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.depth() > 0
    }

    /// Begin an interval; only the outermost call reads the clock
    pub fn start<C: Clock + ?Sized>(&self, clock: &C) {
        if self.depth.load(Ordering::SeqCst) == 0 {
            self.start.store(clock.now(self.kind), Ordering::SeqCst);
            self.normalize.store(MICROS_PER_SECOND, Ordering::SeqCst);
        }
        self.depth.fetch_add(1, Ordering::SeqCst);
    }

    /// End an interval, aborting the process if the clock ran backwards
    pub fn stop<C: Clock + ?Sized>(&self, clock: &C) {
        if let Err(fault) = self.try_stop(clock) {
            fatal(&fault);
        }
    }

    /// End an interval
    ///
    /// Stopping a timer that is not running is a no-op. Inner calls of a
    /// nested interval only decrement the depth.
    ///
    /// # Errors
    /// Returns [`Fault::ClockRollback`] if a clock reading precedes the
    /// interval start.
    pub fn try_stop<C: Clock + ?Sized>(&self, clock: &C) -> Result<(), Fault> {
        let depth = self.depth.load(Ordering::SeqCst);
        if depth == 0 {
            return Ok(());
        }
        if depth > 1 {
            self.depth.store(depth - 1, Ordering::SeqCst);
            return Ok(());
        }

        let start = self.start.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        let now = clock.now(self.kind);
        if now < start {
            return Err(self.rollback(start, now));
        }

        self.snapshot.store(now - start + total, Ordering::SeqCst);
        self.in_update.store(true, Ordering::SeqCst);
        self.depth.store(0, Ordering::SeqCst);
        let now2 = clock.now(self.kind);
        if now2 < now {
            return Err(self.rollback(now, now2));
        }
        self.total.store(now2 - start + total, Ordering::SeqCst);
        self.in_update.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Read the timer for a report
    ///
    /// A running timer is extrapolated to the current clock; a timer in the
    /// middle of `stop` reports its snapshot.
    ///
    /// # Errors
    /// Returns [`Fault::TimeRegressed`] if the value is below the previous
    /// report and [`Fault::ClockRollback`] if the clock is behind the start
    /// of the running interval.
    #[allow(clippy::cast_precision_loss)]
    pub fn try_sample<C: Clock + ?Sized>(&self, clock: &C) -> Result<TimerReading, Fault> {
        let total = self.current_total(clock)?;
        let last = self.last_reported.load(Ordering::SeqCst);
        if total < last {
            return Err(Fault::TimeRegressed {
                id: self.id,
                kind: self.kind,
                total,
                last,
                active: self.is_running(),
                in_update: self.in_update.load(Ordering::SeqCst),
                depth: self.depth(),
                snapshot: self.snapshot.load(Ordering::SeqCst),
            });
        }
        self.last_reported.store(total, Ordering::SeqCst);

        let normalize = self.normalize.load(Ordering::SeqCst).max(1);
        Ok(TimerReading { total, value: total as f64 / normalize as f64 })
    }

    /// Return the timer to its just-created state
    pub fn reset(&self) {
        self.in_update.store(false, Ordering::SeqCst);
        self.depth.store(0, Ordering::SeqCst);
        self.start.store(0, Ordering::SeqCst);
        self.total.store(0, Ordering::SeqCst);
        self.snapshot.store(0, Ordering::SeqCst);
        self.last_reported.store(0, Ordering::SeqCst);
        self.normalize.store(MICROS_PER_SECOND, Ordering::SeqCst);
    }

    fn current_total<C: Clock + ?Sized>(&self, clock: &C) -> Result<u64, Fault> {
        if self.in_update.load(Ordering::SeqCst) {
            return Ok(self.snapshot.load(Ordering::SeqCst));
        }
        if self.depth.load(Ordering::SeqCst) > 0 {
            let start = self.start.load(Ordering::SeqCst);
            let now = clock.now(self.kind);
            if now < start {
                return Err(self.rollback(start, now));
            }
            return Ok(now - start + self.total.load(Ordering::SeqCst));
        }
        Ok(self.total.load(Ordering::SeqCst))
    }

    fn rollback(&self, start: u64, now: u64) -> Fault {
        Fault::ClockRollback { kind: self.kind, start, now }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::cell::Cell;

    fn wall_timer() -> Timer {
        Timer::new(1, TimerKind::WallTime)
    }

    #[test]
    fn test_sequential_intervals_accumulate() {
        let clock = ManualClock::new();
        let timer = wall_timer();
        let mut expected = 0;

        for (gap, len) in [(10, 100), (5, 250), (1_000, 1)] {
            clock.advance_wall(gap);
            timer.start(&clock);
            clock.advance_wall(len / 2);
            timer.try_sample(&clock).unwrap();
            clock.advance_wall(len - len / 2);
            timer.try_stop(&clock).unwrap();
            expected += len;
            timer.try_sample(&clock).unwrap();
        }

        assert_eq!(timer.total(), expected);
        assert!(!timer.is_running());
    }

    #[test]
    fn test_nested_starts_time_outermost_only() {
        let clock = ManualClock::new();
        let timer = wall_timer();

        timer.start(&clock);
        clock.advance_wall(10);
        timer.start(&clock);
        clock.advance_wall(20);
        timer.try_stop(&clock).unwrap();
        assert_eq!(timer.depth(), 1);
        assert_eq!(timer.total(), 0);

        clock.advance_wall(30);
        timer.try_stop(&clock).unwrap();
        assert_eq!(timer.depth(), 0);
        assert_eq!(timer.total(), 60);
    }

    #[test]
    fn test_stop_without_start_is_ignored() {
        let clock = ManualClock::new();
        let timer = wall_timer();
        clock.set_wall(500);
        timer.try_stop(&clock).unwrap();
        assert_eq!(timer.depth(), 0);
        assert_eq!(timer.total(), 0);
    }

    #[test]
    fn test_running_timer_extrapolates() {
        let clock = ManualClock::new();
        let timer = Timer::new(3, TimerKind::ProcessTime);
        clock.set_cpu(1_000);
        timer.start(&clock);
        clock.set_cpu(3_500_000);

        let reading = timer.try_sample(&clock).unwrap();
        assert_eq!(reading.total, 3_499_000);
        assert!((reading.value - 3.499).abs() < 1e-9);
        assert!(timer.is_running());
    }

    #[test]
    fn test_process_timer_ignores_wall_clock() {
        let clock = ManualClock::new();
        let timer = Timer::new(3, TimerKind::ProcessTime);
        timer.start(&clock);
        clock.advance_wall(1_000);
        clock.advance_cpu(40);
        timer.try_stop(&clock).unwrap();
        assert_eq!(timer.total(), 40);
    }

    #[test]
    fn test_stop_rollback_is_a_fault() {
        let clock = ManualClock::new();
        let timer = wall_timer();
        clock.set_wall(1_000);
        timer.start(&clock);
        clock.set_wall(999);

        let err = timer.try_stop(&clock).unwrap_err();
        assert_eq!(err, Fault::ClockRollback { kind: TimerKind::WallTime, start: 1_000, now: 999 });
    }

    #[test]
    fn test_backward_reading_never_reports_lower_value() {
        let clock = ManualClock::new();
        let timer = wall_timer();
        clock.set_wall(100);
        timer.start(&clock);
        clock.set_wall(600);
        assert_eq!(timer.try_sample(&clock).unwrap().total, 500);

        // Still after start, but behind the previous report
        clock.set_wall(300);
        let err = timer.try_sample(&clock).unwrap_err();
        assert!(matches!(err, Fault::TimeRegressed { id: 1, total: 200, last: 500, .. }));

        // Behind the start of the running interval
        clock.set_wall(50);
        let err = timer.try_sample(&clock).unwrap_err();
        assert!(matches!(err, Fault::ClockRollback { start: 100, now: 50, .. }));
    }

    /// Clock whose Nth wall read runs a report of `timer`, like an alarm
    /// landing inside `stop`
    struct InterruptingClock<'a> {
        wall: Cell<u64>,
        reads: Cell<u32>,
        interrupt_on: u32,
        timer: &'a Timer,
        observed: Cell<Option<u64>>,
    }

    impl Clock for InterruptingClock<'_> {
        fn cpu_time(&self) -> u64 {
            0
        }

        fn wall_time(&self) -> u64 {
            let n = self.reads.get() + 1;
            self.reads.set(n);
            if n == self.interrupt_on {
                let inner = ManualClock::new();
                inner.set_wall(self.wall.get());
                let reading = self.timer.try_sample(&inner).unwrap();
                self.observed.set(Some(reading.total));
            }
            let now = self.wall.get();
            self.wall.set(now + 10);
            now
        }
    }

    fn interrupted_stop(interrupt_on: u32) -> (u64, u64) {
        let timer = wall_timer();
        let clock = InterruptingClock {
            wall: Cell::new(100),
            reads: Cell::new(0),
            interrupt_on,
            timer: &timer,
            observed: Cell::new(None),
        };
        timer.start(&clock); // read 1 at 100
        clock.wall.set(250);
        timer.try_stop(&clock).unwrap(); // reads 2 (250) and 3 (260)
        (clock.observed.get().unwrap(), timer.total())
    }

    #[test]
    fn test_report_inside_stop_window_uses_snapshot() {
        // Interrupt during the second read: in_update is set
        let (observed, total) = interrupted_stop(3);
        assert_eq!(observed, 150);
        assert_eq!(total, 160);
        assert!(observed <= total);
    }

    #[test]
    fn test_report_before_stop_window_extrapolates() {
        // Interrupt during the first read: timer still running
        let (observed, total) = interrupted_stop(2);
        assert_eq!(observed, 150);
        assert!(observed <= total);
    }

    #[test]
    fn test_start_resets_normalization() {
        let clock = ManualClock::new();
        let timer = wall_timer();
        timer.normalize.store(0, Ordering::SeqCst);
        timer.start(&clock);
        clock.advance_wall(2_000_000);
        timer.try_stop(&clock).unwrap();
        assert!((timer.try_sample(&clock).unwrap().value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset() {
        let clock = ManualClock::new();
        let timer = wall_timer();
        timer.start(&clock);
        timer.start(&clock);
        clock.advance_wall(5);
        timer.try_sample(&clock).unwrap();
        timer.reset();
        assert_eq!(timer.depth(), 0);
        assert_eq!(timer.total(), 0);
        assert_eq!(timer.try_sample(&clock).unwrap().total, 0);
    }
}
