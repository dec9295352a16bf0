//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep raw integers from being mixed up (a PID is
//! not a timer id) and give the atomics the alarm path reads a typed face.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process ID
///
/// Signed like `pid_t`: `fork` returns 0 in the child and -1 on failure, and
/// both values reach the fork hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub i32);

impl Pid {
    /// PID of the calling process
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn current() -> Self {
        Pid(std::process::id() as i32)
    }

    /// True for the parent side of a fork (a real child PID)
    #[must_use]
    pub fn is_child_pid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Which clock a timer accumulates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// CPU time consumed by the process
    ProcessTime,
    /// Elapsed wall-clock time
    WallTime,
}

impl TimerKind {
    /// Decode the kind passed across the C ABI (0 = process, else wall)
    #[must_use]
    pub fn from_raw(raw: i32) -> Self {
        if raw == 0 {
            TimerKind::ProcessTime
        } else {
            TimerKind::WallTime
        }
    }
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKind::ProcessTime => write!(f, "process"),
            TimerKind::WallTime => write!(f, "wall"),
        }
    }
}

/// An `f64` stored as its bit pattern in an `AtomicU64`
///
/// Used for the calibration constant and the last reported cost, which the
/// alarm path reads while mainline code may be rewriting them.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    /// 0.0 (its bit pattern is all zeros)
    #[must_use]
    pub const fn zero() -> Self {
        AtomicF64(AtomicU64::new(0))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::SeqCst);
    }
}
