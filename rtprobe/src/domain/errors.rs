//! Structured error types for rtprobe
//!
//! Using thiserror for automatic Display implementation and error chaining.
//!
//! Nothing here is ever handed back to the instrumented program. A [`Fault`]
//! means a measurement assumption broke and ends in [`fatal`]; a
//! [`ChannelError`] switches trace emission off for the rest of the process;
//! an [`AgentError`] is logged and the agent carries on.

#![allow(unsafe_code)] // write(2) of the fatal diagnostic

use std::fmt::{self, Write as _};

use log::error;
use rtprobe_common::EncodeError;
use thiserror::Error;

use super::types::{Pid, TimerKind};

/// Unrecoverable environment faults
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Fault {
    #[error("{kind} timer rollback: clock read {now} is before interval start {start}")]
    ClockRollback { kind: TimerKind, start: u64, now: u64 },

    #[error(
        "{kind} time regressed timer {id}, total = {total}, last = {last} \
         (active={active}, in_update={in_update}, depth={depth}, snapshot={snapshot})"
    )]
    TimeRegressed {
        id: u32,
        kind: TimerKind,
        total: u64,
        last: u64,
        active: bool,
        in_update: bool,
        depth: u32,
        snapshot: u64,
    },

    #[error("cost counter went backwards: {cost} < {prev}")]
    CostRegressed { cost: f64, prev: f64 },

    #[error("message tag registry full ({limit} tags)")]
    TagOverflow { limit: usize },

    #[error("sampled {what} set full ({capacity} entries)")]
    SampleSetFull { what: &'static str, capacity: usize },

    #[error("{call} failed: errno {errno}")]
    SignalSetup { call: &'static str, errno: i32 },
}

/// Trace channel faults; the first one disables emission permanently
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("unable to duplicate controller descriptor {fd}: errno {errno}")]
    Open { fd: i32, errno: i32 },

    #[error("unable to write trace record, errno={errno}")]
    Write { errno: i32 },

    #[error("short trace write: {written} of {len} bytes")]
    ShortWrite { written: usize, len: usize },

    #[error("trace record does not fit the frame buffer: {0}")]
    Oversized(EncodeError),
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Failed to write summary file {path}: {source}")]
    SummaryWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Terminate the process after reporting an unrecoverable fault
///
/// The diagnostic goes to the log and straight to stderr (the logger may not
/// be initialized in an injected process), then the process aborts.
pub fn fatal(fault: &Fault) -> ! {
    error!("fatal fault in {}: {fault}", Pid::current());
    abort_with(fault)
}

/// [`fatal`] for code running inside an alarm tick
///
/// Skips the logger, which may allocate or take locks the interrupted code
/// holds. Only the stderr line is written.
pub fn fatal_in_handler(fault: &Fault) -> ! {
    abort_with(fault)
}

fn abort_with(fault: &Fault) -> ! {
    let mut line = DiagnosticLine::new();
    let _ = writeln!(line, "rtprobe: fatal ({}): {fault}", Pid::current());
    let bytes = line.as_bytes();
    // SAFETY: bytes is valid for its length; a failed write is ignored
    unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
    std::process::abort()
}

/// Diagnostic formatted on the stack; long lines are cut to fit
struct DiagnosticLine {
    buf: [u8; DIAGNOSTIC_LEN],
    len: usize,
}

const DIAGNOSTIC_LEN: usize = 512;

impl DiagnosticLine {
    const fn new() -> Self {
        Self { buf: [0; DIAGNOSTIC_LEN], len: 0 }
    }

    fn as_bytes(&mut self) -> &[u8] {
        if self.len == DIAGNOSTIC_LEN {
            self.buf[DIAGNOSTIC_LEN - 1] = b'\n';
        }
        &self.buf[..self.len]
    }
}

impl fmt::Write for DiagnosticLine {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(DIAGNOSTIC_LEN - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Current `errno` as an integer (0 if unavailable)
pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;

    #[test]
    fn test_rollback_display() {
        let err = Fault::ClockRollback { kind: TimerKind::WallTime, start: 500, now: 400 };
        assert_eq!(
            err.to_string(),
            "wall timer rollback: clock read 400 is before interval start 500"
        );
    }

    #[test]
    fn test_regression_display_names_timer() {
        let err = Fault::TimeRegressed {
            id: 17,
            kind: TimerKind::ProcessTime,
            total: 10,
            last: 20,
            active: true,
            in_update: false,
            depth: 1,
            snapshot: 0,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("process time regressed timer 17"));
        assert!(msg.contains("active=true"));
    }

    #[test]
    fn test_diagnostic_line_formats_on_stack() {
        let fault = Fault::CostRegressed { cost: 0.5, prev: 1.0 };
        let mut line = DiagnosticLine::new();
        writeln!(line, "rtprobe: fatal: {fault}").unwrap();
        assert_eq!(line.as_bytes(), b"rtprobe: fatal: cost counter went backwards: 0.5 < 1\n");
    }

    #[test]
    fn test_diagnostic_line_truncates_and_ends_line() {
        let mut line = DiagnosticLine::new();
        for _ in 0..100 {
            write!(line, "0123456789").unwrap();
        }
        let bytes = line.as_bytes();
        assert_eq!(bytes.len(), DIAGNOSTIC_LEN);
        assert_eq!(bytes.last(), Some(&b'\n'));
    }

    #[test]
    fn test_channel_error_display() {
        let err = ChannelError::Write { errno: 32 };
        assert_eq!(err.to_string(), "unable to write trace record, errno=32");
    }

    #[test]
    fn test_summary_error_chains_source() {
        let err = AgentError::SummaryWrite {
            path: "/nonexistent/stats.out".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("/nonexistent/stats.out"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
