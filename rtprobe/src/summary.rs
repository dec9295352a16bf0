//! Human-readable run summary (`stats.out`)
//!
//! One `label value` line per [`ExitStats`] field, in a fixed order, with
//! floating-point values printed to six decimal places.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use rtprobe_common::ExitStats;

use crate::domain::AgentError;

/// Write the summary for `stats` to `path`, replacing any existing file
///
/// # Errors
/// Returns [`AgentError::SummaryWrite`] if the file cannot be created or
/// written.
pub fn write_summary(path: &Path, stats: &ExitStats) -> Result<(), AgentError> {
    let wrap = |source: io::Error| AgentError::SummaryWrite {
        path: path.display().to_string(),
        source,
    };
    let file = File::create(path).map_err(wrap)?;
    let mut out = BufWriter::new(file);
    render_summary(&mut out, stats).map_err(wrap)?;
    out.flush().map_err(wrap)
}

/// Write the summary lines for `stats` to `out`
///
/// # Errors
/// Propagates any write error from `out`.
pub fn render_summary<W: Write>(out: &mut W, stats: &ExitStats) -> io::Result<()> {
    writeln!(out, "Total alarm expirations {}", stats.alarms)?;
    writeln!(out, "Ticks reported {}", stats.num_reported)?;
    #[allow(clippy::cast_precision_loss)]
    let cycles = stats.inst_cycles as f64;
    writeln!(out, "Raw cycle count = {cycles:.6}")?;
    writeln!(out, "Total instrumentation cost = {:.6}", stats.inst_time)?;
    writeln!(out, "Total handler cost = {:.6}", stats.handler_cost)?;
    writeln!(out, "Total cpu time of program {:.6}", stats.total_cpu_time)?;
    writeln!(out, "Elapsed wall time of program {:.6}", stats.total_wall_time)?;
    writeln!(out, "Total data samples {}", stats.samples_reported)?;
    writeln!(out, "Sampling rate {:.6}", stats.sampling_rate)?;
    writeln!(out, "Application program ticks {}", stats.user_ticks)?;
    writeln!(out, "Instrumentation ticks {}", stats.inst_ticks)
}

/// One-line form of the summary for logs and the terminal
pub struct SummaryLine<'a>(pub &'a ExitStats);

impl fmt::Display for SummaryLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        write!(
            f,
            "{} alarms, {} ticks reported, {} samples, cpu {:.3}s, wall {:.3}s, \
             instrumentation {:.6}s, handler {:.6}s",
            s.alarms,
            s.num_reported,
            s.samples_reported,
            s.total_cpu_time,
            s.total_wall_time,
            s.inst_time,
            s.handler_cost
        )
    }
}
