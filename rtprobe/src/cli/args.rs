//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "rtprobe",
    about = "Run a synthetic workload under the rtprobe sampling agent",
    after_help = "\
EXAMPLES:
    rtprobe --output trace.bin                       Sample every 500ms for 2s
    rtprobe --output trace.bin --interval-us 100000  Sample every 100ms
    rtprobe --output trace.bin --json                Print the exit summary as JSON

The sampling interval defaults to $RTPROBE_SAMPLE_INTERVAL (microseconds)."
)]
pub struct Args {
    /// File the binary trace stream is written to
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Summary file written at shutdown
    #[arg(long, value_name = "FILE", default_value = "stats.out")]
    pub stats: PathBuf,

    /// Sampling interval in microseconds (overrides the environment)
    #[arg(long, value_name = "US")]
    pub interval_us: Option<u32>,

    /// Only every Nth alarm performs a sample
    #[arg(long, default_value = "1")]
    pub sample_multiple: u32,

    /// How long the workload runs
    #[arg(long, default_value = "2000")]
    pub duration_ms: u64,

    /// Print the exit summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}
