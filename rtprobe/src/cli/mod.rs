//! Command-line interface for the demo harness

mod args;

pub use args::Args;
