//! Domain model for rtprobe
//!
//! The three failure classes ([`Fault`], [`ChannelError`], [`AgentError`])
//! and the [`fatal`] exits, plus the small types shared across modules:
//! [`Pid`] for fork bookkeeping, [`TimerKind`] for which clock a timer
//! reads, and [`AtomicF64`] for floats the alarm path shares with mainline
//! code.

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{AtomicF64, Pid, TimerKind};

pub use errors::{fatal, fatal_in_handler, AgentError, ChannelError, Fault};
