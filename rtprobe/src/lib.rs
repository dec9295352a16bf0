//! # rtprobe - In-Process Sampling and Trace Agent
//!
//! rtprobe is a small runtime injected into a monitored program. Instrumented
//! code starts and stops timers around regions of interest; a periodic
//! `SIGALRM` samples every registered timer and counter and ships the values
//! to an external monitor as compact binary trace records. The agent also
//! reports fork and exit, and accounts for the cost of its own
//! instrumentation so the monitor can subtract it.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Monitored Program                           │
//! │        (instrumented: start/stop/report, fork, exit)           │
//! └───────────────┬─────────────────────────────▲───────────────────┘
//!                 │ C ABI (ffi)                 │ SIGALRM every N us
//!                 ▼                             │
//! ┌─────────────────────────────────────────────┴───────────────────┐
//! │                      rtprobe (This Crate)                       │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐        │
//! │  │    Agent     │──▶│   Sampling   │──▶│    Timers    │        │
//! │  │ (lifecycle)  │   │  (tick/FPU)  │   │  Registry    │        │
//! │  └──────────────┘   └──────┬───────┘   └──────────────┘        │
//! │         │                  │                                    │
//! │         ▼                  ▼                                    │
//! │  ┌──────────────┐   ┌──────────────┐                           │
//! │  │   Summary    │   │    Trace     │── frames ──▶ controller fd │
//! │  │ (stats.out)  │   │  (channel)   │                           │
//! │  └──────────────┘   └──────────────┘                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`agent`]: the per-process context; initialize, fork, shutdown
//! - [`timer`]: nestable CPU/wall timers readable from the signal handler
//! - [`registry`]: counters, the sampled set, message tags
//! - [`sampling`]: tick guard, decimation, FPU save, `SIGALRM` plumbing
//! - [`trace`]: the descriptor-backed trace channel (framing lives in
//!   `rtprobe-common`)
//! - [`cost`]: instrumentation cost meter and cycle calibration
//! - [`clock`]: clock trait, `clock_gettime` clock, scripted test clock
//! - [`config`]: agent configuration and the interval override
//! - [`summary`]: the plain-text summary file
//! - [`ffi`]: `extern "C"` entry points for injected code
//! - [`domain`]: newtypes and error types
//! - [`cli`]: arguments of the demo harness binary
//!
//! ## Signal Safety
//!
//! Everything reachable from the alarm handler is lock-free and
//! allocation-free: atomics, fixed arrays, a stack frame buffer and a single
//! `write(2)` per record. Logging happens only on mainline paths.

pub mod agent;
pub mod cli;
pub mod clock;
pub mod config;
pub mod cost;
pub mod domain;
pub mod ffi;
pub mod registry;
pub mod sampling;
pub mod summary;
pub mod timer;
pub mod trace;

pub use agent::Agent;
pub use config::{AgentConfig, AlarmMode};
