//! Trace output
//!
//! Records are framed by `rtprobe_common::encode_frame` and written to the
//! controller descriptor through a [`TraceChannel`]:
//!
//! ```text
//! TraceRecord ──encode──► [u8; MAX_FRAME_LEN] ──write(2)──► dup(controller fd) ──► monitor
//!                            (stack buffer)       one call
//! ```
//!
//! The channel never buffers in user space and never retries. The first
//! failed write marks it gone for the rest of the process.

mod channel;

pub use channel::TraceChannel;
