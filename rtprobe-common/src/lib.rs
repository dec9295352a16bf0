//! # Trace Wire Format (Agent ↔ Monitor)
//!
//! Defines the framed binary records the in-process agent writes to its
//! controller descriptor and the external monitor reads back. The layout is
//! produced by an explicit serializer (fixed field order, little-endian,
//! word-aligned payloads) rather than by copying native structs, so both
//! sides agree on the bytes regardless of compiler layout decisions.
//!
//! ## Frame Layout
//!
//! ```text
//! offset  size  field
//! 0       4     stream_id     (u32)
//! 4       2     record_type   (u16, see RECORD_* constants)
//! 6       2     payload_len   (u16, rounded up to WORD_SIZE)
//! 8       8     wall µs       (u64)
//! 16      8     cpu µs        (u64)
//! 24      n     payload       (zero padded to payload_len)
//! ```
//!
//! There are no boundary markers besides `payload_len`; readers must track
//! offsets exactly. [`FrameIter`] does that for a byte slice.
//!
//! ## Key Types
//!
//! - [`TraceRecord`] - In-memory tagged record, one variant per record type
//! - [`Frame`] - A decoded record with its stream id and timestamp pair
//! - [`encode_frame`] / [`decode_frame`] - The two directions of the codec

#![no_std]

use core::fmt;
use core::fmt::Write as _;

// ============================================================================
// Record Type Constants
// ============================================================================

/// Value of a timer or counter at a sampling tick
pub const RECORD_SAMPLE: u16 = 1;

/// Instrumentation overhead snapshot, one per performing tick
pub const RECORD_COST_UPDATE: u16 = 2;

/// A monitored process forked a child
pub const RECORD_FORK: u16 = 3;

/// A new synchronization resource (message tag) was seen
pub const RECORD_NEW_RESOURCE: u16 = 4;

/// Final summary statistics; the last record of a process
pub const RECORD_EXIT: u16 = 5;

// ============================================================================
// Layout Constants
// ============================================================================

/// Machine word size; payload lengths are rounded up to a multiple of it
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Bytes before the payload: stream id, type, length and the timestamp pair
pub const HEADER_LEN: usize = 24;

/// Largest frame the agent will build (it uses a stack buffer of this size)
pub const MAX_FRAME_LEN: usize = 1024;

/// Stream every agent record is written on
pub const DEFAULT_STREAM: u32 = 0;

/// Fixed width of the resource name field, NUL padded
pub const RESOURCE_NAME_LEN: usize = 64;

/// Fixed width of the resource abstraction field, NUL padded
pub const RESOURCE_ABSTRACTION_LEN: usize = 16;

pub const SAMPLE_PAYLOAD_LEN: usize = 16;
pub const COST_UPDATE_PAYLOAD_LEN: usize = 24;
pub const FORK_PAYLOAD_LEN: usize = 16;
pub const NEW_RESOURCE_PAYLOAD_LEN: usize = RESOURCE_NAME_LEN + RESOURCE_ABSTRACTION_LEN;
pub const EXIT_PAYLOAD_LEN: usize = 88;

/// Round `len` up to the next multiple of [`WORD_SIZE`]
#[must_use]
pub const fn align_to_word(len: usize) -> usize {
    (len + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

// ============================================================================
// Record Payloads
// ============================================================================

/// Wall-clock and process-CPU reading taken when a record is emitted (µs)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamps {
    pub wall: u64,
    pub cpu: u64,
}

/// One sampled value
///
/// Timers report seconds (total divided by the timer's normalization
/// factor); counters report their raw integer value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRecord {
    /// Identifier the monitor uses to correlate samples with a metric
    pub id: u32,
    pub value: f64,
}

/// Instrumentation overhead as of one sampling tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostUpdate {
    /// Instrumentation slots executed (not tracked, always 0)
    pub slots_executed: u64,
    /// Cumulative observed instrumentation cost in seconds
    pub observed_cost: f64,
    /// Seconds of wall time not spent on CPU since the previous update
    pub pause_time: f64,
}

/// Notice that the monitored process created a child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkRecord {
    /// Process that called fork (the emitter)
    pub ppid: i32,
    /// The new child
    pub pid: i32,
    /// Number of children described (always 1)
    pub npids: u32,
    pub stride: u32,
}

/// Announcement of a resource the monitor should add to its table
///
/// Both strings are stored in fixed, NUL padded fields. Longer inputs are
/// truncated at a character boundary.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NewResource {
    name: [u8; RESOURCE_NAME_LEN],
    abstraction: [u8; RESOURCE_ABSTRACTION_LEN],
}

/// End-of-run summary, mirrored in the plain-text summary file
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ExitStats {
    /// Alarm deliveries counted, decimated ones included
    pub alarms: u64,
    /// Ticks that performed a full sample
    pub num_reported: u64,
    /// Raw instrumentation cycle count
    pub inst_cycles: u64,
    /// Instrumentation cost in seconds
    pub inst_time: f64,
    /// CPU seconds spent inside sampling ticks
    pub handler_cost: f64,
    pub total_cpu_time: f64,
    pub total_wall_time: f64,
    /// Sample records emitted for timers and counters
    pub samples_reported: u64,
    /// Sampling interval in seconds
    pub sampling_rate: f64,
    pub user_ticks: u64,
    pub inst_ticks: u64,
}

/// In-memory form of a trace record
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TraceRecord {
    Sample(SampleRecord),
    CostUpdate(CostUpdate),
    Fork(ForkRecord),
    NewResource(NewResource),
    Exit(ExitStats),
}

/// A decoded frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub stream_id: u32,
    pub timestamps: Timestamps,
    pub record: TraceRecord,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// Output buffer cannot hold the frame
    BufferTooSmall { needed: usize, available: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes remain than the header or its declared payload needs
    Truncated { needed: usize, available: usize },
    UnknownRecordType(u16),
    /// Declared payload is shorter than the record type requires
    PayloadTooShort { record_type: u16, len: usize },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall { needed, available } => {
                write!(f, "frame needs {needed} bytes, buffer holds {available}")
            }
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, available } => {
                write!(f, "truncated frame: need {needed} bytes, have {available}")
            }
            Self::UnknownRecordType(t) => write!(f, "unknown record type {t}"),
            Self::PayloadTooShort { record_type, len } => {
                write!(f, "payload of {len} bytes too short for record type {record_type}")
            }
        }
    }
}

// ============================================================================
// NewResource
// ============================================================================

impl NewResource {
    /// Build a resource announcement from a name and an abstraction
    #[must_use]
    pub fn new(name: &str, abstraction: &str) -> Self {
        let mut res =
            Self { name: [0; RESOURCE_NAME_LEN], abstraction: [0; RESOURCE_ABSTRACTION_LEN] };
        copy_truncated(&mut res.name, name);
        copy_truncated(&mut res.abstraction, abstraction);
        res
    }

    /// Resource for a message-passing tag: `SyncObject/MsgTag/<tag>` under `BASE`
    #[must_use]
    pub fn message_tag(tag: i32) -> Self {
        let mut res =
            Self { name: [0; RESOURCE_NAME_LEN], abstraction: [0; RESOURCE_ABSTRACTION_LEN] };
        let mut out = FixedWriter { buf: &mut res.name, len: 0 };
        // Cannot overflow: the prefix plus an i32 is well under 64 bytes.
        let _ = write!(out, "SyncObject/MsgTag/{tag}");
        copy_truncated(&mut res.abstraction, "BASE");
        res
    }

    #[must_use]
    pub fn name(&self) -> &str {
        nul_terminated(&self.name)
    }

    #[must_use]
    pub fn abstraction(&self) -> &str {
        nul_terminated(&self.abstraction)
    }
}

impl fmt::Debug for NewResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewResource")
            .field("name", &self.name())
            .field("abstraction", &self.abstraction())
            .finish()
    }
}

/// `fmt::Write` over a fixed byte array, dropping what does not fit
struct FixedWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl fmt::Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let n = floor_char_boundary(s, room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        if n < s.len() {
            Err(fmt::Error)
        } else {
            Ok(())
        }
    }
}

fn copy_truncated(dst: &mut [u8], src: &str) {
    let n = floor_char_boundary(src, dst.len());
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    let mut n = max;
    while !s.is_char_boundary(n) {
        n -= 1;
    }
    n
}

fn nul_terminated(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    // Only ever filled from &str at char boundaries
    core::str::from_utf8(&bytes[..end]).unwrap_or("")
}

// ============================================================================
// Serializer
// ============================================================================

struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl ByteWriter<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.put(&v.to_le_bytes());
    }
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl ByteReader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    fn f64(&mut self) -> f64 {
        f64::from_le_bytes(self.take())
    }
}

impl TraceRecord {
    /// Wire type tag (one of the `RECORD_*` constants)
    #[must_use]
    pub const fn record_type(&self) -> u16 {
        match self {
            Self::Sample(_) => RECORD_SAMPLE,
            Self::CostUpdate(_) => RECORD_COST_UPDATE,
            Self::Fork(_) => RECORD_FORK,
            Self::NewResource(_) => RECORD_NEW_RESOURCE,
            Self::Exit(_) => RECORD_EXIT,
        }
    }

    /// Payload size before word alignment
    #[must_use]
    pub const fn payload_len(&self) -> usize {
        payload_len_for(self.record_type())
    }

    fn write_payload(&self, w: &mut ByteWriter<'_>) {
        match self {
            Self::Sample(s) => {
                w.u32(s.id);
                w.u32(0);
                w.f64(s.value);
            }
            Self::CostUpdate(c) => {
                w.u64(c.slots_executed);
                w.f64(c.observed_cost);
                w.f64(c.pause_time);
            }
            Self::Fork(fr) => {
                w.i32(fr.ppid);
                w.i32(fr.pid);
                w.u32(fr.npids);
                w.u32(fr.stride);
            }
            Self::NewResource(r) => {
                w.put(&r.name);
                w.put(&r.abstraction);
            }
            Self::Exit(e) => {
                w.u64(e.alarms);
                w.u64(e.num_reported);
                w.u64(e.inst_cycles);
                w.f64(e.inst_time);
                w.f64(e.handler_cost);
                w.f64(e.total_cpu_time);
                w.f64(e.total_wall_time);
                w.u64(e.samples_reported);
                w.f64(e.sampling_rate);
                w.u64(e.user_ticks);
                w.u64(e.inst_ticks);
            }
        }
    }

    fn read_payload(record_type: u16, payload: &[u8]) -> Result<Self, DecodeError> {
        let needed = payload_len_for(record_type);
        if needed == 0 {
            return Err(DecodeError::UnknownRecordType(record_type));
        }
        if payload.len() < needed {
            return Err(DecodeError::PayloadTooShort { record_type, len: payload.len() });
        }

        let mut r = ByteReader { buf: payload, pos: 0 };
        let record = match record_type {
            RECORD_SAMPLE => {
                let id = r.u32();
                let _pad = r.u32();
                Self::Sample(SampleRecord { id, value: r.f64() })
            }
            RECORD_COST_UPDATE => Self::CostUpdate(CostUpdate {
                slots_executed: r.u64(),
                observed_cost: r.f64(),
                pause_time: r.f64(),
            }),
            RECORD_FORK => Self::Fork(ForkRecord {
                ppid: r.i32(),
                pid: r.i32(),
                npids: r.u32(),
                stride: r.u32(),
            }),
            RECORD_NEW_RESOURCE => Self::NewResource(NewResource {
                name: r.take(),
                abstraction: r.take(),
            }),
            _ => Self::Exit(ExitStats {
                alarms: r.u64(),
                num_reported: r.u64(),
                inst_cycles: r.u64(),
                inst_time: r.f64(),
                handler_cost: r.f64(),
                total_cpu_time: r.f64(),
                total_wall_time: r.f64(),
                samples_reported: r.u64(),
                sampling_rate: r.f64(),
                user_ticks: r.u64(),
                inst_ticks: r.u64(),
            }),
        };
        Ok(record)
    }
}

const fn payload_len_for(record_type: u16) -> usize {
    match record_type {
        RECORD_SAMPLE => SAMPLE_PAYLOAD_LEN,
        RECORD_COST_UPDATE => COST_UPDATE_PAYLOAD_LEN,
        RECORD_FORK => FORK_PAYLOAD_LEN,
        RECORD_NEW_RESOURCE => NEW_RESOURCE_PAYLOAD_LEN,
        RECORD_EXIT => EXIT_PAYLOAD_LEN,
        _ => 0,
    }
}

/// Total frame size for `record`, header and padding included
#[must_use]
pub const fn frame_len(record: &TraceRecord) -> usize {
    align_to_word(HEADER_LEN) + align_to_word(record.payload_len())
}

/// Serialize one frame into `buf`, returning the number of bytes used
///
/// The payload is zero padded up to the word boundary and the padded length
/// is what goes into the header, so the next frame starts word aligned.
///
/// # Errors
/// Returns [`EncodeError::BufferTooSmall`] if `buf` cannot hold the frame.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_frame(
    stream_id: u32,
    timestamps: Timestamps,
    record: &TraceRecord,
    buf: &mut [u8],
) -> Result<usize, EncodeError> {
    let payload_len = align_to_word(record.payload_len());
    let payload_offset = align_to_word(HEADER_LEN);
    let total = payload_offset + payload_len;
    if buf.len() < total {
        return Err(EncodeError::BufferTooSmall { needed: total, available: buf.len() });
    }

    buf[..total].fill(0);
    let mut w = ByteWriter { buf, pos: 0 };
    w.u32(stream_id);
    w.u16(record.record_type());
    // payload_len <= EXIT_PAYLOAD_LEN rounded, always fits in u16
    w.u16(payload_len as u16);
    w.u64(timestamps.wall);
    w.u64(timestamps.cpu);
    w.pos = payload_offset;
    record.write_payload(&mut w);

    Ok(total)
}

/// Decode the frame at the start of `bytes`
///
/// Returns the frame and the number of bytes it occupied, so the caller can
/// advance to the next one.
///
/// # Errors
/// Returns a [`DecodeError`] if the bytes are truncated, the record type is
/// unknown, or the declared payload is too short for its type.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), DecodeError> {
    let payload_offset = align_to_word(HEADER_LEN);
    if bytes.len() < payload_offset {
        return Err(DecodeError::Truncated { needed: payload_offset, available: bytes.len() });
    }

    let mut r = ByteReader { buf: bytes, pos: 0 };
    let stream_id = r.u32();
    let record_type = r.u16();
    let payload_len = usize::from(r.u16());
    let timestamps = Timestamps { wall: r.u64(), cpu: r.u64() };

    let total = payload_offset + payload_len;
    if bytes.len() < total {
        return Err(DecodeError::Truncated { needed: total, available: bytes.len() });
    }

    let record = TraceRecord::read_payload(record_type, &bytes[payload_offset..total])?;
    Ok((Frame { stream_id, timestamps, record }, total))
}

/// Iterates the frames of a captured trace stream
///
/// Stops after the first decode error (offsets cannot be recovered once the
/// stream is out of step).
pub struct FrameIter<'a> {
    bytes: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> FrameIter<'a> {
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0, failed: false }
    }

    /// Byte offset of the next frame
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Iterator for FrameIter<'_> {
    type Item = Result<Frame, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.bytes.len() {
            return None;
        }
        match decode_frame(&self.bytes[self.offset..]) {
            Ok((frame, used)) => {
                self.offset += used;
                Some(Ok(frame))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
