//! Descriptor-backed trace channel

#![allow(unsafe_code)] // dup/write/close/fstat/fdatasync via libc

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use rtprobe_common::{encode_frame, Timestamps, TraceRecord, MAX_FRAME_LEN};

use crate::clock::Clock;
use crate::domain::errors::last_errno;
use crate::domain::ChannelError;

const CLOSED: i32 = -1;

/// Output side of the trace stream
///
/// Holds a private duplicate of the controller descriptor, opened on first
/// use and closed after an Exit record. Everything is atomic so an alarm
/// tick can emit while mainline code is between calls.
#[derive(Debug)]
pub struct TraceChannel {
    controller_fd: i32,
    out_fd: AtomicI32,
    regular_file: AtomicBool,
    gone: AtomicBool,
    last_errno: AtomicI32,
    records: AtomicU64,
    syncs: AtomicU64,
}

impl TraceChannel {
    #[must_use]
    pub const fn new(controller_fd: i32) -> Self {
        Self {
            controller_fd,
            out_fd: AtomicI32::new(CLOSED),
            regular_file: AtomicBool::new(false),
            gone: AtomicBool::new(false),
            last_errno: AtomicI32::new(0),
            records: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        }
    }

    /// Frame `record` and write it in a single call
    ///
    /// Once the channel is disabled this returns `Ok` without writing. An
    /// Exit record closes the duplicate afterwards; the next record reopens
    /// it.
    ///
    /// # Errors
    /// Returns the [`ChannelError`] that disabled the channel, or
    /// [`ChannelError::Oversized`] (which leaves it enabled) if the record
    /// cannot be framed.
    pub fn emit<C: Clock + ?Sized>(
        &self,
        clock: &C,
        stream_id: u32,
        record: &TraceRecord,
        flush: bool,
    ) -> Result<(), ChannelError> {
        if self.is_disabled() {
            return Ok(());
        }

        let timestamps = Timestamps { wall: clock.wall_time(), cpu: clock.cpu_time() };
        let mut buf = [0u8; MAX_FRAME_LEN];
        let len =
            encode_frame(stream_id, timestamps, record, &mut buf).map_err(ChannelError::Oversized)?;

        let fd = self.ensure_open().map_err(|e| self.disable(e))?;

        // SAFETY: buf is valid for len bytes
        let written = unsafe { libc::write(fd, buf.as_ptr().cast(), len) };
        if written < 0 {
            return Err(self.disable(ChannelError::Write { errno: last_errno() }));
        }
        #[allow(clippy::cast_sign_loss)]
        let written = written as usize;
        if written != len {
            return Err(self.disable(ChannelError::ShortWrite { written, len }));
        }
        self.records.fetch_add(1, Ordering::Relaxed);

        if flush {
            self.flush();
        }
        if matches!(record, TraceRecord::Exit(_)) {
            self.close();
        }
        Ok(())
    }

    /// Push written records to stable storage
    ///
    /// Only regular files are synced; pipes and sockets have nothing to
    /// flush since nothing is buffered in user space. The sync can block on
    /// the disk, so the alarm path never asks for it.
    pub fn flush(&self) {
        let fd = self.out_fd.load(Ordering::SeqCst);
        if fd != CLOSED && self.regular_file.load(Ordering::SeqCst) {
            // SAFETY: fd is our own duplicate
            unsafe { libc::fdatasync(fd) };
            self.syncs.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Close the duplicate, if open
    pub fn close(&self) {
        let fd = self.out_fd.swap(CLOSED, Ordering::SeqCst);
        if fd != CLOSED {
            // SAFETY: fd is our own duplicate and no longer published
            unsafe { libc::close(fd) };
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.out_fd.load(Ordering::SeqCst) != CLOSED
    }

    /// True once a channel fault has switched emission off
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.gone.load(Ordering::SeqCst)
    }

    /// errno of the fault that disabled the channel (0 for a short write)
    #[must_use]
    pub fn disabled_errno(&self) -> Option<i32> {
        self.is_disabled().then(|| self.last_errno.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    /// Storage syncs issued by [`flush`](Self::flush)
    #[must_use]
    pub fn syncs_issued(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<i32, ChannelError> {
        let fd = self.out_fd.load(Ordering::SeqCst);
        if fd != CLOSED {
            return Ok(fd);
        }

        // SAFETY: dup on any integer is safe; failure is reported via errno
        let dup = unsafe { libc::dup(self.controller_fd) };
        if dup < 0 {
            return Err(ChannelError::Open { fd: self.controller_fd, errno: last_errno() });
        }

        match self.out_fd.compare_exchange(CLOSED, dup, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => {
                self.regular_file.store(is_regular_file(dup), Ordering::SeqCst);
                Ok(dup)
            }
            Err(current) => {
                // A tick opened the channel first
                // SAFETY: dup was never published
                unsafe { libc::close(dup) };
                Ok(current)
            }
        }
    }

    fn disable(&self, err: ChannelError) -> ChannelError {
        let errno = match err {
            ChannelError::Open { errno, .. } | ChannelError::Write { errno } => errno,
            ChannelError::ShortWrite { .. } | ChannelError::Oversized(_) => 0,
        };
        self.last_errno.store(errno, Ordering::SeqCst);
        self.gone.store(true, Ordering::SeqCst);
        err
    }
}

impl Drop for TraceChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_regular_file(fd: i32) -> bool {
    // SAFETY: an all-zero stat is a valid out buffer
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: st is writable
    let rc = unsafe { libc::fstat(fd, &mut st) };
    rc == 0 && (st.st_mode & libc::S_IFMT) == libc::S_IFREG
}
