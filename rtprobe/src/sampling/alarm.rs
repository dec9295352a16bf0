//! `SIGALRM` delivery
//!
//! `arm` installs [`alarm_handler`] for `SIGALRM` (every other signal blocked
//! while it runs, `SA_RESTART` so interrupted syscalls in the program resume)
//! and starts a periodic `ITIMER_REAL`. The handler finds the agent through
//! a process-global pointer published by `arm` and cleared by `disarm`.
//!
//! The handler stays installed after `disarm`. With no agent published it
//! returns immediately, so a `SIGALRM` still pending at disarm time cannot
//! fall through to the default action and kill the process.

#![allow(unsafe_code)] // sigaction/setitimer and the raw agent pointer

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::agent::Agent;
use crate::domain::errors::last_errno;
use crate::domain::Fault;

/// Agent the alarm handler reports for, null when none is armed
static ACTIVE_AGENT: AtomicPtr<Agent> = AtomicPtr::new(ptr::null_mut());

extern "C" fn alarm_handler(_signo: libc::c_int) {
    // SAFETY: errno is thread-local and always addressable
    let saved_errno = unsafe { *libc::__errno_location() };

    let agent = ACTIVE_AGENT.load(Ordering::SeqCst);
    // SAFETY: the pointer comes from a live Arc<Agent>; the agent's Drop
    // clears it before any field is torn down
    if let Some(agent) = unsafe { agent.as_ref() } {
        agent.on_alarm();
    }

    // SAFETY: as above
    unsafe { *libc::__errno_location() = saved_errno };
}

/// Deliver sampling ticks to `agent` every `interval_us` microseconds
///
/// Replaces any previously armed agent.
///
/// # Errors
/// Returns [`Fault::SignalSetup`] if the handler or the interval timer
/// cannot be installed.
pub fn arm(agent: &Arc<Agent>, interval_us: u32) -> Result<(), Fault> {
    ACTIVE_AGENT.store(Arc::as_ptr(agent).cast_mut(), Ordering::SeqCst);

    // SAFETY: an all-zero sigaction is valid before the fields are set
    let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
    act.sa_sigaction = alarm_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
    act.sa_flags = libc::SA_RESTART;
    // SAFETY: act.sa_mask is a valid sigset_t
    unsafe { libc::sigfillset(&mut act.sa_mask) };

    // SAFETY: act is fully initialized
    if unsafe { libc::sigaction(libc::SIGALRM, &act, ptr::null_mut()) } != 0 {
        let errno = last_errno();
        clear(agent);
        return Err(Fault::SignalSetup { call: "sigaction(SIGALRM)", errno });
    }

    let interval = interval_timeval(interval_us);
    let timer = libc::itimerval { it_interval: interval, it_value: interval };
    // SAFETY: timer is a valid itimerval
    if unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut()) } != 0 {
        let errno = last_errno();
        clear(agent);
        return Err(Fault::SignalSetup { call: "setitimer(ITIMER_REAL)", errno });
    }

    info!("Sampling alarm armed: every {interval_us}us");
    Ok(())
}

/// Stop ticks for `agent`; a no-op if some other agent (or none) is armed
pub fn disarm(agent: &Agent) {
    let me = ptr::from_ref(agent).cast_mut();
    if ACTIVE_AGENT.load(Ordering::SeqCst) != me {
        return;
    }

    let zero = libc::timeval { tv_sec: 0, tv_usec: 0 };
    let timer = libc::itimerval { it_interval: zero, it_value: zero };
    // SAFETY: timer is a valid itimerval
    unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut()) };

    let cleared =
        ACTIVE_AGENT.compare_exchange(me, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst);
    if cleared.is_ok() {
        debug!("Sampling alarm disarmed");
    }
}

/// True if `agent` is the one receiving ticks
#[must_use]
pub fn is_armed(agent: &Agent) -> bool {
    ACTIVE_AGENT.load(Ordering::SeqCst) == ptr::from_ref(agent).cast_mut()
}

fn clear(agent: &Agent) {
    let me = ptr::from_ref(agent).cast_mut();
    let _ = ACTIVE_AGENT.compare_exchange(me, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst);
}

#[allow(clippy::cast_lossless)]
fn interval_timeval(interval_us: u32) -> libc::timeval {
    libc::timeval {
        tv_sec: (interval_us / 1_000_000) as libc::time_t,
        tv_usec: (interval_us % 1_000_000) as libc::suseconds_t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_split() {
        let tv = interval_timeval(2_500_000);
        assert_eq!(tv.tv_sec, 2);
        assert_eq!(tv.tv_usec, 500_000);

        let tv = interval_timeval(100_000);
        assert_eq!(tv.tv_sec, 0);
        assert_eq!(tv.tv_usec, 100_000);
    }
}
