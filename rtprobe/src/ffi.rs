//! C ABI for injected instrumentation
//!
//! The instrumentation collaborator patches calls to these symbols into the
//! monitored program. They all act on one process-global [`Agent`], built
//! on first use from [`AgentConfig::from_env`] on [`CONTROLLER_FD`] with the
//! system clock. `rtprobe_init` then initializes it and arms the alarm.
//!
//! Timers and counters handed out here are never freed; they join the set
//! of values every sampling tick reports.

#![allow(unsafe_code)] // extern "C" entry points taking raw pointers

use std::ffi::c_int;
use std::ptr;
use std::sync::{Arc, OnceLock};

use crate::agent::Agent;
use crate::clock::SystemClock;
use crate::config::{AgentConfig, CONTROLLER_FD};
use crate::domain::TimerKind;
use crate::registry::Counter;
use crate::timer::Timer;

static AGENT: OnceLock<Arc<Agent>> = OnceLock::new();

/// The process-global agent
pub fn agent() -> &'static Arc<Agent> {
    AGENT.get_or_init(|| Arc::new(Agent::new(AgentConfig::from_env(CONTROLLER_FD), SystemClock)))
}

/// Initialize the agent; stops the process with `SIGSTOP` unless
/// `skip_break` is non-zero
#[no_mangle]
pub extern "C" fn rtprobe_init(skip_break: c_int) {
    agent().initialize(skip_break != 0);
}

/// Final report; call once as the program exits
#[no_mangle]
pub extern "C" fn rtprobe_exit() {
    agent().shutdown();
}

/// Call after `fork` in both processes with its return value
#[no_mangle]
pub extern "C" fn rtprobe_fork(pid: c_int) {
    agent().handle_fork(pid);
}

/// Create a timer (`kind` 0 for CPU time, anything else for wall time)
#[no_mangle]
pub extern "C" fn rtprobe_timer_new(id: u32, kind: c_int) -> *const Timer {
    let timer: &'static Timer = Box::leak(Box::new(Timer::new(id, TimerKind::from_raw(kind))));
    agent().register_timer(timer);
    ptr::from_ref(timer)
}

/// # Safety
/// `timer` must be null or a pointer returned by [`rtprobe_timer_new`].
#[no_mangle]
pub unsafe extern "C" fn rtprobe_timer_start(timer: *const Timer) {
    // SAFETY: upheld by the caller
    if let Some(timer) = unsafe { timer.as_ref() } {
        agent().start_timer(timer);
    }
}

/// # Safety
/// `timer` must be null or a pointer returned by [`rtprobe_timer_new`].
#[no_mangle]
pub unsafe extern "C" fn rtprobe_timer_stop(timer: *const Timer) {
    // SAFETY: upheld by the caller
    if let Some(timer) = unsafe { timer.as_ref() } {
        agent().stop_timer(timer);
    }
}

/// # Safety
/// `timer` must be null or a pointer returned by [`rtprobe_timer_new`].
#[no_mangle]
pub unsafe extern "C" fn rtprobe_report_timer(timer: *const Timer) {
    // SAFETY: upheld by the caller
    if let Some(timer) = unsafe { timer.as_ref() } {
        agent().report_timer(timer);
    }
}

/// Create a counter starting at zero
#[no_mangle]
pub extern "C" fn rtprobe_counter_new(id: u32) -> *const Counter {
    let counter: &'static Counter = Box::leak(Box::new(Counter::new(id)));
    agent().register_counter(counter);
    ptr::from_ref(counter)
}

/// # Safety
/// `counter` must be null or a pointer returned by [`rtprobe_counter_new`].
#[no_mangle]
pub unsafe extern "C" fn rtprobe_counter_add(counter: *const Counter, delta: i64) {
    // SAFETY: upheld by the caller
    if let Some(counter) = unsafe { counter.as_ref() } {
        counter.add(delta);
    }
}

/// # Safety
/// `counter` must be null or a pointer returned by [`rtprobe_counter_new`].
#[no_mangle]
pub unsafe extern "C" fn rtprobe_report_counter(counter: *const Counter) {
    // SAFETY: upheld by the caller
    if let Some(counter) = unsafe { counter.as_ref() } {
        agent().report_counter(counter);
    }
}

/// Report the cumulative instrumentation cost under `counter`'s id
///
/// # Safety
/// `counter` must be null or a pointer returned by [`rtprobe_counter_new`].
#[no_mangle]
pub unsafe extern "C" fn rtprobe_report_cost(counter: *const Counter) {
    // SAFETY: upheld by the caller
    if let Some(counter) = unsafe { counter.as_ref() } {
        agent().report_cost(counter);
    }
}

#[no_mangle]
pub extern "C" fn rtprobe_record_tag(tag: c_int) {
    agent().record_tag(tag);
}

#[no_mangle]
pub extern "C" fn rtprobe_report_new_tags() {
    agent().report_new_tags();
}

/// Add cycles spent in instrumentation to the cost model
#[no_mangle]
pub extern "C" fn rtprobe_record_cycles(cycles: u64) {
    agent().record_instrumentation_cycles(cycles);
}

#[no_mangle]
pub extern "C" fn rtprobe_pause() {
    agent().pause_process();
}

#[no_mangle]
pub extern "C" fn rtprobe_continue() {
    agent().continue_process();
}

#[no_mangle]
pub extern "C" fn rtprobe_break_point() {
    agent().break_point();
}
