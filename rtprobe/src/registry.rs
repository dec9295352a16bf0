//! # Counter Registry
//!
//! Integer counters, the set of timers and counters each sampling tick
//! reports, and the table of message tags announced to the monitor.
//!
//! Everything here is fixed-capacity and append-only so the alarm handler
//! can walk it without allocating or locking. Mainline code appends; the
//! handler only reads. A slot is written before the count that publishes it.

#![allow(unsafe_code)] // slot pointers are dereferenced as &'static

use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicPtr, AtomicUsize, Ordering};

use crate::domain::Fault;
use crate::timer::Timer;

/// Message tags the registry can hold before it is a fatal error
pub const TAG_LIMIT: usize = 1000;

/// Timers (and, separately, counters) a tick can report
pub const SAMPLE_SET_CAPACITY: usize = 256;

/// A named integer value updated by instrumented code
#[derive(Debug)]
pub struct Counter {
    id: u32,
    value: AtomicI64,
}

impl Counter {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self { id, value: AtomicI64::new(0) }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::SeqCst);
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::SeqCst);
    }
}

/// Fixed array of `'static` references, appended to from mainline code and
/// read from the alarm handler
struct StaticSlots<T: 'static> {
    slots: [AtomicPtr<T>; SAMPLE_SET_CAPACITY],
    len: AtomicUsize,
    what: &'static str,
}

impl<T: 'static> StaticSlots<T> {
    fn new(what: &'static str) -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            len: AtomicUsize::new(0),
            what,
        }
    }

    fn push(&self, item: &'static T) -> Result<(), Fault> {
        let raw = ptr::from_ref(item).cast_mut();
        let len = self.len.load(Ordering::Acquire);
        if self.slots[..len].iter().any(|slot| slot.load(Ordering::Acquire) == raw) {
            return Ok(());
        }
        if len == SAMPLE_SET_CAPACITY {
            return Err(Fault::SampleSetFull { what: self.what, capacity: SAMPLE_SET_CAPACITY });
        }
        self.slots[len].store(raw, Ordering::Release);
        self.len.store(len + 1, Ordering::Release);
        Ok(())
    }

    fn iter(&self) -> impl Iterator<Item = &'static T> + '_ {
        let len = self.len.load(Ordering::Acquire);
        self.slots[..len].iter().filter_map(|slot| {
            // SAFETY: only pointers derived from &'static T are ever stored
            unsafe { slot.load(Ordering::Acquire).cast_const().as_ref() }
        })
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

/// Timers and counters reported on every performing tick
pub struct SampleSet {
    timers: StaticSlots<Timer>,
    counters: StaticSlots<Counter>,
}

impl SampleSet {
    #[must_use]
    pub fn new() -> Self {
        Self { timers: StaticSlots::new("timer"), counters: StaticSlots::new("counter") }
    }

    /// Add a timer; adding the same timer twice has no effect
    ///
    /// # Errors
    /// Returns [`Fault::SampleSetFull`] past [`SAMPLE_SET_CAPACITY`] timers.
    pub fn add_timer(&self, timer: &'static Timer) -> Result<(), Fault> {
        self.timers.push(timer)
    }

    /// Add a counter; adding the same counter twice has no effect
    ///
    /// # Errors
    /// Returns [`Fault::SampleSetFull`] past [`SAMPLE_SET_CAPACITY`] counters.
    pub fn add_counter(&self, counter: &'static Counter) -> Result<(), Fault> {
        self.counters.push(counter)
    }

    pub fn timers(&self) -> impl Iterator<Item = &'static Timer> + '_ {
        self.timers.iter()
    }

    pub fn counters(&self) -> impl Iterator<Item = &'static Counter> + '_ {
        self.counters.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.timers.len() + self.counters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SampleSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Message tags seen by instrumented code, in first-seen order
pub struct TagRegistry {
    tags: [AtomicI32; TAG_LIMIT],
    count: AtomicUsize,
    reported: AtomicUsize,
}

impl TagRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tags: std::array::from_fn(|_| AtomicI32::new(0)),
            count: AtomicUsize::new(0),
            reported: AtomicUsize::new(0),
        }
    }

    /// Record `tag`, returning whether it was new
    ///
    /// # Errors
    /// Returns [`Fault::TagOverflow`] when a new tag arrives with the table
    /// already holding [`TAG_LIMIT`] tags.
    pub fn record(&self, tag: i32) -> Result<bool, Fault> {
        let count = self.count.load(Ordering::Acquire);
        if self.tags[..count].iter().any(|t| t.load(Ordering::Relaxed) == tag) {
            return Ok(false);
        }
        if count == TAG_LIMIT {
            return Err(Fault::TagOverflow { limit: TAG_LIMIT });
        }
        self.tags[count].store(tag, Ordering::Relaxed);
        self.count.store(count + 1, Ordering::Release);
        Ok(true)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand every tag recorded since the previous call to `announce`
    ///
    /// Passes never overlap in what they hand out, even if one interrupts
    /// another, so no tag is announced twice.
    pub fn drain_unreported(&self, mut announce: impl FnMut(i32)) -> usize {
        let count = self.count.load(Ordering::Acquire);
        let from = self.reported.fetch_max(count, Ordering::AcqRel);
        if from >= count {
            return 0;
        }
        for slot in &self.tags[from..count] {
            announce(slot.load(Ordering::Relaxed));
        }
        count - from
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TimerKind;

    #[test]
    fn test_counter_updates() {
        let counter = Counter::new(9);
        counter.add(5);
        counter.add(-2);
        assert_eq!(counter.value(), 3);
        counter.set(40);
        assert_eq!(counter.value(), 40);
        assert_eq!(counter.id(), 9);
    }

    #[test]
    fn test_sample_set_keeps_order_and_skips_duplicates() {
        static A: Timer = Timer::new(1, TimerKind::WallTime);
        static B: Timer = Timer::new(2, TimerKind::ProcessTime);
        static C: Counter = Counter::new(3);

        let set = SampleSet::new();
        set.add_timer(&A).unwrap();
        set.add_timer(&B).unwrap();
        set.add_timer(&A).unwrap();
        set.add_counter(&C).unwrap();

        let ids: Vec<u32> = set.timers().map(Timer::id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(set.counters().count(), 1);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_sample_set_capacity() {
        let set = SampleSet::new();
        for id in 0..SAMPLE_SET_CAPACITY {
            let counter: &'static Counter =
                Box::leak(Box::new(Counter::new(u32::try_from(id).unwrap())));
            set.add_counter(counter).unwrap();
        }
        let extra: &'static Counter = Box::leak(Box::new(Counter::new(9_999)));
        assert_eq!(
            set.add_counter(extra).unwrap_err(),
            Fault::SampleSetFull { what: "counter", capacity: SAMPLE_SET_CAPACITY }
        );
    }

    #[test]
    fn test_tags_deduplicated_in_insertion_order() {
        let tags = TagRegistry::new();
        assert!(tags.record(7).unwrap());
        assert!(tags.record(3).unwrap());
        assert!(!tags.record(7).unwrap());
        assert_eq!(tags.len(), 2);

        let mut seen = Vec::new();
        assert_eq!(tags.drain_unreported(|t| seen.push(t)), 2);
        assert_eq!(seen, vec![7, 3]);
    }

    #[test]
    fn test_only_new_tags_are_announced() {
        let tags = TagRegistry::new();
        tags.record(1).unwrap();
        tags.drain_unreported(|_| {});

        assert_eq!(tags.drain_unreported(|_| panic!("nothing new")), 0);

        tags.record(1).unwrap();
        tags.record(2).unwrap();
        let mut seen = Vec::new();
        tags.drain_unreported(|t| seen.push(t));
        assert_eq!(seen, vec![2]);
    }

    #[test]
    fn test_tag_overflow() {
        let tags = TagRegistry::new();
        for tag in 0..i32::try_from(TAG_LIMIT).unwrap() {
            tags.record(tag).unwrap();
        }
        // Known tags are still fine at capacity
        assert!(!tags.record(0).unwrap());
        assert_eq!(tags.record(-1).unwrap_err(), Fault::TagOverflow { limit: TAG_LIMIT });
    }
}
