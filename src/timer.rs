//! Deadline queue driving the reactor's timer surface.
//!
//! Deadlines live in a binary heap; the earliest one caps the reactor's poll
//! timeout, and expired entries run right after event dispatch. Additions
//! and cancellations are safe from any thread; the reactor wakes itself so a
//! new earlier deadline shortens the current poll wait.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Handle for cancelling a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

type TimerCallback = Box<dyn FnMut() + Send>;

struct TimerEntry {
    when: Instant,
    seq: u64,
    interval: Option<Duration>,
    callback: TimerCallback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the earliest deadline sits on top of the max-heap.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct TimerQueue {
    heap: Mutex<BinaryHeap<TimerEntry>>,
    cancelled: Mutex<HashSet<u64>>,
    next_seq: AtomicU64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        TimerQueue {
            heap: Mutex::new(BinaryHeap::new()),
            cancelled: Mutex::new(HashSet::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    pub(crate) fn add(
        &self,
        when: Instant,
        interval: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().unwrap().push(TimerEntry {
            when,
            seq,
            interval,
            callback,
        });
        TimerId(seq)
    }

    pub(crate) fn cancel(&self, id: TimerId) {
        self.cancelled.lock().unwrap().insert(id.0);
    }

    /// Poll timeout: the earlier of `default` and the next deadline.
    pub(crate) fn next_timeout(&self, default: Duration) -> Duration {
        let heap = self.heap.lock().unwrap();
        match heap.peek() {
            Some(entry) => default.min(entry.when.saturating_duration_since(Instant::now())),
            None => default,
        }
    }

    /// Run every expired callback. Callbacks run outside the heap lock so
    /// they may schedule further timers.
    pub(crate) fn run_expired(&self) {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut heap = self.heap.lock().unwrap();
            while heap.peek().map_or(false, |entry| entry.when <= now) {
                due.push(heap.pop().unwrap());
            }
        }
        for mut entry in due {
            if self.cancelled.lock().unwrap().remove(&entry.seq) {
                continue;
            }
            (entry.callback)();
            if let Some(interval) = entry.interval {
                if !self.cancelled.lock().unwrap().remove(&entry.seq) {
                    entry.when = now + interval;
                    self.heap.lock().unwrap().push(entry);
                }
            }
        }
    }
}
