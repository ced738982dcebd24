use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::event::Event;

/// Ownership boundary between the queues and whoever allocates events.
///
/// A queue calls `inc_ref` once per logical storage slot it takes and
/// `dec_ref` exactly once per slot it surrenders (delivery or cancellation).
/// What happens when the count crosses zero is the recycler's business.
pub trait EventRecycler: Send + Sync {
    fn inc_ref(&self, event: &Event);
    fn dec_ref(&self, event: &Event);
}

/// Default recycler. Keeps aggregate counters so tests and the stats report
/// can audit that every reference taken was eventually given back.
///
/// With `shared_events` set, events are being passed directly between
/// threads, and the pool adjusts the event's input-side counter instead of
/// the main one; an event is considered reclaimable only when both reach
/// zero. Queues never observe the difference.
pub struct EventPool {
    shared_events: bool,
    increments: AtomicUsize,
    decrements: AtomicUsize,
    reclaimed: AtomicUsize,
}

/// Snapshot of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub increments: usize,
    pub decrements: usize,
    pub reclaimed: usize,
}

impl EventPool {
    pub fn new(shared_events: bool) -> Self {
        EventPool {
            shared_events,
            increments: AtomicUsize::new(0),
            decrements: AtomicUsize::new(0),
            reclaimed: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            increments: self.increments.load(Ordering::Acquire),
            decrements: self.decrements.load(Ordering::Acquire),
            reclaimed: self.reclaimed.load(Ordering::Acquire),
        }
    }

    /// Net outstanding references handed to queues.
    pub fn outstanding(&self) -> isize {
        let s = self.stats();
        s.increments as isize - s.decrements as isize
    }
}

impl Default for EventPool {
    fn default() -> Self {
        EventPool::new(false)
    }
}

impl EventRecycler for EventPool {
    fn inc_ref(&self, event: &Event) {
        self.increments.fetch_add(1, Ordering::AcqRel);
        event.counter(self.shared_events).fetch_add(1, Ordering::AcqRel);
    }

    fn dec_ref(&self, event: &Event) {
        self.decrements.fetch_add(1, Ordering::AcqRel);
        let prev = event.counter(self.shared_events).fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "reference count underflow on {event}");
        if prev == 1 && event.counter(!self.shared_events).load(Ordering::Acquire) == 0 {
            self.reclaimed.fetch_add(1, Ordering::AcqRel);
        }
    }
}
