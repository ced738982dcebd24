use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering as MemOrdering};

use crate::time::Time;

/// Identifier of a simulation agent. Opaque to the queues; only equality,
/// ordering, and hashing are ever used.
pub type AgentId = u64;

/// Shared handle to an immutable pending event.
///
/// The `Arc` keeps the memory alive; the simulation-level ownership ledger is
/// the explicit reference count inside [`Event`], driven exclusively through
/// an [`crate::EventRecycler`].
pub type EventRef = Arc<Event>;

/// One scheduled event. Immutable once enqueued; the queues never touch
/// anything but the reference counters.
#[derive(Debug)]
pub struct Event {
    receive_time: Time,
    sent_time: Time,
    receiver: AgentId,
    sender: AgentId,
    anti_message: bool,
    /// Main ownership counter. Starts at 1 for the creator's reference.
    ref_count: AtomicU32,
    /// Input-side counter used when events are shared between threads and
    /// the recycler runs in split-counter mode.
    input_refs: AtomicU32,
}

impl Event {
    pub fn new(sender: AgentId, receiver: AgentId, sent_time: Time, receive_time: Time) -> EventRef {
        Self::build(sender, receiver, sent_time, receive_time, false)
    }

    /// Create an anti-message for cancellation of a previously sent event.
    /// Anti-messages may be enqueued but must never be delivered.
    pub fn new_anti_message(
        sender: AgentId,
        receiver: AgentId,
        sent_time: Time,
        receive_time: Time,
    ) -> EventRef {
        Self::build(sender, receiver, sent_time, receive_time, true)
    }

    fn build(
        sender: AgentId,
        receiver: AgentId,
        sent_time: Time,
        receive_time: Time,
        anti_message: bool,
    ) -> EventRef {
        debug_assert!(sent_time <= receive_time, "event sent after it is received");
        Arc::new(Event {
            receive_time,
            sent_time,
            receiver,
            sender,
            anti_message,
            ref_count: AtomicU32::new(1),
            input_refs: AtomicU32::new(0),
        })
    }

    pub fn receive_time(&self) -> Time {
        self.receive_time
    }

    pub fn sent_time(&self) -> Time {
        self.sent_time
    }

    pub fn receiver(&self) -> AgentId {
        self.receiver
    }

    pub fn sender(&self) -> AgentId {
        self.sender
    }

    pub fn is_anti_message(&self) -> bool {
        self.anti_message
    }

    pub fn reference_count(&self) -> u32 {
        self.ref_count.load(MemOrdering::Acquire)
    }

    /// Raw counter hooks. Only recyclers should call these; everything else
    /// goes through [`crate::EventRecycler`].
    pub fn counter(&self, input_side: bool) -> &AtomicU32 {
        if input_side { &self.input_refs } else { &self.ref_count }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event[{} -> {}, sent={}, recv={}{}]",
            self.sender,
            self.receiver,
            self.sent_time,
            self.receive_time,
            if self.anti_message { ", anti" } else { "" }
        )
    }
}

/// Canonical scheduling order: lexicographic on `(receive_time, receiver)`.
///
/// The receiver tie-break keeps all concurrent events for one agent adjacent
/// so a whole batch can be extracted in a single pass.
pub fn event_compare(lhs: &Event, rhs: &Event) -> Ordering {
    lhs.receive_time
        .total_cmp(&rhs.receive_time)
        .then_with(|| lhs.receiver.cmp(&rhs.receiver))
}

/// Cancellation predicate shared by every queue: does `event` belong to the
/// set scheduled for `dest` that `sender` rolled back from `sent_time` on?
pub fn is_cancelled_event(dest: AgentId, sender: AgentId, sent_time: Time, event: &Event) -> bool {
    event.receiver == dest && event.sender == sender && event.sent_time >= sent_time
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_time_then_receiver() {
        let a = Event::new(0, 1, 0.0, 1.0);
        let b = Event::new(0, 2, 0.0, 1.0);
        let c = Event::new(0, 1, 0.0, 2.0);
        assert_eq!(event_compare(&a, &b), Ordering::Less);
        assert_eq!(event_compare(&b, &c), Ordering::Less);
        assert_eq!(event_compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn cancellation_predicate_checks_all_three_fields() {
        let e = Event::new(5, 9, 4.0, 11.0);
        assert!(is_cancelled_event(9, 5, 4.0, &e));
        assert!(is_cancelled_event(9, 5, 3.0, &e));
        assert!(!is_cancelled_event(9, 5, 5.0, &e));
        assert!(!is_cancelled_event(9, 7, 4.0, &e));
        assert!(!is_cancelled_event(8, 5, 4.0, &e));
    }
}
