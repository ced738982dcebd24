use std::io;
use std::sync::Arc;

use tracing::debug;
use warpq_abstract::{
    AgentId, Event, EventRef, EventRecycler, QueueError, Time, event_compare, is_cancelled_event,
    time_equals,
};

use crate::binary_heap::BinaryHeap;
use crate::queue::{AgentRegistry, EventQueue};

fn event_less(lhs: &EventRef, rhs: &EventRef) -> bool {
    event_compare(lhs, rhs).is_lt()
}

/// The simplest queue variant: one flat binary heap over every pending
/// event, ordered by `(receive_time, receiver)`. A good baseline for
/// comparing the tiered variants against.
pub struct HeapEventQueue {
    events: BinaryHeap<EventRef>,
    registry: AgentRegistry,
    recycler: Arc<dyn EventRecycler>,
    max_q_size: usize,
}

impl HeapEventQueue {
    pub fn new(recycler: Arc<dyn EventRecycler>) -> Self {
        HeapEventQueue {
            events: BinaryHeap::new(event_less),
            registry: AgentRegistry::default(),
            recycler,
            max_q_size: 0,
        }
    }

    fn note_size(&mut self) {
        self.max_q_size = self.max_q_size.max(self.events.len());
    }

    fn matches_front(front: &Event, receiver: AgentId, time: Time) -> bool {
        front.receiver() == receiver && time_equals(front.receive_time(), time)
    }
}

impl EventQueue for HeapEventQueue {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn add_agent(&mut self, agent: AgentId) -> Result<(), QueueError> {
        self.registry.add(agent)
    }

    fn remove_agent(&mut self, agent: AgentId) -> Result<(), QueueError> {
        self.registry.ensure(agent)?;
        for event in self.events.remove_if(|e| e.receiver() == agent) {
            self.recycler.dec_ref(&event);
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn front(&mut self) -> Option<EventRef> {
        self.events.peek().cloned()
    }

    fn dequeue_next_agent_events(&mut self, events: &mut Vec<EventRef>) {
        let Some(first) = self.events.pop() else {
            return;
        };
        let receiver = first.receiver();
        let time = first.receive_time();
        debug!(event = %first, "delivering");
        events.push(first);
        while let Some(next) = self.events.peek() {
            if !Self::matches_front(next, receiver, time) {
                break;
            }
            let event = self.events.pop().expect("peeked event");
            debug!(event = %event, "delivering");
            events.push(event);
        }
        self.registry.note_delivery(events);
    }

    fn enqueue(&mut self, agent: AgentId, event: EventRef) {
        self.registry.assert_registered(agent);
        debug_assert_eq!(agent, event.receiver());
        self.recycler.inc_ref(&event);
        self.events.push(event);
        self.note_size();
    }

    fn enqueue_batch(&mut self, agent: AgentId, events: &mut Vec<EventRef>) {
        self.registry.assert_registered(agent);
        self.events.push_bulk(events);
        self.note_size();
    }

    fn erase_after(&mut self, dest: AgentId, sender: AgentId, sent_time: Time) -> usize {
        let removed = self
            .events
            .remove_if(|e| is_cancelled_event(dest, sender, sent_time, e));
        for event in &removed {
            self.recycler.dec_ref(event);
        }
        removed.len()
    }

    fn pretty_print(&self, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "HeapEventQueue [size={}]:", self.events.len())?;
        for event in self.events.iter() {
            writeln!(out, "  {event}")?;
        }
        Ok(())
    }

    fn report_stats(&self, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "HeapEventQueue:")?;
        writeln!(out, "\tMax queue size: {}", self.max_q_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, harness};

    fn new_queue() -> harness::QueueUnderTest {
        harness::single_threaded(|recycler| Box::new(HeapEventQueue::new(recycler)))
    }

    #[test]
    fn basic_order() {
        test_support::scenario_basic_order(new_queue());
    }

    #[test]
    fn concurrent_batches() {
        test_support::scenario_concurrent_events(new_queue());
    }

    #[test]
    fn rollback_cancellation() {
        test_support::scenario_rollback(new_queue());
    }

    #[test]
    fn remove_agent_drops_all_events() {
        test_support::scenario_remove_agent(new_queue());
    }

    #[test]
    fn refcounts_round_trip() {
        test_support::scenario_refcount_round_trip(new_queue());
    }

    #[test]
    fn randomized_against_model() {
        test_support::scenario_randomized(new_queue(), 0xC3);
    }
}
