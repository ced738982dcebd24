//! Two-tier queue: a top-level heap of agents ordered by each agent's next
//! event time, over per-agent binary heaps of events.
//!
//! The payoff over a flat heap is rollback locality: cancelling events for
//! one agent touches only that agent's sub-heap plus one repair of the
//! agent's position in the (much smaller) top heap.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use warpq_abstract::{
    AgentId, EventRef, EventRecycler, QueueError, TIME_INFINITY, Time, event_compare,
    is_cancelled_event, time_equals,
};

use crate::binary_heap::BinaryHeap;
use crate::queue::{AgentRegistry, EventQueue};
use crate::stats::Avg;

fn event_less(lhs: &EventRef, rhs: &EventRef) -> bool {
    event_compare(lhs, rhs).is_lt()
}

struct AgentSlot {
    id: AgentId,
    /// Current position of this agent in the top-heap order vector; kept in
    /// sync on every swap.
    cross_ref: usize,
    /// Top event time observed when the agent was last positioned; a repair
    /// is needed only when the current top time differs.
    old_top_time: Time,
    events: BinaryHeap<EventRef>,
}

pub struct TwoTierHeapQueue {
    slots: Vec<AgentSlot>,
    index: HashMap<AgentId, usize>,
    /// Heap of slot indices ordered by `(top event time, agent id)`.
    order: Vec<usize>,
    live_events: usize,
    registry: AgentRegistry,
    recycler: Arc<dyn EventRecycler>,
    agent_bkt_count: Avg,
    avg_sched_bkt_size: Avg,
    fix_heap_swaps: Avg,
}

impl TwoTierHeapQueue {
    pub fn new(recycler: Arc<dyn EventRecycler>) -> Self {
        TwoTierHeapQueue {
            slots: Vec::new(),
            index: HashMap::new(),
            order: Vec::new(),
            live_events: 0,
            registry: AgentRegistry::default(),
            recycler,
            agent_bkt_count: Avg::default(),
            avg_sched_bkt_size: Avg::default(),
            fix_heap_swaps: Avg::default(),
        }
    }

    fn slot_of(&self, agent: AgentId) -> usize {
        match self.index.get(&agent) {
            Some(&slot) => slot,
            None => panic!("{}", QueueError::UnknownAgent(agent)),
        }
    }

    fn top_time(&self, slot: usize) -> Time {
        self.slots[slot]
            .events
            .peek()
            .map(|e| e.receive_time())
            .unwrap_or(TIME_INFINITY)
    }

    fn order_less(&self, i: usize, j: usize) -> bool {
        let (a, b) = (self.order[i], self.order[j]);
        let key_a = (self.top_time(a), self.slots[a].id);
        let key_b = (self.top_time(b), self.slots[b].id);
        key_a.0.total_cmp(&key_b.0).then_with(|| key_a.1.cmp(&key_b.1)).is_lt()
    }

    fn swap_order(&mut self, i: usize, j: usize) {
        self.order.swap(i, j);
        self.slots[self.order[i]].cross_ref = i;
        self.slots[self.order[j]].cross_ref = j;
    }

    /// Sift the agent at top-heap position `pos` up, then down if it did not
    /// move, updating every touched cross-reference.
    fn fix_top_heap(&mut self, mut pos: usize) -> usize {
        let len = self.order.len();
        let start = pos;
        let mut swaps = 0u32;
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.order_less(pos, parent) {
                self.swap_order(pos, parent);
                swaps += 1;
                pos = parent;
            } else {
                break;
            }
        }
        if pos == start {
            loop {
                let child = 2 * pos + 1;
                if child >= len {
                    break;
                }
                let mut best = child;
                if child + 1 < len && self.order_less(child + 1, child) {
                    best = child + 1;
                }
                if self.order_less(best, pos) {
                    self.swap_order(pos, best);
                    swaps += 1;
                    pos = best;
                } else {
                    break;
                }
            }
        }
        self.fix_heap_swaps.add(swaps as f64);
        pos
    }

    /// Reposition the agent in the top heap, but only when its top event
    /// time actually changed since the last repair.
    fn update_heap(&mut self, slot: usize) {
        let current = self.top_time(slot);
        if self.slots[slot].old_top_time != current {
            let pos = self.slots[slot].cross_ref;
            debug_assert_eq!(self.order[pos], slot);
            self.fix_top_heap(pos);
            self.slots[slot].old_top_time = current;
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for pos in 1..self.order.len() {
            assert!(
                !self.order_less(pos, (pos - 1) / 2),
                "top heap order violated at {pos}"
            );
        }
        for (pos, &slot) in self.order.iter().enumerate() {
            assert_eq!(self.slots[slot].cross_ref, pos, "stale cross_ref");
        }
    }
}

impl EventQueue for TwoTierHeapQueue {
    fn name(&self) -> &'static str {
        "two-tier"
    }

    fn add_agent(&mut self, agent: AgentId) -> Result<(), QueueError> {
        self.registry.add(agent)?;
        let slot = self.slots.len();
        self.slots.push(AgentSlot {
            id: agent,
            cross_ref: self.order.len(),
            old_top_time: TIME_INFINITY,
            events: BinaryHeap::new(event_less),
        });
        self.index.insert(agent, slot);
        self.order.push(slot);
        self.fix_top_heap(self.order.len() - 1);
        Ok(())
    }

    fn remove_agent(&mut self, agent: AgentId) -> Result<(), QueueError> {
        self.registry.ensure(agent)?;
        let slot = self.slot_of(agent);
        let pending = self.slots[slot].events.clear();
        self.live_events -= pending.len();
        for event in &pending {
            self.recycler.dec_ref(event);
        }
        self.update_heap(slot);
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.live_events == 0
    }

    fn front(&mut self) -> Option<EventRef> {
        if self.live_events == 0 {
            return None;
        }
        let top = self.order[0];
        self.slots[top].events.peek().cloned()
    }

    fn dequeue_next_agent_events(&mut self, events: &mut Vec<EventRef>) {
        debug_assert!(events.is_empty());
        if self.live_events == 0 {
            return;
        }
        let slot = self.order[0];
        debug_assert_eq!(self.slots[slot].cross_ref, 0);
        let agent = &mut self.slots[slot];
        let first = agent.events.pop().expect("front agent has events");
        let time = first.receive_time();
        events.push(first);
        while let Some(next) = agent.events.peek() {
            if !time_equals(next.receive_time(), time) {
                break;
            }
            events.push(agent.events.pop().expect("peeked event"));
        }
        self.live_events -= events.len();
        self.avg_sched_bkt_size.add(events.len() as f64);
        self.registry.note_delivery(events);
        self.update_heap(slot);
    }

    fn enqueue(&mut self, agent: AgentId, event: EventRef) {
        debug_assert_eq!(agent, event.receiver());
        let slot = self.slot_of(agent);
        self.recycler.inc_ref(&event);
        self.agent_bkt_count.add(self.slots[slot].events.len() as f64);
        self.slots[slot].events.push(event);
        self.live_events += 1;
        self.update_heap(slot);
    }

    fn enqueue_batch(&mut self, agent: AgentId, events: &mut Vec<EventRef>) {
        let slot = self.slot_of(agent);
        self.live_events += events.len();
        self.slots[slot].events.push_bulk(events);
        self.update_heap(slot);
    }

    fn erase_after(&mut self, dest: AgentId, sender: AgentId, sent_time: Time) -> usize {
        let slot = self.slot_of(dest);
        let removed = self.slots[slot]
            .events
            .remove_if(|e| is_cancelled_event(dest, sender, sent_time, e));
        self.live_events -= removed.len();
        for event in &removed {
            self.recycler.dec_ref(event);
        }
        self.update_heap(slot);
        removed.len()
    }

    fn pretty_print(&self, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "TwoTierHeapQueue [agents={}, events={}]:", self.slots.len(), self.live_events)?;
        for &slot in &self.order {
            let agent = &self.slots[slot];
            writeln!(out, "  agent {} (top={}):", agent.id, self.top_time(slot))?;
            for event in agent.events.iter() {
                writeln!(out, "    {event}")?;
            }
        }
        Ok(())
    }

    fn report_stats(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let compares = (self.slots.len().max(2) as f64).log2() * self.avg_sched_bkt_size.count() as f64
            + self.fix_heap_swaps.sum();
        writeln!(out, "TwoTierHeapQueue:")?;
        writeln!(out, "\tAverage events per agent heap: {}", self.agent_bkt_count)?;
        writeln!(out, "\tAverage scheduled batch size : {}", self.avg_sched_bkt_size)?;
        writeln!(out, "\tAverage fixHeap swaps        : {}", self.fix_heap_swaps)?;
        writeln!(out, "\tCompare estimate             : {compares}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, harness};
    use warpq_abstract::Event;

    fn new_queue() -> harness::QueueUnderTest {
        harness::single_threaded(|recycler| Box::new(TwoTierHeapQueue::new(recycler)))
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
        test_support::scenario_randomized(new_queue(), 0xC5);
    }

    #[test]
    fn cross_refs_stay_consistent() {
        let pool = std::sync::Arc::new(warpq_abstract::EventPool::new(false));
        let mut queue = TwoTierHeapQueue::new(pool.clone());
        for agent in 0..16u64 {
            queue.add_agent(agent).unwrap();
        }
        queue.check_invariants();
        for i in 0..64u64 {
            let receiver = i % 16;
            let time = ((i * 37) % 100) as Time + 1.0;
            queue.enqueue(receiver, Event::new(99, receiver, 0.5, time));
            queue.check_invariants();
        }
        let mut batch = Vec::new();
        while !queue.is_empty() {
            batch.clear();
            queue.dequeue_next_agent_events(&mut batch);
            for event in &batch {
                pool.dec_ref(event);
            }
            queue.check_invariants();
        }
        assert_eq!(pool.outstanding(), 0);
    }
}
