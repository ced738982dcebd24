//! Three-tier queue: top heap of agents, per-agent sorted deque of buckets,
//! each bucket holding one receive time's worth of concurrent events.
//!
//! Compared to the two-tier variant this makes the delivery batch a single
//! bucket move, and rollbacks truncate buckets instead of repairing a heap.
//! Emptied buckets go back to a per-queue free list instead of the
//! allocator.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use warpq_abstract::{
    AgentId, EventRef, EventRecycler, QueueError, TIME_INFINITY, Time, is_cancelled_event,
};

use crate::queue::{AgentRegistry, EventQueue};
use crate::stats::Avg;

/// One receive time's worth of concurrent events for one agent.
struct Tier2Bucket {
    recv_time: Time,
    events: Vec<EventRef>,
}

struct AgentSlot {
    id: AgentId,
    cross_ref: usize,
    old_top_time: Time,
    /// Buckets in ascending `recv_time`, no two sharing a time.
    buckets: VecDeque<Tier2Bucket>,
}

pub struct ThreeTierHeapQueue {
    slots: Vec<AgentSlot>,
    index: HashMap<AgentId, usize>,
    order: Vec<usize>,
    live_events: usize,
    registry: AgentRegistry,
    recycler: Arc<dyn EventRecycler>,
    tier2_recycler: Vec<Tier2Bucket>,
    agent_bkt_count: Avg,
    avg_sched_bkt_size: Avg,
    fix_heap_swaps: Avg,
}

impl ThreeTierHeapQueue {
    pub fn new(recycler: Arc<dyn EventRecycler>) -> Self {
        ThreeTierHeapQueue {
            slots: Vec::new(),
            index: HashMap::new(),
            order: Vec::new(),
            live_events: 0,
            registry: AgentRegistry::default(),
            recycler,
            tier2_recycler: Vec::new(),
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
            .buckets
            .front()
            .map(|b| b.recv_time)
            .unwrap_or(TIME_INFINITY)
    }

    fn take_bucket(&mut self, recv_time: Time) -> Tier2Bucket {
        match self.tier2_recycler.pop() {
            Some(mut bucket) => {
                bucket.recv_time = recv_time;
                debug_assert!(bucket.events.is_empty());
                bucket
            }
            None => Tier2Bucket {
                recv_time,
                events: Vec::new(),
            },
        }
    }

    fn recycle_bucket(&mut self, mut bucket: Tier2Bucket) {
        bucket.events.clear();
        self.tier2_recycler.push(bucket);
    }

    /// Insert one event into the agent's sorted bucket deque. Does not touch
    /// reference counts or the top heap.
    fn enqueue_event(&mut self, slot: usize, event: EventRef) {
        let time = event.receive_time();
        self.agent_bkt_count.add(self.slots[slot].buckets.len() as f64);
        let position = self.slots[slot]
            .buckets
            .binary_search_by(|b| b.recv_time.total_cmp(&time));
        match position {
            Ok(found) => self.slots[slot].buckets[found].events.push(event),
            Err(insert_at) => {
                let mut bucket = self.take_bucket(time);
                bucket.events.push(event);
                self.slots[slot].buckets.insert(insert_at, bucket);
            }
        }
        self.live_events += 1;
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
        for slot in &self.slots {
            for pair in 0..slot.buckets.len().saturating_sub(1) {
                assert!(
                    slot.buckets[pair].recv_time < slot.buckets[pair + 1].recv_time,
                    "tier2 buckets out of order for agent {}",
                    slot.id
                );
            }
            for bucket in &slot.buckets {
                assert!(!bucket.events.is_empty(), "empty bucket left in tier2");
                for event in &bucket.events {
                    assert_eq!(event.receive_time().to_bits(), bucket.recv_time.to_bits());
                }
            }
        }
    }
}

impl EventQueue for ThreeTierHeapQueue {
    fn name(&self) -> &'static str {
        "three-tier"
    }

    fn add_agent(&mut self, agent: AgentId) -> Result<(), QueueError> {
        self.registry.add(agent)?;
        let slot = self.slots.len();
        self.slots.push(AgentSlot {
            id: agent,
            cross_ref: self.order.len(),
            old_top_time: TIME_INFINITY,
            buckets: VecDeque::new(),
        });
        self.index.insert(agent, slot);
        self.order.push(slot);
        self.fix_top_heap(self.order.len() - 1);
        Ok(())
    }

    fn remove_agent(&mut self, agent: AgentId) -> Result<(), QueueError> {
        self.registry.ensure(agent)?;
        let slot = self.slot_of(agent);
        let buckets = std::mem::take(&mut self.slots[slot].buckets);
        for mut bucket in buckets {
            self.live_events -= bucket.events.len();
            for event in bucket.events.drain(..) {
                self.recycler.dec_ref(&event);
            }
            self.recycle_bucket(bucket);
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
        self.slots[top]
            .buckets
            .front()
            .and_then(|b| b.events.first())
            .cloned()
    }

    fn dequeue_next_agent_events(&mut self, events: &mut Vec<EventRef>) {
        debug_assert!(events.is_empty());
        if self.live_events == 0 {
            return;
        }
        let slot = self.order[0];
        debug_assert_eq!(self.slots[slot].cross_ref, 0);
        let mut bucket = self.slots[slot]
            .buckets
            .pop_front()
            .expect("front agent has a bucket");
        self.live_events -= bucket.events.len();
        self.avg_sched_bkt_size.add(bucket.events.len() as f64);
        events.append(&mut bucket.events);
        self.recycle_bucket(bucket);
        self.registry.note_delivery(events);
        self.update_heap(slot);
    }

    fn enqueue(&mut self, agent: AgentId, event: EventRef) {
        debug_assert_eq!(agent, event.receiver());
        let slot = self.slot_of(agent);
        self.recycler.inc_ref(&event);
        self.enqueue_event(slot, event);
        self.update_heap(slot);
    }

    fn enqueue_batch(&mut self, agent: AgentId, events: &mut Vec<EventRef>) {
        let slot = self.slot_of(agent);
        for event in events.drain(..) {
            self.enqueue_event(slot, event);
        }
        self.update_heap(slot);
    }

    fn erase_after(&mut self, dest: AgentId, sender: AgentId, sent_time: Time) -> usize {
        let slot = self.slot_of(dest);
        let mut removed = 0;
        // Newest buckets first: rollbacks cancel the speculative tail.
        for idx in (0..self.slots[slot].buckets.len()).rev() {
            if self.slots[slot].buckets[idx].recv_time < sent_time {
                // Receive times below the rollback point cannot hold events
                // sent at or after it (sent <= recv).
                break;
            }
            let bucket = &mut self.slots[slot].buckets[idx];
            let mut pos = 0;
            while pos < bucket.events.len() {
                if is_cancelled_event(dest, sender, sent_time, &bucket.events[pos]) {
                    let event = bucket.events.swap_remove(pos);
                    self.recycler.dec_ref(&event);
                    removed += 1;
                } else {
                    pos += 1;
                }
            }
            if bucket.events.is_empty() {
                let bucket = self.slots[slot]
                    .buckets
                    .remove(idx)
                    .expect("bucket index in range");
                self.recycle_bucket(bucket);
            }
        }
        self.live_events -= removed;
        self.update_heap(slot);
        removed
    }

    fn pretty_print(&self, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(
            out,
            "ThreeTierHeapQueue [agents={}, events={}]:",
            self.slots.len(),
            self.live_events
        )?;
        for &slot in &self.order {
            let agent = &self.slots[slot];
            writeln!(out, "  agent {} ({} buckets):", agent.id, agent.buckets.len())?;
            for bucket in &agent.buckets {
                writeln!(out, "    t={} x{}", bucket.recv_time, bucket.events.len())?;
            }
        }
        Ok(())
    }

    fn report_stats(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let compares = (self.slots.len().max(2) as f64).log2() * self.avg_sched_bkt_size.count() as f64
            + self.fix_heap_swaps.sum();
        writeln!(out, "ThreeTierHeapQueue:")?;
        writeln!(out, "\tAverage #buckets per agent   : {}", self.agent_bkt_count)?;
        writeln!(out, "\tAverage scheduled bucket size: {}", self.avg_sched_bkt_size)?;
        writeln!(out, "\tAverage fixHeap swaps        : {}", self.fix_heap_swaps)?;
        writeln!(out, "\tCompare estimate             : {compares}")?;
        writeln!(out, "\tRecycled buckets on hand     : {}", self.tier2_recycler.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, harness};
    use warpq_abstract::Event;

    fn new_queue() -> harness::QueueUnderTest {
        harness::single_threaded(|recycler| Box::new(ThreeTierHeapQueue::new(recycler)))
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
        test_support::scenario_randomized(new_queue(), 0xC6);
    }

    #[test]
    fn buckets_pool_and_sort_correctly() {
        let pool = std::sync::Arc::new(warpq_abstract::EventPool::new(false));
        let mut queue = ThreeTierHeapQueue::new(pool.clone());
        queue.add_agent(7).unwrap();
        // Two concurrent times, interleaved inserts.
        for (sent, recv) in [(0.0, 5.0), (1.0, 3.0), (1.5, 5.0), (2.0, 3.0)] {
            queue.enqueue(7, Event::new(1, 7, sent, recv));
            queue.check_invariants();
        }
        let mut batch = Vec::new();
        queue.dequeue_next_agent_events(&mut batch);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].receive_time(), 3.0);
        for event in batch.drain(..) {
            pool.dec_ref(&event);
        }
        queue.check_invariants();
        // The freed bucket is reused by the next new time.
        assert_eq!(queue.tier2_recycler.len(), 1);
        queue.enqueue(7, Event::new(1, 7, 3.0, 9.0));
        assert_eq!(queue.tier2_recycler.len(), 0);
        queue.check_invariants();

        queue.dequeue_next_agent_events(&mut batch);
        for event in batch.drain(..) {
            pool.dec_ref(&event);
        }
        queue.dequeue_next_agent_events(&mut batch);
        for event in batch.drain(..) {
            pool.dec_ref(&event);
        }
        assert!(queue.is_empty());
        assert_eq!(pool.outstanding(), 0);
    }
}
