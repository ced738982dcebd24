use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

use warpq_abstract::{
    AgentId, BottomKind, EventRef, TIME_INFINITY, Time, event_compare, is_cancelled_event,
    time_equals,
};

use crate::binary_heap::BinaryHeap;

use super::bucket::TwoTierBucket;

/// Storage contract for the Bottom tier: the sorted head of the schedule
/// from which batches are dispatched.
///
/// Bottom is allowed to grow past the rung-subdivision threshold; capping it
/// would split a set of concurrent events across dequeue calls, which the
/// scheduler contract forbids.
pub(super) trait BottomList {
    fn enqueue_bucket(&mut self, bucket: TwoTierBucket);
    fn enqueue(&mut self, event: EventRef);
    fn front(&self) -> Option<&EventRef>;
    fn pop_front(&mut self) -> Option<EventRef>;
    /// All concurrent events of the front agent, appended to `out`.
    fn dequeue_next_agent_events(&mut self, out: &mut Vec<EventRef>);
    /// Cancel matching events; returns them for the caller to release.
    fn remove_after(&mut self, dest: AgentId, sender: AgentId, sent_time: Time) -> Vec<EventRef>;
    fn remove_receiver(&mut self, receiver: AgentId) -> Vec<EventRef>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Highest receive time currently (or recently) held; `TIME_INFINITY`
    /// when empty. May over-estimate after removals; used only to route
    /// incoming events.
    fn max_time(&self) -> Time;
    fn min_time(&self) -> Time;
}

pub(super) fn make_bottom(kind: BottomKind) -> Box<dyn BottomList> {
    match kind {
        BottomKind::SortedVec => Box::new(SortedVecBottom::default()),
        BottomKind::Heap => Box::new(HeapBottom::new()),
        BottomKind::MultiSet => Box::new(MultiSetBottom::default()),
    }
}

fn event_less(lhs: &EventRef, rhs: &EventRef) -> bool {
    event_compare(lhs, rhs).is_lt()
}

/// Default backend: a deque kept sorted in the canonical order.
#[derive(Default)]
pub(super) struct SortedVecBottom {
    events: VecDeque<EventRef>,
}

impl BottomList for SortedVecBottom {
    fn enqueue_bucket(&mut self, mut bucket: TwoTierBucket) {
        let mut incoming = Vec::with_capacity(bucket.len());
        bucket.drain_into(&mut incoming);
        if self.events.is_empty() {
            incoming.sort_by(|a, b| event_compare(a, b));
            self.events = incoming.into();
        } else {
            // Rare path: bottom already populated, merge the long way.
            let mut all: Vec<EventRef> = self.events.drain(..).collect();
            all.append(&mut incoming);
            all.sort_by(|a, b| event_compare(a, b));
            self.events = all.into();
        }
    }

    fn enqueue(&mut self, event: EventRef) {
        let at = self
            .events
            .partition_point(|e| event_compare(e, &event) != Ordering::Greater);
        self.events.insert(at, event);
    }

    fn front(&self) -> Option<&EventRef> {
        self.events.front()
    }

    fn pop_front(&mut self) -> Option<EventRef> {
        self.events.pop_front()
    }

    fn dequeue_next_agent_events(&mut self, out: &mut Vec<EventRef>) {
        let Some(first) = self.events.pop_front() else {
            return;
        };
        let receiver = first.receiver();
        let time = first.receive_time();
        out.push(first);
        while let Some(next) = self.events.front() {
            if next.receiver() != receiver || !time_equals(next.receive_time(), time) {
                break;
            }
            out.push(self.events.pop_front().expect("peeked event"));
        }
    }

    fn remove_after(&mut self, dest: AgentId, sender: AgentId, sent_time: Time) -> Vec<EventRef> {
        // Sorted by receive time, and sent <= recv, so nothing before the
        // first event at `sent_time` can match; linear-scan from there.
        let start = self
            .events
            .partition_point(|e| e.receive_time() < sent_time);
        let tail = self.events.split_off(start);
        let mut removed = Vec::new();
        for event in tail {
            if is_cancelled_event(dest, sender, sent_time, &event) {
                removed.push(event);
            } else {
                self.events.push_back(event);
            }
        }
        removed
    }

    fn remove_receiver(&mut self, receiver: AgentId) -> Vec<EventRef> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.events.len());
        for event in self.events.drain(..) {
            if event.receiver() == receiver {
                removed.push(event);
            } else {
                kept.push_back(event);
            }
        }
        self.events = kept;
        removed
    }

    fn len(&self) -> usize {
        self.events.len()
    }

    fn max_time(&self) -> Time {
        self.events
            .back()
            .map(|e| e.receive_time())
            .unwrap_or(TIME_INFINITY)
    }

    fn min_time(&self) -> Time {
        self.events
            .front()
            .map(|e| e.receive_time())
            .unwrap_or(TIME_INFINITY)
    }
}

/// Heap-backed Bottom. The maximum event time is tracked separately so the
/// routing check stays O(1); it is a monotone upper bound that resets when
/// the heap drains.
pub(super) struct HeapBottom {
    events: BinaryHeap<EventRef>,
    max_seen: Option<Time>,
}

impl HeapBottom {
    fn new() -> Self {
        HeapBottom {
            events: BinaryHeap::new(event_less),
            max_seen: None,
        }
    }

    fn note(&mut self, time: Time) {
        self.max_seen = Some(match self.max_seen {
            None => time,
            Some(seen) => seen.max(time),
        });
    }

    fn reset_if_empty(&mut self) {
        if self.events.is_empty() {
            self.max_seen = None;
        }
    }
}

impl BottomList for HeapBottom {
    fn enqueue_bucket(&mut self, mut bucket: TwoTierBucket) {
        let mut incoming = Vec::with_capacity(bucket.len());
        bucket.drain_into(&mut incoming);
        for event in &incoming {
            self.note(event.receive_time());
        }
        self.events.push_bulk(&mut incoming);
    }

    fn enqueue(&mut self, event: EventRef) {
        self.note(event.receive_time());
        self.events.push(event);
    }

    fn front(&self) -> Option<&EventRef> {
        self.events.peek()
    }

    fn pop_front(&mut self) -> Option<EventRef> {
        let event = self.events.pop();
        self.reset_if_empty();
        event
    }

    fn dequeue_next_agent_events(&mut self, out: &mut Vec<EventRef>) {
        let Some(first) = self.events.pop() else {
            return;
        };
        let receiver = first.receiver();
        let time = first.receive_time();
        out.push(first);
        while let Some(next) = self.events.peek() {
            if next.receiver() != receiver || !time_equals(next.receive_time(), time) {
                break;
            }
            out.push(self.events.pop().expect("peeked event"));
        }
        self.reset_if_empty();
    }

    fn remove_after(&mut self, dest: AgentId, sender: AgentId, sent_time: Time) -> Vec<EventRef> {
        let removed = self
            .events
            .remove_if(|e| is_cancelled_event(dest, sender, sent_time, e));
        self.reset_if_empty();
        removed
    }

    fn remove_receiver(&mut self, receiver: AgentId) -> Vec<EventRef> {
        let removed = self.events.remove_if(|e| e.receiver() == receiver);
        self.reset_if_empty();
        removed
    }

    fn len(&self) -> usize {
        self.events.len()
    }

    fn max_time(&self) -> Time {
        self.max_seen.unwrap_or(TIME_INFINITY)
    }

    fn min_time(&self) -> Time {
        self.events
            .peek()
            .map(|e| e.receive_time())
            .unwrap_or(TIME_INFINITY)
    }
}

/// Key for the ordered-multiset backend: canonical event order made total
/// with an insertion sequence number.
#[derive(Debug, Clone, Copy)]
struct SetKey {
    time: Time,
    receiver: AgentId,
    seq: u64,
}

impl PartialEq for SetKey {
    fn eq(&self, other: &Self) -> bool {
        self.time.to_bits() == other.time.to_bits()
            && self.receiver == other.receiver
            && self.seq == other.seq
    }
}

impl Eq for SetKey {}

impl PartialOrd for SetKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SetKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then_with(|| self.receiver.cmp(&other.receiver))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Ordered-multiset Bottom over a B-tree.
#[derive(Default)]
pub(super) struct MultiSetBottom {
    events: BTreeMap<SetKey, EventRef>,
    next_seq: u64,
}

impl MultiSetBottom {
    fn key_for(&mut self, event: &EventRef) -> SetKey {
        let seq = self.next_seq;
        self.next_seq += 1;
        SetKey {
            time: event.receive_time(),
            receiver: event.receiver(),
            seq,
        }
    }
}

impl BottomList for MultiSetBottom {
    fn enqueue_bucket(&mut self, mut bucket: TwoTierBucket) {
        let mut incoming = Vec::with_capacity(bucket.len());
        bucket.drain_into(&mut incoming);
        for event in incoming {
            self.enqueue(event);
        }
    }

    fn enqueue(&mut self, event: EventRef) {
        let key = self.key_for(&event);
        self.events.insert(key, event);
    }

    fn front(&self) -> Option<&EventRef> {
        self.events.first_key_value().map(|(_, e)| e)
    }

    fn pop_front(&mut self) -> Option<EventRef> {
        self.events.pop_first().map(|(_, e)| e)
    }

    fn dequeue_next_agent_events(&mut self, out: &mut Vec<EventRef>) {
        let Some((_, first)) = self.events.pop_first() else {
            return;
        };
        let receiver = first.receiver();
        let time = first.receive_time();
        out.push(first);
        while let Some((key, _)) = self.events.first_key_value() {
            if key.receiver != receiver || !time_equals(key.time, time) {
                break;
            }
            out.push(self.events.pop_first().expect("peeked entry").1);
        }
    }

    fn remove_after(&mut self, dest: AgentId, sender: AgentId, sent_time: Time) -> Vec<EventRef> {
        let keys: Vec<SetKey> = self
            .events
            .range(
                SetKey {
                    time: sent_time,
                    receiver: 0,
                    seq: 0,
                }..,
            )
            .filter(|(_, e)| is_cancelled_event(dest, sender, sent_time, e))
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .map(|k| self.events.remove(&k).expect("collected key"))
            .collect()
    }

    fn remove_receiver(&mut self, receiver: AgentId) -> Vec<EventRef> {
        let keys: Vec<SetKey> = self
            .events
            .iter()
            .filter(|(_, e)| e.receiver() == receiver)
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .map(|k| self.events.remove(&k).expect("collected key"))
            .collect()
    }

    fn len(&self) -> usize {
        self.events.len()
    }

    fn max_time(&self) -> Time {
        self.events
            .last_key_value()
            .map(|(k, _)| k.time)
            .unwrap_or(TIME_INFINITY)
    }

    fn min_time(&self) -> Time {
        self.events
            .first_key_value()
            .map(|(k, _)| k.time)
            .unwrap_or(TIME_INFINITY)
    }
}
