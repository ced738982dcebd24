//! Binomial-heap backed event queue.
//!
//! Same contract as the flat heap, but cancellation goes through stable
//! handles: every stored event keeps a handle into the heap, so `erase_after`
//! and `remove_agent` delete each match in O(log n) instead of rebuilding.

use std::io;
use std::sync::Arc;

use warpq_abstract::{
    AgentId, EventRef, EventRecycler, QueueError, Time, event_compare, is_cancelled_event,
    time_equals,
};

use crate::queue::{AgentRegistry, EventQueue};

/// Stable reference to an entry in a [`BinomialHeap`]. Invalidated when that
/// entry is removed; repointed (via the relocation callback) when entries
/// swap slots during a bubble-to-root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(usize);

struct Node<T> {
    item: Option<T>,
    parent: Option<usize>,
    child: Option<usize>,
    sibling: Option<usize>,
    degree: u32,
    /// Caller-managed back-reference; travels with the item on swaps.
    token: usize,
}

/// Forest-of-binomial-trees min-heap over a slab of nodes.
///
/// Removal of an arbitrary handle bubbles the payload to its tree root by
/// swapping payloads up the parent chain, then deletes the root. Payload
/// swaps are reported through a relocation callback so external handle
/// tables stay accurate.
pub struct BinomialHeap<T> {
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    len: usize,
    less: fn(&T, &T) -> bool,
}

impl<T> BinomialHeap<T> {
    pub fn new(less: fn(&T, &T) -> bool) -> Self {
        BinomialHeap {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            len: 0,
            less,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn item(&self, handle: Handle) -> &T {
        self.nodes[handle.0].item.as_ref().expect("live handle")
    }

    pub fn token(&self, handle: Handle) -> usize {
        self.nodes[handle.0].token
    }

    pub fn set_token(&mut self, handle: Handle, token: usize) {
        self.nodes[handle.0].token = token;
    }

    pub fn push(&mut self, item: T) -> Handle {
        let idx = self.alloc(item);
        self.union(Some(idx));
        self.len += 1;
        Handle(idx)
    }

    pub fn peek_min(&self) -> Option<&T> {
        self.min_root().map(|(idx, _)| self.nodes[idx].item.as_ref().expect("root item"))
    }

    /// Remove the minimum. Returns the payload and its token so the caller
    /// can retire its handle-table entry.
    pub fn pop_min(&mut self) -> Option<(T, usize)> {
        let (idx, prev) = self.min_root()?;
        Some(self.remove_root(idx, prev))
    }

    /// Remove an arbitrary live entry in O(log n).
    pub fn erase<F>(&mut self, handle: Handle, mut relocated: F) -> (T, usize)
    where
        F: FnMut(usize, Handle),
    {
        let root = self.bubble_to_root(handle.0, &mut relocated);
        let prev = self.root_prev(root);
        self.remove_root(root, prev)
    }

    fn alloc(&mut self, item: T) -> usize {
        match self.free.pop() {
            Some(idx) => {
                let node = &mut self.nodes[idx];
                node.item = Some(item);
                node.parent = None;
                node.child = None;
                node.sibling = None;
                node.degree = 0;
                node.token = 0;
                idx
            }
            None => {
                self.nodes.push(Node {
                    item: Some(item),
                    parent: None,
                    child: None,
                    sibling: None,
                    degree: 0,
                    token: 0,
                });
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) {
        self.nodes[idx].item = None;
        self.free.push(idx);
    }

    fn node_less(&self, a: usize, b: usize) -> bool {
        (self.less)(
            self.nodes[a].item.as_ref().expect("live node"),
            self.nodes[b].item.as_ref().expect("live node"),
        )
    }

    fn min_root(&self) -> Option<(usize, Option<usize>)> {
        let mut cursor = self.head?;
        let mut best = cursor;
        let mut best_prev = None;
        let mut prev = Some(cursor);
        while let Some(next) = self.nodes[cursor].sibling {
            if self.node_less(next, best) {
                best = next;
                best_prev = prev;
            }
            prev = Some(next);
            cursor = next;
        }
        Some((best, best_prev))
    }

    fn root_prev(&self, root: usize) -> Option<usize> {
        let mut cursor = self.head.expect("non-empty root list");
        if cursor == root {
            return None;
        }
        while let Some(next) = self.nodes[cursor].sibling {
            if next == root {
                return Some(cursor);
            }
            cursor = next;
        }
        unreachable!("handle does not reach a root");
    }

    fn remove_root(&mut self, idx: usize, prev: Option<usize>) -> (T, usize) {
        match prev {
            None => self.head = self.nodes[idx].sibling,
            Some(p) => self.nodes[p].sibling = self.nodes[idx].sibling,
        }
        // Children become their own forest, youngest degree first.
        let mut child = self.nodes[idx].child;
        let mut reversed = None;
        while let Some(c) = child {
            let next = self.nodes[c].sibling;
            self.nodes[c].sibling = reversed;
            self.nodes[c].parent = None;
            reversed = Some(c);
            child = next;
        }
        self.union(reversed);
        let item = self.nodes[idx].item.take().expect("live root");
        let token = self.nodes[idx].token;
        self.release(idx);
        self.len -= 1;
        (item, token)
    }

    fn bubble_to_root<F>(&mut self, mut idx: usize, relocated: &mut F) -> usize
    where
        F: FnMut(usize, Handle),
    {
        while let Some(parent) = self.nodes[idx].parent {
            self.swap_payload(idx, parent);
            relocated(self.nodes[idx].token, Handle(idx));
            relocated(self.nodes[parent].token, Handle(parent));
            idx = parent;
        }
        idx
    }

    fn swap_payload(&mut self, i: usize, j: usize) {
        debug_assert_ne!(i, j);
        let (lo, hi) = (i.min(j), i.max(j));
        let (front, back) = self.nodes.split_at_mut(hi);
        let (a, b) = (&mut front[lo], &mut back[0]);
        std::mem::swap(&mut a.item, &mut b.item);
        std::mem::swap(&mut a.token, &mut b.token);
    }

    /// Splice another root list into this one and restore the one-tree-per-
    /// degree invariant.
    fn union(&mut self, other: Option<usize>) {
        self.head = self.merge(self.head, other);
        let Some(mut x) = self.head else {
            return;
        };
        let mut prev: Option<usize> = None;
        while let Some(next) = self.nodes[x].sibling {
            let after_next = self.nodes[next].sibling;
            let same_degree = self.nodes[x].degree == self.nodes[next].degree;
            let triple = after_next
                .map(|a| self.nodes[a].degree == self.nodes[x].degree)
                .unwrap_or(false);
            if !same_degree || triple {
                prev = Some(x);
                x = next;
            } else if !self.node_less(next, x) {
                self.nodes[x].sibling = after_next;
                self.link(x, next);
            } else {
                match prev {
                    None => self.head = Some(next),
                    Some(p) => self.nodes[p].sibling = Some(next),
                }
                self.link(next, x);
                x = next;
            }
        }
    }

    fn link(&mut self, parent: usize, child: usize) {
        self.nodes[child].parent = Some(parent);
        self.nodes[child].sibling = self.nodes[parent].child;
        self.nodes[parent].child = Some(child);
        self.nodes[parent].degree += 1;
    }

    fn merge(&mut self, a: Option<usize>, b: Option<usize>) -> Option<usize> {
        let mut head = None;
        let mut tail: Option<usize> = None;
        let (mut a, mut b) = (a, b);
        while let (Some(x), Some(y)) = (a, b) {
            let pick = if self.nodes[x].degree <= self.nodes[y].degree {
                a = self.nodes[x].sibling;
                x
            } else {
                b = self.nodes[y].sibling;
                y
            };
            match tail {
                None => head = Some(pick),
                Some(t) => self.nodes[t].sibling = Some(pick),
            }
            tail = Some(pick);
        }
        let rest = a.or(b);
        match tail {
            None => rest,
            Some(t) => {
                self.nodes[t].sibling = rest;
                head
            }
        }
    }

    /// Walk every live entry in storage order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.nodes.iter().filter_map(|n| n.item.as_ref())
    }

    #[cfg(test)]
    fn check_structure(&self) {
        let mut count = 0;
        for (idx, node) in self.nodes.iter().enumerate() {
            let Some(item) = node.item.as_ref() else {
                continue;
            };
            count += 1;
            if let Some(p) = node.parent {
                let parent_item = self.nodes[p].item.as_ref().expect("parent alive");
                assert!(
                    !(self.less)(item, parent_item),
                    "heap order violated at node {idx}"
                );
            }
        }
        assert_eq!(count, self.len, "len does not match live nodes");
    }
}

/// Event queue over [`BinomialHeap`] with the parallel handle vector used by
/// the cancellation paths. Handles invalidated by deletion are compacted out
/// of the vector by swap-pop.
pub struct BinomialEventQueue {
    heap: BinomialHeap<EventRef>,
    handles: Vec<Handle>,
    registry: AgentRegistry,
    recycler: Arc<dyn EventRecycler>,
    max_q_size: usize,
}

fn event_less(lhs: &EventRef, rhs: &EventRef) -> bool {
    event_compare(lhs, rhs).is_lt()
}

impl BinomialEventQueue {
    pub fn new(recycler: Arc<dyn EventRecycler>) -> Self {
        BinomialEventQueue {
            heap: BinomialHeap::new(event_less),
            handles: Vec::new(),
            registry: AgentRegistry::default(),
            recycler,
            max_q_size: 0,
        }
    }

    fn push_event(&mut self, event: EventRef) {
        let handle = self.heap.push(event);
        self.heap.set_token(handle, self.handles.len());
        self.handles.push(handle);
        self.max_q_size = self.max_q_size.max(self.heap.len());
    }

    fn pop_front(&mut self) -> Option<EventRef> {
        let (event, token) = self.heap.pop_min()?;
        self.drop_handle(token);
        Some(event)
    }

    fn drop_handle(&mut self, token: usize) {
        self.handles.swap_remove(token);
        if token < self.handles.len() {
            let moved = self.handles[token];
            self.heap.set_token(moved, token);
        }
    }

    /// Tail-to-head sweep over the handle vector, erasing every event that
    /// matches the predicate. The entry swapped into a vacated slot always
    /// comes from the already-visited tail.
    fn erase_matching<P>(&mut self, pred: P) -> usize
    where
        P: Fn(&EventRef) -> bool,
    {
        let mut removed = 0;
        let mut idx = self.handles.len();
        while idx > 0 {
            idx -= 1;
            let handle = self.handles[idx];
            if pred(self.heap.item(handle)) {
                let (event, token) = self.heap.erase(handle, |t, h| self.handles[t] = h);
                debug_assert_eq!(token, idx);
                self.recycler.dec_ref(&event);
                self.drop_handle(token);
                removed += 1;
            }
        }
        removed
    }
}

impl EventQueue for BinomialEventQueue {
    fn name(&self) -> &'static str {
        "binomial"
    }

    fn add_agent(&mut self, agent: AgentId) -> Result<(), QueueError> {
        self.registry.add(agent)
    }

    fn remove_agent(&mut self, agent: AgentId) -> Result<(), QueueError> {
        self.registry.ensure(agent)?;
        self.erase_matching(|e| e.receiver() == agent);
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn front(&mut self) -> Option<EventRef> {
        self.heap.peek_min().cloned()
    }

    fn dequeue_next_agent_events(&mut self, events: &mut Vec<EventRef>) {
        let Some(first) = self.pop_front() else {
            return;
        };
        let receiver = first.receiver();
        let time = first.receive_time();
        events.push(first);
        while let Some(next) = self.heap.peek_min() {
            if next.receiver() != receiver || !time_equals(next.receive_time(), time) {
                break;
            }
            let event = self.pop_front().expect("peeked event");
            events.push(event);
        }
        self.registry.note_delivery(events);
    }

    fn enqueue(&mut self, agent: AgentId, event: EventRef) {
        self.registry.assert_registered(agent);
        debug_assert_eq!(agent, event.receiver());
        self.recycler.inc_ref(&event);
        self.push_event(event);
    }

    fn enqueue_batch(&mut self, agent: AgentId, events: &mut Vec<EventRef>) {
        self.registry.assert_registered(agent);
        for event in events.drain(..) {
            self.push_event(event);
        }
    }

    fn erase_after(&mut self, dest: AgentId, sender: AgentId, sent_time: Time) -> usize {
        self.erase_matching(|e| is_cancelled_event(dest, sender, sent_time, e))
    }

    fn pretty_print(&self, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "BinomialEventQueue [size={}]:", self.heap.len())?;
        for event in self.heap.iter() {
            writeln!(out, "  {event}")?;
        }
        Ok(())
    }

    fn report_stats(&self, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "BinomialEventQueue:")?;
        writeln!(out, "\tMax queue size: {}", self.max_q_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, harness};

    fn new_queue() -> harness::QueueUnderTest {
        harness::single_threaded(|recycler| Box::new(BinomialEventQueue::new(recycler)))
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
        test_support::scenario_randomized(new_queue(), 0xC4);
    }

    #[test]
    fn heap_structure_survives_interior_erase() {
        fn less(a: &i64, b: &i64) -> bool {
            a < b
        }
        let mut heap = BinomialHeap::new(less);
        let mut table: Vec<Handle> = Vec::new();
        for v in 0..32i64 {
            let handle = heap.push((v * 7) % 32);
            heap.set_token(handle, table.len());
            table.push(handle);
        }
        heap.check_structure();

        // Erase all even payloads through the handle table, keeping it
        // consistent across bubble relocations exactly as the queue does.
        let mut idx = table.len();
        while idx > 0 {
            idx -= 1;
            let handle = table[idx];
            if heap.item(handle) % 2 == 0 {
                let (value, token) = heap.erase(handle, |t, h| table[t] = h);
                assert_eq!(value % 2, 0);
                assert_eq!(token, idx);
                table.swap_remove(idx);
                if idx < table.len() {
                    let moved = table[idx];
                    heap.set_token(moved, idx);
                }
                heap.check_structure();
            }
        }
        assert_eq!(heap.len(), 16);

        let mut drained = Vec::new();
        while let Some((v, _)) = heap.pop_min() {
            assert_eq!(v % 2, 1);
            drained.push(v);
            heap.check_structure();
        }
        let mut sorted = drained.clone();
        sorted.sort_unstable();
        assert_eq!(drained, sorted);
    }
}
