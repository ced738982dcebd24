//! Two-tier ladder queue: a calendar queue with an unsorted Top staging
//! area, up to `max_rungs` progressively finer rungs, and a sorted Bottom
//! that batches get dispatched from.
//!
//! After Tang, Goh & Thng, "Ladder queue: An O(1) priority queue structure
//! for large-scale discrete event simulation" (ACM TOMACS 2005), with every
//! bucket fanned into sender-hashed sub-buckets so rollback cancellation
//! scans stay short.

mod bottom;
mod bucket;
mod rung;

use std::io;
use std::sync::Arc;

use tracing::trace;
use warpq_abstract::{
    AgentId, EventRef, EventRecycler, QueueConfig, QueueError, TIME_INFINITY, Time,
};

use crate::queue::{AgentRegistry, EventQueue};
use crate::stats::Avg;

use bottom::{BottomList, make_bottom};
use bucket::TwoTierBucket;
use rung::Rung;

/// Unsorted staging area for events beyond the current epoch.
struct Top {
    bucket: TwoTierBucket,
    /// Events at or past this time belong in Top; reset to the previous
    /// epoch's max on promotion so late arrivals cannot underflow the
    /// current epoch.
    top_start: Time,
    min_ts: Time,
    max_ts: Time,
}

impl Top {
    fn new(t2k: usize) -> Self {
        Top {
            bucket: TwoTierBucket::new(t2k),
            top_start: 0.0,
            min_ts: TIME_INFINITY,
            max_ts: -TIME_INFINITY,
        }
    }

    fn add(&mut self, event: EventRef) {
        let time = event.receive_time();
        self.min_ts = self.min_ts.min(time);
        self.max_ts = self.max_ts.max(time);
        self.bucket.push(event);
    }

    fn is_empty(&self) -> bool {
        self.bucket.is_empty()
    }

    fn len(&self) -> usize {
        self.bucket.len()
    }

    /// Move the whole population out for promotion into rung 0 and start
    /// the next epoch at the old maximum.
    fn take(&mut self, t2k: usize) -> (TwoTierBucket, Time, Time, usize) {
        let count = self.bucket.len();
        let bucket = std::mem::replace(&mut self.bucket, TwoTierBucket::new(t2k));
        let (min_ts, max_ts) = (self.min_ts, self.max_ts);
        self.top_start = max_ts;
        self.min_ts = TIME_INFINITY;
        self.max_ts = -TIME_INFINITY;
        (bucket, min_ts, max_ts, count)
    }
}

/// Suggested bucket width for a population of `count` events spanning
/// `[min_ts, max_ts]`, clamped to the configured floor.
fn bucket_width_for(min_ts: Time, max_ts: Time, count: usize, floor: f64) -> f64 {
    let n = count as f64;
    ((max_ts - min_ts + n - 1.0) / n).max(floor)
}

pub struct LadderQueue {
    top: Top,
    rungs: Vec<Rung>,
    ladder_count: usize,
    bottom: Box<dyn BottomList>,
    registry: AgentRegistry,
    recycler: Arc<dyn EventRecycler>,
    config: QueueConfig,
    // Insert / cancel tallies per region, as the stats report breaks them out.
    ins_top: u64,
    ins_ladder: u64,
    ins_bottom: u64,
    ce_top: u64,
    ce_ladder: u64,
    ce_bottom: u64,
    ce_scan_ladder: Avg,
    max_rungs_used: usize,
    avg_bucket_width: Avg,
    bottom_len: Avg,
}

impl LadderQueue {
    pub fn new(config: QueueConfig, recycler: Arc<dyn EventRecycler>) -> Self {
        let bottom = make_bottom(config.bottom);
        LadderQueue {
            top: Top::new(config.t2k),
            rungs: Vec::with_capacity(config.max_rungs),
            ladder_count: 0,
            bottom,
            registry: AgentRegistry::default(),
            recycler,
            config,
            ins_top: 0,
            ins_ladder: 0,
            ins_bottom: 0,
            ce_top: 0,
            ce_ladder: 0,
            ce_bottom: 0,
            ce_scan_ladder: Avg::default(),
            max_rungs_used: 0,
            avg_bucket_width: Avg::default(),
            bottom_len: Avg::default(),
        }
    }

    fn route(&mut self, event: EventRef) {
        let time = event.receive_time();
        if !self.bottom.is_empty() && time <= self.bottom.max_time() {
            self.bottom.enqueue(event);
            self.ins_bottom += 1;
            return;
        }
        // Deepest rung first; at most one rung can span this time.
        if let Some(idx) = (0..self.rungs.len()).rev().find(|&i| self.rungs[i].can_contain(time)) {
            self.rungs[idx].enqueue(event);
            self.ladder_count += 1;
            self.ins_ladder += 1;
            return;
        }
        if time >= self.top.top_start {
            self.top.add(event);
            self.ins_top += 1;
        } else {
            // Below the ladder's reach: this is head-of-schedule work.
            self.bottom.enqueue(event);
            self.ins_bottom += 1;
        }
    }

    /// Refill Bottom from the ladder (and ultimately from Top), subdividing
    /// oversized buckets into new rungs along the way.
    fn populate_bottom(&mut self) {
        if !self.bottom.is_empty() {
            return;
        }
        loop {
            while matches!(self.rungs.last(), Some(rung) if rung.is_empty()) {
                self.rungs.pop();
            }
            if let Some(rung) = self.rungs.last_mut() {
                let (bucket, bucket_start) = rung.next_bucket().expect("non-empty rung");
                self.ladder_count -= bucket.len();
                let (lo, hi) = bucket.time_bounds().expect("non-empty bucket");
                let spread = hi > lo;
                if bucket.len() <= self.config.thresh || !spread || self.rungs.len() >= self.config.max_rungs
                {
                    trace!(start = bucket_start, size = bucket.len(), "flushing bucket to bottom");
                    self.bottom.enqueue_bucket(bucket);
                    self.bottom_len.add(self.bottom.len() as f64);
                    return;
                }
                // Recurse-rung step: subdivide the front bucket one level
                // deeper.
                let width = bucket_width_for(lo, hi, bucket.len(), self.config.min_bucket_width);
                let next = Rung::new(bucket, lo, hi, width, self.config.t2k);
                self.ladder_count += next.len();
                self.avg_bucket_width.add(width);
                self.rungs.push(next);
                self.max_rungs_used = self.max_rungs_used.max(self.rungs.len());
                continue;
            }
            if !self.top.is_empty() {
                let (bucket, min_ts, max_ts, count) = self.top.take(self.config.t2k);
                let width = bucket_width_for(min_ts, max_ts, count, self.config.min_bucket_width);
                trace!(min_ts, max_ts, count, width, "promoting top into rung 0");
                let rung = Rung::new(bucket, min_ts, max_ts, width, self.config.t2k);
                self.ladder_count += rung.len();
                self.avg_bucket_width.add(width);
                self.rungs.push(rung);
                self.max_rungs_used = self.max_rungs_used.max(self.rungs.len());
                continue;
            }
            return;
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        // No event in Bottom may sit past the earliest event of any rung.
        let bottom_max = if self.bottom.is_empty() {
            -TIME_INFINITY
        } else {
            self.bottom.max_time()
        };
        for rung in &self.rungs {
            rung.check_invariants();
            if let Some(rung_min) = rung.min_pending_time() {
                assert!(
                    bottom_max <= rung_min,
                    "bottom holds an event at {bottom_max}, past a rung event at {rung_min}"
                );
            }
        }
    }
}

impl EventQueue for LadderQueue {
    fn name(&self) -> &'static str {
        "ladder"
    }

    fn add_agent(&mut self, agent: AgentId) -> Result<(), QueueError> {
        // The ladder keeps no per-agent state; registration is bookkeeping.
        self.registry.add(agent)
    }

    fn remove_agent(&mut self, agent: AgentId) -> Result<(), QueueError> {
        self.registry.ensure(agent)?;
        let mut removed = self.top.bucket.remove_receiver(agent);
        for rung in &mut self.rungs {
            let mut hits = rung.remove_receiver(agent);
            self.ladder_count -= hits.len();
            removed.append(&mut hits);
        }
        removed.append(&mut self.bottom.remove_receiver(agent));
        for event in &removed {
            self.recycler.dec_ref(event);
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.top.is_empty() && self.ladder_count == 0 && self.bottom.is_empty()
    }

    fn front(&mut self) -> Option<EventRef> {
        self.populate_bottom();
        self.bottom.front().cloned()
    }

    fn dequeue_next_agent_events(&mut self, events: &mut Vec<EventRef>) {
        self.populate_bottom();
        self.bottom.dequeue_next_agent_events(events);
        if !events.is_empty() {
            self.registry.note_delivery(events);
        }
    }

    fn enqueue(&mut self, agent: AgentId, event: EventRef) {
        self.registry.assert_registered(agent);
        debug_assert_eq!(agent, event.receiver());
        self.recycler.inc_ref(&event);
        self.route(event);
    }

    fn enqueue_batch(&mut self, agent: AgentId, events: &mut Vec<EventRef>) {
        self.registry.assert_registered(agent);
        for event in events.drain(..) {
            self.route(event);
        }
    }

    fn erase_after(&mut self, dest: AgentId, sender: AgentId, sent_time: Time) -> usize {
        let (removed_top, _) = self.top.bucket.remove_matching(dest, sender, sent_time);
        self.ce_top += removed_top.len() as u64;

        let mut removed_ladder = Vec::new();
        for rung in &mut self.rungs {
            let (mut hits, scanned) = rung.remove_after(dest, sender, sent_time);
            self.ce_scan_ladder.add(scanned as f64);
            self.ladder_count -= hits.len();
            removed_ladder.append(&mut hits);
        }
        self.ce_ladder += removed_ladder.len() as u64;

        let removed_bottom = self.bottom.remove_after(dest, sender, sent_time);
        self.ce_bottom += removed_bottom.len() as u64;

        let total = removed_top.len() + removed_ladder.len() + removed_bottom.len();
        for event in removed_top
            .iter()
            .chain(removed_ladder.iter())
            .chain(removed_bottom.iter())
        {
            self.recycler.dec_ref(event);
        }
        total
    }

    fn pretty_print(&self, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(
            out,
            "LadderQueue [top={}, ladder={}, bottom={}]:",
            self.top.len(),
            self.ladder_count,
            self.bottom.len()
        )?;
        writeln!(
            out,
            "  top: start={}, min={}, max={}",
            self.top.top_start, self.top.min_ts, self.top.max_ts
        )?;
        for (idx, rung) in self.rungs.iter().enumerate() {
            writeln!(
                out,
                "  rung {idx}: width={}, events={}, buckets_used={}",
                rung.bucket_width(),
                rung.len(),
                rung.max_bucket_used() + 1
            )?;
        }
        Ok(())
    }

    fn report_stats(&self, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "LadderQueue:")?;
        writeln!(
            out,
            "\tInserts (top/ladder/bottom)  : {} / {} / {}",
            self.ins_top, self.ins_ladder, self.ins_bottom
        )?;
        writeln!(
            out,
            "\tCancels (top/ladder/bottom)  : {} / {} / {}",
            self.ce_top, self.ce_ladder, self.ce_bottom
        )?;
        writeln!(out, "\tCancel scan per rung         : {}", self.ce_scan_ladder)?;
        writeln!(out, "\tMax rungs in use             : {}", self.max_rungs_used)?;
        writeln!(out, "\tAverage bucket width         : {}", self.avg_bucket_width)?;
        writeln!(out, "\tAverage bottom length        : {}", self.bottom_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, harness};
    use warpq_abstract::{BottomKind, Event, EventPool};

    fn queue_with(kind: BottomKind) -> harness::QueueUnderTest {
        harness::single_threaded(move |recycler| {
            let config = QueueConfig {
                bottom: kind,
                ..QueueConfig::default()
            };
            Box::new(LadderQueue::new(config, recycler))
        })
    }

    fn all_bottoms() -> [BottomKind; 3] {
        [BottomKind::SortedVec, BottomKind::Heap, BottomKind::MultiSet]
    }

    #[test]
    fn basic_order() {
        for kind in all_bottoms() {
            test_support::scenario_basic_order(queue_with(kind));
        }
    }

    #[test]
    fn concurrent_batches() {
        for kind in all_bottoms() {
            test_support::scenario_concurrent_events(queue_with(kind));
        }
    }

    #[test]
    fn rollback_cancellation() {
        for kind in all_bottoms() {
            test_support::scenario_rollback(queue_with(kind));
        }
    }

    #[test]
    fn remove_agent_drops_all_events() {
        for kind in all_bottoms() {
            test_support::scenario_remove_agent(queue_with(kind));
        }
    }

    #[test]
    fn refcounts_round_trip() {
        test_support::scenario_refcount_round_trip(queue_with(BottomKind::SortedVec));
    }

    #[test]
    fn randomized_against_model() {
        for (seed, kind) in all_bottoms().into_iter().enumerate() {
            test_support::scenario_randomized(queue_with(kind), 0xC7 + seed as u64);
        }
    }

    /// S4: a spread-out population promotes Top into at least one rung and
    /// drains in strictly increasing receive-time order.
    #[test]
    fn ladder_promotion_and_ordered_drain() {
        let pool = std::sync::Arc::new(EventPool::new(false));
        let mut queue = LadderQueue::new(QueueConfig::default(), pool.clone());
        queue.add_agent(1).unwrap();
        for i in 0..200u64 {
            let time = 100.0 + i as Time * 0.5;
            queue.enqueue(1, Event::new(i, 1, 50.0, time));
        }
        assert_eq!(queue.top.len(), 200, "distant events stage in top");

        let mut last = -TIME_INFINITY;
        let mut batches = 0;
        let mut batch = Vec::new();
        while !queue.is_empty() {
            batch.clear();
            queue.dequeue_next_agent_events(&mut batch);
            assert_eq!(batch.len(), 1);
            assert!(batch[0].receive_time() > last);
            last = batch[0].receive_time();
            for event in &batch {
                pool.dec_ref(event);
            }
            batches += 1;
            queue.check_invariants();
        }
        assert_eq!(batches, 200);
        assert!(queue.max_rungs_used >= 1, "promotion must create a rung");

        let mut report = Vec::new();
        queue.report_stats(&mut report).unwrap();
        let report = String::from_utf8(report).unwrap();
        assert!(report.contains("Max rungs in use"));
        assert_eq!(pool.outstanding(), 0);
    }

    /// An event arriving below every rung must surface immediately, not get
    /// parked in Top.
    #[test]
    fn straggler_goes_to_bottom() {
        let pool = std::sync::Arc::new(EventPool::new(false));
        let mut queue = LadderQueue::new(QueueConfig::default(), pool.clone());
        queue.add_agent(1).unwrap();
        for i in 0..100u64 {
            queue.enqueue(1, Event::new(i, 1, 10.0, 100.0 + i as Time));
        }
        // Force promotion by peeking.
        let front = queue.front().unwrap();
        assert_eq!(front.receive_time(), 100.0);

        // Straggler behind the whole ladder.
        queue.enqueue(1, Event::new(200, 1, 10.0, 100.5));
        let mut batch = Vec::new();
        queue.dequeue_next_agent_events(&mut batch);
        assert_eq!(batch[0].receive_time(), 100.0);
        for event in batch.drain(..) {
            pool.dec_ref(&event);
        }
        queue.dequeue_next_agent_events(&mut batch);
        assert_eq!(batch[0].receive_time(), 100.5, "straggler must come out next");
        for event in batch.drain(..) {
            pool.dec_ref(&event);
        }
        queue.check_invariants();
    }
}
