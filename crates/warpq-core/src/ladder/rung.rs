use warpq_abstract::{AgentId, EventRef, Time};

use super::bucket::TwoTierBucket;

/// One level of the ladder: a fixed span of simulation time chopped into
/// equal-width buckets of [`TwoTierBucket`]s.
pub(super) struct Rung {
    /// Lowest receive time this rung was created for; never changes.
    r_start: Time,
    /// Lowest receive time still enqueueable; advances as buckets are
    /// consumed from the front.
    r_curr: Time,
    bucket_width: f64,
    curr_bucket: usize,
    buckets: Vec<TwoTierBucket>,
    count: usize,
    /// Highest bucket index ever populated, for the stats report.
    max_bucket_used: usize,
}

impl Rung {
    /// Build a rung spanning `[r_start, max_time]` and redistribute the
    /// source bucket's events into it.
    pub fn new(
        mut source: TwoTierBucket,
        r_start: Time,
        max_time: Time,
        bucket_width: f64,
        t2k: usize,
    ) -> Self {
        debug_assert!(bucket_width > 0.0);
        debug_assert!(max_time >= r_start);
        let bucket_count = ((max_time - r_start) / bucket_width) as usize + 1;
        let mut rung = Rung {
            r_start,
            r_curr: r_start,
            bucket_width,
            curr_bucket: 0,
            buckets: (0..bucket_count).map(|_| TwoTierBucket::new(t2k)).collect(),
            count: 0,
            max_bucket_used: 0,
        };
        let mut events = Vec::with_capacity(source.len());
        source.drain_into(&mut events);
        for event in events {
            rung.enqueue(event);
        }
        rung
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn bucket_width(&self) -> f64 {
        self.bucket_width
    }

    /// Highest receive time (exclusive) an event may have to land in this
    /// rung.
    pub fn max_rung_time(&self) -> Time {
        self.r_start + self.bucket_width * self.buckets.len() as f64
    }

    /// Events below `r_curr` belong to buckets already consumed; events at
    /// or past `max_rung_time` overflow the span.
    pub fn can_contain(&self, time: Time) -> bool {
        time >= self.r_curr && time < self.max_rung_time()
    }

    pub fn enqueue(&mut self, event: EventRef) {
        let time = event.receive_time();
        debug_assert!(time >= self.r_start);
        let raw = ((time - self.r_start) / self.bucket_width) as usize;
        // Clamp both ends: float rounding can land one bucket low, and the
        // top of the span maps onto the last bucket.
        let idx = raw.clamp(self.curr_bucket, self.buckets.len() - 1);
        self.buckets[idx].push(event);
        self.count += 1;
        self.max_bucket_used = self.max_bucket_used.max(idx);
    }

    /// Pull the next non-empty bucket off the front of the rung, advancing
    /// `r_curr` past it. Returns the bucket and its start time.
    pub fn next_bucket(&mut self) -> Option<(TwoTierBucket, Time)> {
        while self.curr_bucket < self.buckets.len() && self.buckets[self.curr_bucket].is_empty() {
            self.curr_bucket += 1;
        }
        if self.curr_bucket >= self.buckets.len() {
            debug_assert_eq!(self.count, 0);
            return None;
        }
        // Consumed slots are never written again (enqueue clamps to
        // `curr_bucket`), so a minimal placeholder is fine.
        let bucket = std::mem::replace(&mut self.buckets[self.curr_bucket], TwoTierBucket::new(1));
        let bucket_start = self.r_start + self.bucket_width * self.curr_bucket as f64;
        self.curr_bucket += 1;
        self.r_curr = self.r_start + self.bucket_width * self.curr_bucket as f64;
        self.count -= bucket.len();
        Some((bucket, bucket_start))
    }

    /// Cancel matching events in the current and later buckets. Returns the
    /// removed events and the number of sub-bucket entries scanned.
    pub fn remove_after(
        &mut self,
        dest: AgentId,
        sender: AgentId,
        sent_time: Time,
    ) -> (Vec<EventRef>, usize) {
        let mut removed = Vec::new();
        let mut scanned = 0;
        for bucket in &mut self.buckets[self.curr_bucket..] {
            if bucket.is_empty() {
                continue;
            }
            let (mut hits, visited) = bucket.remove_matching(dest, sender, sent_time);
            scanned += visited;
            removed.append(&mut hits);
        }
        self.count -= removed.len();
        (removed, scanned)
    }

    pub fn remove_receiver(&mut self, receiver: AgentId) -> Vec<EventRef> {
        let mut removed = Vec::new();
        for bucket in &mut self.buckets[self.curr_bucket..] {
            removed.append(&mut bucket.remove_receiver(receiver));
        }
        self.count -= removed.len();
        removed
    }

    pub fn max_bucket_used(&self) -> usize {
        self.max_bucket_used
    }

    /// Lowest receive time still pending in this rung; `None` when empty.
    #[cfg(test)]
    pub fn min_pending_time(&self) -> Option<Time> {
        self.buckets[self.curr_bucket..]
            .iter()
            .filter_map(|b| b.time_bounds().map(|(lo, _)| lo))
            .min_by(|a, b| a.total_cmp(b))
    }

    #[cfg(test)]
    pub fn check_invariants(&self) {
        assert!(self.r_start <= self.r_curr);
        assert!(self.r_curr <= self.max_rung_time() + self.bucket_width);
        let live: usize = self.buckets.iter().map(|b| b.len()).sum();
        assert_eq!(live, self.count, "rung event count out of sync");
        for bucket in &self.buckets[..self.curr_bucket] {
            assert!(bucket.is_empty(), "consumed bucket still holds events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warpq_abstract::Event;

    fn filled_bucket(times: &[Time]) -> TwoTierBucket {
        let mut bucket = TwoTierBucket::new(8);
        for (i, &t) in times.iter().enumerate() {
            bucket.push(Event::new(i as u64, 1, 0.0, t));
        }
        bucket
    }

    #[test]
    fn distributes_and_consumes_in_time_order() {
        let source = filled_bucket(&[10.0, 11.5, 13.0, 19.9, 10.2]);
        let mut rung = Rung::new(source, 10.0, 19.9, 2.0, 8);
        rung.check_invariants();
        assert_eq!(rung.len(), 5);
        assert!(rung.can_contain(15.0));
        assert!(!rung.can_contain(25.0));

        let mut last_start = f64::NEG_INFINITY;
        let mut drained = 0;
        while let Some((bucket, start)) = rung.next_bucket() {
            assert!(start > last_start);
            last_start = start;
            drained += bucket.len();
            rung.check_invariants();
        }
        assert_eq!(drained, 5);
        assert!(rung.is_empty());
    }

    #[test]
    fn consumed_range_rejects_and_cancellation_scans_tail() {
        let source = filled_bucket(&[10.0, 12.5, 15.0, 17.5]);
        let mut rung = Rung::new(source, 10.0, 17.5, 2.5, 8);
        let (_bucket, start) = rung.next_bucket().unwrap();
        assert_eq!(start, 10.0);
        assert!(!rung.can_contain(10.1), "consumed bucket must reject");

        // Sender 2 sent the event at recv 15.0.
        let (removed, _scanned) = rung.remove_after(1, 2, 0.0);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].receive_time(), 15.0);
        rung.check_invariants();
        assert_eq!(rung.len(), 2);
    }
}
