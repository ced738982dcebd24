use warpq_abstract::{AgentId, EventRef, Time, is_cancelled_event};

/// Unsorted event bucket fanned out into `t2k` sub-buckets by a hash of the
/// sender's id.
///
/// This is the rollback optimisation of the whole ladder: cancellation by
/// sender only ever scans one sub-bucket per rung bucket instead of the
/// bucket's full population.
pub(super) struct TwoTierBucket {
    sub: Vec<Vec<EventRef>>,
    count: usize,
}

impl TwoTierBucket {
    pub fn new(t2k: usize) -> Self {
        debug_assert!(t2k > 0);
        TwoTierBucket {
            sub: (0..t2k).map(|_| Vec::new()).collect(),
            count: 0,
        }
    }

    #[inline]
    fn hash(&self, sender: AgentId) -> usize {
        sender as usize % self.sub.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn push(&mut self, event: EventRef) {
        let idx = self.hash(event.sender());
        self.sub[idx].push(event);
        self.count += 1;
    }

    /// Move every event out into `dest`, leaving this bucket empty.
    pub fn drain_into(&mut self, dest: &mut Vec<EventRef>) {
        for sub in &mut self.sub {
            dest.append(sub);
        }
        self.count = 0;
    }

    /// Lowest and highest receive time over the bucket's events.
    pub fn time_bounds(&self) -> Option<(Time, Time)> {
        let mut bounds: Option<(Time, Time)> = None;
        for event in self.sub.iter().flatten() {
            let t = event.receive_time();
            bounds = Some(match bounds {
                None => (t, t),
                Some((lo, hi)) => (lo.min(t), hi.max(t)),
            });
        }
        bounds
    }

    /// Cancel matching events in the sender's sub-bucket. Unsorted storage,
    /// so matches are swap-removed. Returns the removed events and the
    /// number of events scanned (for the cancellation statistics).
    pub fn remove_matching(
        &mut self,
        dest: AgentId,
        sender: AgentId,
        sent_time: Time,
    ) -> (Vec<EventRef>, usize) {
        let idx = self.hash(sender);
        let sub = &mut self.sub[idx];
        let scanned = sub.len();
        let mut removed = Vec::new();
        let mut pos = 0;
        while pos < sub.len() {
            if is_cancelled_event(dest, sender, sent_time, &sub[pos]) {
                removed.push(sub.swap_remove(pos));
            } else {
                pos += 1;
            }
        }
        self.count -= removed.len();
        (removed, scanned)
    }

    /// Remove every event addressed to `receiver`. Has to visit every
    /// sub-bucket: the fanout is keyed by sender, not receiver.
    pub fn remove_receiver(&mut self, receiver: AgentId) -> Vec<EventRef> {
        let mut removed = Vec::new();
        for sub in &mut self.sub {
            let mut pos = 0;
            while pos < sub.len() {
                if sub[pos].receiver() == receiver {
                    removed.push(sub.swap_remove(pos));
                } else {
                    pos += 1;
                }
            }
        }
        self.count -= removed.len();
        removed
    }

    /// Troubleshooting probe: is any event below `recv_time` stuck here?
    #[cfg(test)]
    pub fn have_before(&self, recv_time: Time) -> bool {
        self.sub
            .iter()
            .flatten()
            .any(|e| e.receive_time() < recv_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warpq_abstract::Event;

    #[test]
    fn fanout_and_cancellation() {
        let mut bucket = TwoTierBucket::new(4);
        for sender in 0..8u64 {
            bucket.push(Event::new(sender, 1, 1.0, 10.0 + sender as f64));
        }
        assert_eq!(bucket.len(), 8);

        // Cancelling sender 5 only scans its sub-bucket (senders 1 and 5).
        let (removed, scanned) = bucket.remove_matching(1, 5, 0.0);
        assert_eq!(removed.len(), 1);
        assert_eq!(scanned, 2);
        assert_eq!(bucket.len(), 7);

        let removed = bucket.remove_receiver(1);
        assert_eq!(removed.len(), 7);
        assert!(bucket.is_empty());
        assert_eq!(bucket.time_bounds(), None);
    }

    #[test]
    fn bounds_and_drain() {
        let mut bucket = TwoTierBucket::new(2);
        bucket.push(Event::new(0, 1, 0.0, 12.0));
        bucket.push(Event::new(1, 1, 0.0, 7.0));
        bucket.push(Event::new(2, 1, 0.0, 9.0));
        assert_eq!(bucket.time_bounds(), Some((7.0, 12.0)));
        assert!(bucket.have_before(8.0));
        assert!(!bucket.have_before(7.0));

        let mut all = Vec::new();
        bucket.drain_into(&mut all);
        assert_eq!(all.len(), 3);
        assert!(bucket.is_empty());
    }
}
