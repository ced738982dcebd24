use serde::{Deserialize, Serialize};

use crate::time::Time;

/// Which container backs the Bottom tier of the ladder queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BottomKind {
    /// Sorted vector; binary-search insert, contiguous scans.
    #[default]
    SortedVec,
    /// Binary min-heap with the max event time tracked on the side.
    Heap,
    /// Ordered multiset (B-tree) keyed by the canonical event order.
    MultiSet,
}

/// Construction-time tunables shared by the queue family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Ladder depth before the deepest rung flushes straight to Bottom.
    pub max_rungs: usize,
    /// Bucket size that triggers rung subdivision.
    pub thresh: usize,
    /// Sender-hash fanout of each two-tier bucket.
    pub t2k: usize,
    /// Floor on computed rung bucket widths.
    pub min_bucket_width: Time,
    /// Skip-list height cap.
    pub num_levels: usize,
    /// Logically-deleted prefix length that triggers a skip-list
    /// restructure. Must be at least the number of worker threads.
    pub max_offset: usize,
    /// Bottom backend for the ladder queue.
    pub bottom: BottomKind,
    /// Events are shared directly between threads; selects the recycler's
    /// split-counter mode.
    pub shared_events: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_rungs: 8,
            thresh: 50,
            t2k: 32,
            min_bucket_width: 0.01,
            num_levels: 32,
            max_offset: 8,
            bottom: BottomKind::SortedVec,
            shared_events: false,
        }
    }
}
