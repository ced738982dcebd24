pub mod binary_heap;
pub mod binomial;
pub mod heap_queue;
pub mod ladder;
pub mod mt_three_tier;
pub mod queue;
pub mod skiplist;
pub mod stats;
pub mod three_tier;
pub mod two_tier;

#[cfg(test)]
mod test_support;

pub use queue::{EventQueue, EventQueueMt, QueueKind, build_queue};

pub use binary_heap::{BinaryHeap, fix_heap};
pub use binomial::BinomialEventQueue;
pub use heap_queue::HeapEventQueue;
pub use ladder::LadderQueue;
pub use mt_three_tier::{MtAgent, ThreeTierSkipQueue, Tier2EntryMt};
pub use skiplist::{LockFreePQ, NUM_LEVELS, SkipKey};
pub use stats::Avg;
pub use three_tier::ThreeTierHeapQueue;
pub use two_tier::TwoTierHeapQueue;
