pub mod config;
pub mod error;
pub mod event;
pub mod recycler;
pub mod time;

pub use event::{AgentId, Event, EventRef, event_compare, is_cancelled_event};
pub use time::{TIME_INFINITY, Time, time_equals};

pub use config::{BottomKind, QueueConfig};
pub use error::QueueError;
pub use recycler::{EventPool, EventRecycler, PoolStats};
