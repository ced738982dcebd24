use std::collections::HashMap;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use warpq_abstract::{AgentId, EventRef, EventRecycler, QueueConfig, QueueError, TIME_INFINITY, Time};

/// Contract between the scheduler and a concrete pending-event queue.
///
/// The priority of events is `(receive_time, receiver)`; the point of the
/// interface is to hand the scheduler *all* concurrent events of the front
/// agent in one batch. Reference counting: `enqueue` takes one reference per
/// event, cancellation paths give one back, and delivery transfers the
/// reference to the caller (exactly one `dec_ref` per dequeued event is the
/// caller's responsibility).
pub trait EventQueue {
    /// Human-readable identifier of the concrete variant.
    fn name(&self) -> &'static str;

    /// Register an agent. Must be called exactly once per agent before any
    /// event for it is enqueued.
    fn add_agent(&mut self, agent: AgentId) -> Result<(), QueueError>;

    /// Cancel every pending event scheduled for `agent` and release its
    /// per-agent storage. The agent stays registered; calling this again is
    /// a no-op.
    fn remove_agent(&mut self, agent: AgentId) -> Result<(), QueueError>;

    /// True iff no deliverable events remain.
    fn is_empty(&self) -> bool;

    /// The lowest pending event in the global order, without dequeuing.
    ///
    /// Takes `&mut self` because the ladder variant may have to populate its
    /// Bottom tier to answer.
    fn front(&mut self) -> Option<EventRef>;

    /// Remove all concurrent events of the front agent at the front time and
    /// append them to `events` (order within the batch unspecified). No-op
    /// on an empty queue.
    fn dequeue_next_agent_events(&mut self, events: &mut Vec<EventRef>);

    /// Insert one event; performs one `inc_ref`.
    fn enqueue(&mut self, agent: AgentId, event: EventRef);

    /// Insert a batch of events, draining the input vector. Reference counts
    /// are left untouched: this path re-schedules events after a rollback,
    /// where the counts are already correct.
    fn enqueue_batch(&mut self, agent: AgentId, events: &mut Vec<EventRef>);

    /// Cancel every pending event for `dest` that `sender` sent at or after
    /// `sent_time`. One `dec_ref` per cancelled event; returns the count.
    fn erase_after(&mut self, dest: AgentId, sender: AgentId, sent_time: Time) -> usize;

    /// Dump the full queue contents; troubleshooting only.
    fn pretty_print(&self, out: &mut dyn io::Write) -> io::Result<()>;

    /// Write aggregate statistics, typically at the end of a run.
    fn report_stats(&self, out: &mut dyn io::Write) -> io::Result<()>;
}

/// Contract of the multi-threaded queues. Instead of the single
/// `dequeue_next_agent_events` call, dequeuing splits into a three-step
/// protocol so several worker threads can process different agents
/// concurrently:
///
/// 1. `pop_next_agent` — exclusive processing rights on one agent,
/// 2. `dequeue_next_events` — that agent's next concurrent batch,
/// 3. `push_agent` — reinsert the agent, re-keyed by its next event.
///
/// Enqueues may run concurrently with the protocol from any thread.
/// Rollback cancellation and the agent lifecycle are not: `erase_after`
/// belongs to the dequeue thread, `add_agent`/`remove_agent` to a
/// sequential phase (hence `&mut self`).
pub trait EventQueueMt: Send + Sync {
    /// Opaque handle to an agent checked out of the top tier.
    type Agent: Clone + Send;

    fn name(&self) -> &'static str;

    fn add_agent(&mut self, agent: AgentId) -> Result<(), QueueError>;

    fn remove_agent(&mut self, agent: AgentId) -> Result<(), QueueError>;

    /// Take exclusive processing rights on the agent with the lowest next
    /// event time. Returns `None` only transiently, when every agent is
    /// checked out by some worker.
    fn pop_next_agent(&self) -> Option<Self::Agent>;

    /// The checked-out agent's next batch of concurrent events. Leaves the
    /// output untouched when the agent has nothing pending.
    fn dequeue_next_events(&self, agent: &Self::Agent, events: &mut Vec<EventRef>);

    /// Return a checked-out agent to the top tier under its current
    /// minimum event time.
    fn push_agent(&self, agent: Self::Agent);

    /// Insert one event (receiver taken from the event); one `inc_ref`.
    fn enqueue(&self, event: EventRef);

    /// Batch insert without reference-count changes; drains the input.
    fn enqueue_batch(&self, dest: AgentId, events: &mut Vec<EventRef>);

    /// Cancel matching events for `dest`. Must run on the dequeue thread;
    /// only enqueues may be concurrent with it.
    fn erase_after(&self, dest: AgentId, sender: AgentId, sent_time: Time) -> usize;

    /// Diagnostic dump; only meaningful while the queue is quiescent.
    fn pretty_print(&self, out: &mut dyn io::Write) -> io::Result<()>;

    fn report_stats(&self, out: &mut dyn io::Write) -> io::Result<()>;
}

/// Registered-agent bookkeeping shared by the queues that keep no per-agent
/// storage of their own (flat heaps, ladder). Also carries the per-agent
/// last-delivery time used by the debug-mode causality check.
#[derive(Debug, Default)]
pub(crate) struct AgentRegistry {
    agents: HashMap<AgentId, Time>,
}

impl AgentRegistry {
    pub fn add(&mut self, agent: AgentId) -> Result<(), QueueError> {
        if self.agents.insert(agent, -TIME_INFINITY).is_some() {
            return Err(QueueError::InvariantViolation(format!(
                "agent {agent} registered twice"
            )));
        }
        Ok(())
    }

    pub fn ensure(&self, agent: AgentId) -> Result<(), QueueError> {
        if self.agents.contains_key(&agent) {
            Ok(())
        } else {
            Err(QueueError::UnknownAgent(agent))
        }
    }

    pub fn assert_registered(&self, agent: AgentId) {
        if let Err(err) = self.ensure(agent) {
            panic!("{err}");
        }
    }

    /// Debug-mode delivery checks: a batch must be non-empty concurrent
    /// events for one agent, none of them anti-messages, strictly above the
    /// agent's last delivery time.
    pub fn note_delivery(&mut self, batch: &[EventRef]) {
        #[cfg(debug_assertions)]
        {
            let first = batch.first().expect("delivered batch cannot be empty");
            let receiver = first.receiver();
            let time = first.receive_time();
            for event in batch {
                assert!(
                    event.receiver() == receiver
                        && warpq_abstract::time_equals(event.receive_time(), time),
                    "batch mixes receivers or receive times: {event} vs {first}"
                );
                if event.is_anti_message() {
                    panic!(
                        "{}",
                        QueueError::AntiMessageDelivery {
                            receiver,
                            receive_time: time,
                        }
                    );
                }
            }
            if let Some(lvt) = self.agents.get_mut(&receiver) {
                if time <= *lvt {
                    panic!(
                        "{}",
                        QueueError::CausalityViolation {
                            receiver,
                            receive_time: time,
                            lvt: *lvt,
                        }
                    );
                }
                *lvt = time;
            }
        }
        #[cfg(not(debug_assertions))]
        let _ = batch;
    }
}

/// The queue variants selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Heap,
    Binomial,
    TwoTier,
    ThreeTier,
    Ladder,
}

impl QueueKind {
    pub const ALL: [QueueKind; 5] = [
        QueueKind::Heap,
        QueueKind::Binomial,
        QueueKind::TwoTier,
        QueueKind::ThreeTier,
        QueueKind::Ladder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Heap => "heap",
            QueueKind::Binomial => "binomial",
            QueueKind::TwoTier => "two-tier",
            QueueKind::ThreeTier => "three-tier",
            QueueKind::Ladder => "ladder",
        }
    }
}

impl FromStr for QueueKind {
    type Err = String;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "heap" => Ok(QueueKind::Heap),
            "binomial" => Ok(QueueKind::Binomial),
            "two-tier" | "2theap" => Ok(QueueKind::TwoTier),
            "three-tier" | "3theap" => Ok(QueueKind::ThreeTier),
            "ladder" | "ladderq" => Ok(QueueKind::Ladder),
            other => Err(format!("unknown queue kind `{other}`")),
        }
    }
}

/// Build a queue variant against the given recycler and tunables.
pub fn build_queue(
    kind: QueueKind,
    config: &QueueConfig,
    recycler: Arc<dyn EventRecycler>,
) -> Box<dyn EventQueue> {
    match kind {
        QueueKind::Heap => Box::new(crate::heap_queue::HeapEventQueue::new(recycler)),
        QueueKind::Binomial => Box::new(crate::binomial::BinomialEventQueue::new(recycler)),
        QueueKind::TwoTier => Box::new(crate::two_tier::TwoTierHeapQueue::new(recycler)),
        QueueKind::ThreeTier => Box::new(crate::three_tier::ThreeTierHeapQueue::new(recycler)),
        QueueKind::Ladder => Box::new(crate::ladder::LadderQueue::new(config.clone(), recycler)),
    }
}
