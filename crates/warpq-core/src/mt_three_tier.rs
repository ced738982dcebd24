//! Multi-threaded three-tier scheduler over the lock-free skip-list PQ.
//!
//! Top tier: a [`LockFreePQ`] of agents keyed by `(next event time, agent
//! id)`. Second tier, per agent: a [`LockFreePQ`] keyed by receive time
//! whose entries hold the concurrent events for that time. Batch atomicity
//! comes from each entry's short mutex plus a `removed` flag; top-tier
//! re-keying is serialised per agent by its restructure mutex.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;
use warpq_abstract::{
    AgentId, EventRef, EventRecycler, QueueConfig, QueueError, TIME_INFINITY, Time,
    is_cancelled_event,
};

use crate::queue::EventQueueMt;
use crate::skiplist::LockFreePQ;
use crate::stats::Avg;

type AgentKey = (Time, AgentId);

struct Tier2State {
    recv_time: Time,
    events: Vec<EventRef>,
    /// Set (under the lock) the moment a dequeuer or canceller takes the
    /// entry; enqueuers finding it refuse to append and build a fresh one.
    removed: bool,
}

/// One receive time's worth of concurrent events for one agent.
pub struct Tier2EntryMt {
    state: Mutex<Tier2State>,
}

impl Tier2EntryMt {
    fn new(recv_time: Time, event: EventRef) -> Arc<Self> {
        Arc::new(Tier2EntryMt {
            state: Mutex::new(Tier2State {
                recv_time,
                events: vec![event],
                removed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Tier2State> {
        self.state.lock().expect("tier2 entry lock poisoned")
    }

    /// Append under the entry lock; fails iff the entry was concurrently
    /// taken, in which case the caller must create a new entry.
    fn try_append(&self, event: EventRef) -> bool {
        let mut state = self.lock();
        if state.removed {
            return false;
        }
        debug_assert_eq!(state.recv_time.to_bits(), event.receive_time().to_bits());
        state.events.push(event);
        true
    }
}

/// Per-agent state shared between the top tier and the workers.
pub struct MtAgent {
    id: AgentId,
    tier2: LockFreePQ<Time, Tier2EntryMt>,
    /// Current top-tier key. The mutex doubles as the agent's restructure
    /// lock: whoever holds it may delete/re-insert the agent's top entry.
    key: Mutex<AgentKey>,
    retired: AtomicBool,
}

impl MtAgent {
    pub fn id(&self) -> AgentId {
        self.id
    }
}

pub struct ThreeTierSkipQueue {
    top: LockFreePQ<AgentKey, MtAgent>,
    agents: HashMap<AgentId, Arc<MtAgent>>,
    recycler: Arc<dyn EventRecycler>,
    config: QueueConfig,
    entry_pool: Mutex<Vec<Arc<Tier2EntryMt>>>,
    avg_sched_bkt_size: Mutex<Avg>,
}

impl ThreeTierSkipQueue {
    pub fn new(config: QueueConfig, recycler: Arc<dyn EventRecycler>) -> Self {
        ThreeTierSkipQueue {
            top: LockFreePQ::new(config.num_levels, config.max_offset),
            agents: HashMap::new(),
            recycler,
            config,
            entry_pool: Mutex::new(Vec::new()),
            avg_sched_bkt_size: Mutex::new(Avg::default()),
        }
    }

    fn agent_for(&self, id: AgentId) -> &Arc<MtAgent> {
        match self.agents.get(&id) {
            Some(agent) if !agent.retired.load(Ordering::Acquire) => agent,
            _ => panic!("{}", QueueError::UnknownAgent(id)),
        }
    }

    fn make_entry(&self, recv_time: Time, event: EventRef) -> Arc<Tier2EntryMt> {
        let mut pool = self.entry_pool.lock().expect("entry pool lock poisoned");
        // Only reuse entries the pool holds exclusively. Busy ones stay put:
        // an enqueuer may still be reading them through a raw pointer, so
        // the pool must keep them alive until they quiesce.
        let mut idx = pool.len();
        while idx > 0 {
            idx -= 1;
            if Arc::strong_count(&pool[idx]) == 1 {
                let entry = pool.swap_remove(idx);
                let mut state = entry.lock();
                state.recv_time = recv_time;
                state.events.clear();
                state.events.push(event);
                state.removed = false;
                drop(state);
                return entry;
            }
        }
        Tier2EntryMt::new(recv_time, event)
    }

    fn recycle_entry(&self, entry: Arc<Tier2EntryMt>) {
        self.entry_pool
            .lock()
            .expect("entry pool lock poisoned")
            .push(entry);
    }

    /// Place one event into the agent's tier-2, creating or merging entries
    /// as races dictate.
    fn enqueue_event(&self, agent: &Arc<MtAgent>, event: EventRef) {
        let time = event.receive_time();
        if let Some(entry) = agent.tier2.get_entry(&time) {
            if entry.try_append(event.clone()) {
                return;
            }
            // Lost the window: the entry was dequeued while we looked at it.
        }
        loop {
            let entry = self.make_entry(time, event.clone());
            match agent.tier2.insert(time, entry.clone()) {
                None => return,
                Some(existing) => {
                    // Another thread created the entry first; merge into the
                    // winner unless it too is already being taken.
                    self.recycle_entry(entry);
                    if existing.try_append(event.clone()) {
                        return;
                    }
                }
            }
        }
    }

    /// Lower the agent's top-tier key to `new_time` if that is earlier.
    /// Used on the enqueue path, concurrent with dequeues.
    fn restructure_top_queue(&self, agent: &Arc<MtAgent>, new_time: Time) {
        let mut key = agent.key.lock().expect("restructure lock poisoned");
        if key.0 <= new_time {
            return;
        }
        match self.top.delete_entry(&key) {
            None => {
                // The agent is checked out right now; the dequeuing thread
                // reads `next_min` under this same lock when it pushes the
                // agent back, so our event will be seen.
            }
            Some(slot) => {
                key.0 = new_time;
                let dup = self.top.insert(*key, slot);
                debug_assert!(dup.is_none(), "agent re-keyed twice");
            }
        }
    }

    /// Re-key the agent to exactly `new_time`, raising or lowering. Used
    /// after a cancellation emptied the front of the agent's schedule.
    fn refresh_top_key(&self, agent: &Arc<MtAgent>, new_time: Time) {
        let mut key = agent.key.lock().expect("restructure lock poisoned");
        if key.0.to_bits() == new_time.to_bits() {
            return;
        }
        match self.top.delete_entry(&key) {
            None => {}
            Some(slot) => {
                key.0 = new_time;
                let dup = self.top.insert(*key, slot);
                debug_assert!(dup.is_none(), "agent re-keyed twice");
            }
        }
    }
}

impl EventQueueMt for ThreeTierSkipQueue {
    type Agent = Arc<MtAgent>;

    fn name(&self) -> &'static str {
        "mt-three-tier"
    }

    fn add_agent(&mut self, agent: AgentId) -> Result<(), QueueError> {
        if self.agents.contains_key(&agent) {
            return Err(QueueError::InvariantViolation(format!(
                "agent {agent} registered twice"
            )));
        }
        let slot = Arc::new(MtAgent {
            id: agent,
            tier2: LockFreePQ::new(self.config.num_levels, self.config.max_offset),
            key: Mutex::new((TIME_INFINITY, agent)),
            retired: AtomicBool::new(false),
        });
        let dup = self.top.insert((TIME_INFINITY, agent), slot.clone());
        debug_assert!(dup.is_none());
        self.agents.insert(agent, slot);
        Ok(())
    }

    fn remove_agent(&mut self, agent: AgentId) -> Result<(), QueueError> {
        let slot = self
            .agents
            .get(&agent)
            .cloned()
            .ok_or(QueueError::UnknownAgent(agent))?;
        if slot.retired.swap(true, Ordering::AcqRel) {
            return Ok(()); // already removed
        }
        {
            let key = slot.key.lock().expect("restructure lock poisoned");
            // Sequential phase: the agent cannot be checked out.
            let taken = self.top.delete_entry(&key);
            debug_assert!(taken.is_some(), "agent missing from top tier");
        }
        let recycler = &self.recycler;
        let drained = slot.tier2.drain_entries_from(&f64::NEG_INFINITY, |_, entry| {
            let mut state = entry.lock();
            for event in state.events.drain(..) {
                recycler.dec_ref(&event);
            }
            state.removed = true;
            true
        });
        for entry in drained {
            self.recycle_entry(entry);
        }
        Ok(())
    }

    fn pop_next_agent(&self) -> Option<Arc<MtAgent>> {
        self.top.delete_min()
    }

    fn dequeue_next_events(&self, agent: &Arc<MtAgent>, events: &mut Vec<EventRef>) {
        debug_assert!(events.is_empty());
        let Some(entry) = agent.tier2.delete_min() else {
            return;
        };
        let batch_time;
        {
            let mut state = entry.lock();
            state.removed = true;
            batch_time = state.recv_time;
            events.append(&mut state.events);
        }
        debug!(agent = agent.id, time = batch_time, count = events.len(), "delivering batch");
        #[cfg(debug_assertions)]
        {
            for event in events.iter() {
                assert!(
                    !event.is_anti_message(),
                    "{}",
                    QueueError::AntiMessageDelivery {
                        receiver: agent.id,
                        receive_time: batch_time,
                    }
                );
                assert_eq!(event.receive_time().to_bits(), batch_time.to_bits());
            }
        }
        self.avg_sched_bkt_size
            .lock()
            .expect("stats lock poisoned")
            .add(events.len() as f64);
        self.recycle_entry(entry);
    }

    fn push_agent(&self, agent: Arc<MtAgent>) {
        // Holding the restructure lock makes the next_min read stable: an
        // enqueuer that raced us either appended before the read, or is
        // blocked on this lock and will re-key the agent right after.
        let mut key = agent.key.lock().expect("restructure lock poisoned");
        key.0 = agent.tier2.next_min();
        let dup = self.top.insert(*key, agent.clone());
        debug_assert!(dup.is_none(), "agent pushed back twice");
    }

    fn enqueue(&self, event: EventRef) {
        let agent = self.agent_for(event.receiver()).clone();
        self.recycler.inc_ref(&event);
        let time = event.receive_time();
        self.enqueue_event(&agent, event);
        self.restructure_top_queue(&agent, time);
    }

    fn enqueue_batch(&self, dest: AgentId, events: &mut Vec<EventRef>) {
        let agent = self.agent_for(dest).clone();
        let mut min_time = TIME_INFINITY;
        for event in events.drain(..) {
            min_time = min_time.min(event.receive_time());
            self.enqueue_event(&agent, event);
        }
        if min_time < TIME_INFINITY {
            self.restructure_top_queue(&agent, min_time);
        }
    }

    fn erase_after(&self, dest: AgentId, sender: AgentId, sent_time: Time) -> usize {
        let agent = self.agent_for(dest).clone();
        let mut removed = 0;
        // sent <= recv, so no entry below sent_time can hold a match.
        let drained = agent.tier2.drain_entries_from(&sent_time, |_, entry| {
            let mut state = entry.lock();
            debug_assert!(!state.removed, "entry taken while rollback scan runs");
            let mut pos = 0;
            while pos < state.events.len() {
                if is_cancelled_event(dest, sender, sent_time, &state.events[pos]) {
                    let event = state.events.swap_remove(pos);
                    self.recycler.dec_ref(&event);
                    removed += 1;
                } else {
                    pos += 1;
                }
            }
            if state.events.is_empty() {
                state.removed = true;
                true
            } else {
                false
            }
        });
        for entry in drained {
            self.recycle_entry(entry);
        }
        // The post-cancellation minimum may be higher than the stale key;
        // restore top-tier order either way.
        self.refresh_top_key(&agent, agent.tier2.next_min());
        removed
    }

    fn pretty_print(&self, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "ThreeTierSkipQueue [agents={}]:", self.agents.len())?;
        for (id, agent) in &self.agents {
            let key = agent.key.lock().expect("restructure lock poisoned");
            writeln!(out, "  agent {id}: next={}", key.0)?;
        }
        Ok(())
    }

    fn report_stats(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let avg = self.avg_sched_bkt_size.lock().expect("stats lock poisoned");
        writeln!(out, "ThreeTierSkipQueue:")?;
        writeln!(out, "\tAgents registered            : {}", self.agents.len())?;
        writeln!(out, "\tAverage scheduled bucket size: {}", *avg)?;
        writeln!(
            out,
            "\tRecycled tier2 entries       : {}",
            self.entry_pool.lock().expect("entry pool lock poisoned").len()
        )
    }
}
