//! Contract scenarios shared by every queue variant's tests.
//!
//! Each concrete queue wires these up from its own `#[cfg(test)]` module so
//! the whole family is held to the same behaviour: delivery order, batch
//! completeness, rollback cancellation, agent removal, and reference-count
//! round trips.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use warpq_abstract::{
    AgentId, Event, EventPool, EventRecycler, EventRef, QueueError, Time, event_compare,
    time_equals,
};

use crate::queue::EventQueue;

pub mod harness {
    use super::*;

    /// A queue built against a counting recycler, so tests can audit every
    /// reference the queue takes and returns.
    pub struct QueueUnderTest {
        pub queue: Box<dyn EventQueue>,
        pub pool: Arc<EventPool>,
    }

    pub fn single_threaded(
        build: impl FnOnce(Arc<dyn EventRecycler>) -> Box<dyn EventQueue>,
    ) -> QueueUnderTest {
        let pool = Arc::new(EventPool::new(false));
        let recycler: Arc<dyn EventRecycler> = pool.clone();
        QueueUnderTest {
            queue: build(recycler),
            pool,
        }
    }
}

use harness::QueueUnderTest;

fn fingerprint(event: &Event) -> (AgentId, AgentId, u64, u64) {
    (
        event.sender(),
        event.receiver(),
        event.sent_time().to_bits(),
        event.receive_time().to_bits(),
    )
}

/// Dequeue one batch, hand the references back to the recycler (the caller
/// owns them after delivery), and return the batch.
fn take_batch(qt: &mut QueueUnderTest) -> Vec<EventRef> {
    let mut batch = Vec::new();
    qt.queue.dequeue_next_agent_events(&mut batch);
    for event in &batch {
        qt.pool.dec_ref(event);
    }
    batch
}

fn expect_batch(qt: &mut QueueUnderTest, receiver: AgentId, time: Time, len: usize) -> Vec<EventRef> {
    let batch = take_batch(qt);
    assert_eq!(batch.len(), len, "unexpected batch size at t={time}");
    for event in &batch {
        assert_eq!(event.receiver(), receiver);
        assert!(time_equals(event.receive_time(), time), "{event} not at {time}");
    }
    batch
}

/// S1: three agents, three events, strict `(time, receiver)` delivery order.
pub fn scenario_basic_order(mut qt: QueueUnderTest) {
    for agent in [1, 2, 3] {
        qt.queue.add_agent(agent).unwrap();
    }
    qt.queue.enqueue(1, Event::new(0, 1, 0.0, 1.0));
    qt.queue.enqueue(1, Event::new(0, 1, 0.0, 3.0));
    qt.queue.enqueue(3, Event::new(0, 3, 0.0, 2.0));

    let front = qt.queue.front().expect("queue has events");
    assert_eq!(front.receiver(), 1);
    assert!(time_equals(front.receive_time(), 1.0));

    expect_batch(&mut qt, 1, 1.0, 1);
    expect_batch(&mut qt, 3, 2.0, 1);
    expect_batch(&mut qt, 1, 3.0, 1);
    assert!(qt.queue.is_empty());
    assert!(qt.queue.front().is_none());
    assert_eq!(qt.pool.outstanding(), 0);
}

/// S2: concurrent events for one receiver come out as a single batch, and
/// the receiver tie-break orders agents at equal times.
pub fn scenario_concurrent_events(mut qt: QueueUnderTest) {
    for agent in [1, 2] {
        qt.queue.add_agent(agent).unwrap();
    }
    qt.queue.enqueue(1, Event::new(0, 1, 0.0, 3.0));
    qt.queue.enqueue(2, Event::new(0, 2, 0.0, 3.0));
    qt.queue.enqueue(1, Event::new(0, 1, 0.0, 3.0));
    qt.queue.enqueue(1, Event::new(0, 1, 0.0, 2.0));

    expect_batch(&mut qt, 1, 2.0, 1);
    expect_batch(&mut qt, 1, 3.0, 2);
    expect_batch(&mut qt, 2, 3.0, 1);
    assert!(qt.queue.is_empty());
    assert_eq!(qt.pool.outstanding(), 0);
}

/// S3: rollback cancellation removes exactly the matching sender/sent-time
/// suffix and nothing else.
pub fn scenario_rollback(mut qt: QueueUnderTest) {
    qt.queue.add_agent(9).unwrap();
    qt.queue.enqueue(9, Event::new(5, 9, 2.0, 10.0));
    qt.queue.enqueue(9, Event::new(5, 9, 4.0, 11.0));
    qt.queue.enqueue(9, Event::new(5, 9, 6.0, 12.0));
    qt.queue.enqueue(9, Event::new(7, 9, 3.0, 11.0));

    assert_eq!(qt.queue.erase_after(9, 5, 4.0), 2);

    let batch = expect_batch(&mut qt, 9, 10.0, 1);
    assert_eq!(batch[0].sender(), 5);
    let batch = expect_batch(&mut qt, 9, 11.0, 1);
    assert_eq!(batch[0].sender(), 7);
    assert!(qt.queue.is_empty());
    assert_eq!(qt.pool.outstanding(), 0);

    // No matches: not an error, just zero.
    assert_eq!(qt.queue.erase_after(9, 5, 0.0), 0);
}

/// S5: removing an agent gives back exactly its references, leaves the rest
/// untouched, and is idempotent.
pub fn scenario_remove_agent(mut qt: QueueUnderTest) {
    for agent in [1, 2, 3] {
        qt.queue.add_agent(agent).unwrap();
    }
    for agent in [1u64, 2, 3] {
        for i in 0..10 {
            let time = 1.0 + i as Time;
            qt.queue.enqueue(agent, Event::new(0, agent, 0.0, time));
        }
    }

    let before = qt.pool.stats().decrements;
    qt.queue.remove_agent(2).unwrap();
    assert_eq!(qt.pool.stats().decrements - before, 10);

    qt.queue.remove_agent(2).unwrap();
    assert_eq!(qt.pool.stats().decrements - before, 10, "second removal must be a no-op");
    assert!(matches!(
        qt.queue.remove_agent(42),
        Err(QueueError::UnknownAgent(42))
    ));

    let mut seen = 0;
    loop {
        let batch = take_batch(&mut qt);
        if batch.is_empty() {
            break;
        }
        for event in &batch {
            assert_ne!(event.receiver(), 2, "event for removed agent delivered: {event}");
        }
        seen += batch.len();
    }
    assert_eq!(seen, 20);
    assert_eq!(qt.pool.outstanding(), 0);
}

/// Property 3: the batch path takes no references, so a dequeue/re-enqueue
/// cycle (a rollback) keeps the ledger balanced.
pub fn scenario_refcount_round_trip(mut qt: QueueUnderTest) {
    qt.queue.add_agent(4).unwrap();
    for i in 0..6 {
        qt.queue.enqueue(4, Event::new(1, 4, 0.0, 1.0 + i as Time));
    }
    assert_eq!(qt.pool.outstanding(), 6);

    // Pull a batch without releasing it, as the scheduler would on rollback.
    let mut batch = Vec::new();
    qt.queue.dequeue_next_agent_events(&mut batch);
    assert_eq!(qt.pool.outstanding(), 6, "dequeue must not touch counts");

    // Events re-entering through the batch path carry their counts with them.
    // Their receive time must stay ahead of the agent's last delivery.
    let rescheduled: Vec<EventRef> = batch
        .iter()
        .map(|e| {
            let again = Event::new(e.sender(), e.receiver(), e.sent_time(), e.receive_time() + 10.0);
            qt.pool.inc_ref(&again);
            again
        })
        .collect();
    for event in batch.drain(..) {
        qt.pool.dec_ref(&event);
    }
    let mut rescheduled = rescheduled;
    qt.queue.enqueue_batch(4, &mut rescheduled);
    assert!(rescheduled.is_empty(), "batch input must be drained");

    while !take_batch(&mut qt).is_empty() {}
    assert!(qt.queue.is_empty());
    assert_eq!(qt.pool.outstanding(), 0);
}

/// Randomized differential test against a flat model of the pending set.
pub fn scenario_randomized(mut qt: QueueUnderTest, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let agents: Vec<AgentId> = (1..=8).collect();
    for &agent in &agents {
        qt.queue.add_agent(agent).unwrap();
    }

    let mut model: Vec<EventRef> = Vec::new();
    let mut delivered_floor: Time = 0.0;

    for _ in 0..500 {
        match rng.random_range(0..10u32) {
            0..=5 => {
                for _ in 0..rng.random_range(1..=4usize) {
                    let sender = rng.random_range(0..16u64);
                    let receiver = agents[rng.random_range(0..agents.len())];
                    let sent = delivered_floor + 0.001 + rng.random_range(0.0..50.0);
                    let recv = sent + rng.random_range(0.0..20.0);
                    let event = Event::new(sender, receiver, sent, recv);
                    model.push(event.clone());
                    qt.queue.enqueue(receiver, event);
                }
            }
            6 | 7 => {
                let batch = take_batch(&mut qt);
                check_batch_against_model(&batch, &mut model);
                if let Some(first) = batch.first() {
                    assert!(first.receive_time() >= delivered_floor);
                    delivered_floor = first.receive_time();
                }
            }
            8 => {
                let dest = agents[rng.random_range(0..agents.len())];
                let sender = rng.random_range(0..16u64);
                let sent_time = rng.random_range(0.0..delivered_floor + 50.0);
                let expected = model
                    .iter()
                    .filter(|e| {
                        e.receiver() == dest && e.sender() == sender && e.sent_time() >= sent_time
                    })
                    .count();
                let removed = qt.queue.erase_after(dest, sender, sent_time);
                assert_eq!(removed, expected, "erase_after removed the wrong set");
                model.retain(|e| {
                    !(e.receiver() == dest && e.sender() == sender && e.sent_time() >= sent_time)
                });
            }
            _ => {
                let front = qt.queue.front();
                let min = model.iter().min_by(|a, b| event_compare(a, b));
                match (front, min) {
                    (Some(f), Some(m)) => {
                        assert!(time_equals(f.receive_time(), m.receive_time()));
                        assert_eq!(f.receiver(), m.receiver());
                    }
                    (None, None) => {}
                    (f, m) => panic!("front {f:?} disagrees with model {m:?}"),
                }
            }
        }
    }

    loop {
        let batch = take_batch(&mut qt);
        if batch.is_empty() {
            break;
        }
        check_batch_against_model(&batch, &mut model);
    }
    assert!(model.is_empty(), "queue dropped {} events", model.len());
    assert!(qt.queue.is_empty());
    assert_eq!(qt.pool.outstanding(), 0);
}

/// The batch must be exactly the model's set of concurrent events for the
/// front `(time, receiver)` pair.
fn check_batch_against_model(batch: &[EventRef], model: &mut Vec<EventRef>) {
    let Some(first) = batch.first() else {
        assert!(model.is_empty(), "queue claims empty but model has events");
        return;
    };
    let min = model
        .iter()
        .min_by(|a, b| event_compare(a, b))
        .expect("model cannot be empty when the queue delivered")
        .clone();
    assert!(time_equals(first.receive_time(), min.receive_time()));
    assert_eq!(first.receiver(), min.receiver());

    let mut expected: Vec<_> = model
        .iter()
        .filter(|e| {
            e.receiver() == min.receiver() && time_equals(e.receive_time(), min.receive_time())
        })
        .map(|e| fingerprint(e))
        .collect();
    let mut got: Vec<_> = batch.iter().map(|e| fingerprint(e)).collect();
    expected.sort_unstable();
    got.sort_unstable();
    assert_eq!(got, expected, "batch is not the complete concurrent set");

    model.retain(|e| {
        !(e.receiver() == min.receiver() && time_equals(e.receive_time(), min.receive_time()))
    });
}
