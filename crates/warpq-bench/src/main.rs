use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, ensure};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;

use warpq_abstract::{
    AgentId, Event, EventPool, EventRecycler, EventRef, PoolStats, QueueConfig, Time,
};
use warpq_core::{EventQueue, EventQueueMt, QueueKind, ThreeTierSkipQueue, build_queue};

#[derive(Parser, Debug)]
#[command(author, version, about = "Synthetic workload driver for the pending-event queues")]
struct Args {
    /// Queue variant: heap, binomial, two-tier, three-tier, ladder, or
    /// mt-three-tier.
    #[arg(long, default_value = "three-tier")]
    queue: String,

    #[arg(long, default_value_t = 64)]
    agents: u64,

    /// Total events to generate.
    #[arg(long, default_value_t = 100_000)]
    events: u64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Probability of issuing a rollback cancellation after a batch.
    #[arg(long, default_value_t = 0.05)]
    rollback_rate: f64,

    /// Enqueue threads for the mt-three-tier variant.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Write a JSON report of the finished run.
    #[arg(long)]
    json_out: Option<PathBuf>,
}

#[derive(Serialize)]
struct BenchReport {
    queue: String,
    agents: u64,
    generated: u64,
    delivered: usize,
    batches: usize,
    cancelled: usize,
    elapsed_ms: u128,
    pool: PoolStats,
    stats: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    info!(queue = %args.queue, events = args.events, "warpq-bench starting");

    let report = if args.queue == "mt-three-tier" {
        run_multi_threaded(&args)?
    } else {
        let kind: QueueKind = args
            .queue
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .context("unsupported --queue value")?;
        run_single_threaded(kind, &args)?
    };

    println!("{}", report.stats);
    println!(
        "delivered {} events in {} batches, cancelled {}, {} ms",
        report.delivered, report.batches, report.cancelled, report.elapsed_ms
    );

    if let Some(path) = &args.json_out {
        let data = serde_json::to_vec_pretty(&report).context("failed to serialize report")?;
        fs::write(path, &data)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }
    Ok(())
}

fn run_single_threaded(kind: QueueKind, args: &Args) -> Result<BenchReport> {
    let pool = Arc::new(EventPool::new(false));
    let mut queue = build_queue(kind, &QueueConfig::default(), pool.clone());
    for agent in 0..args.agents {
        queue
            .add_agent(agent)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let started = Instant::now();
    let mut generated = 0u64;
    let mut delivered = 0usize;
    let mut batches = 0usize;
    let mut cancelled = 0usize;
    let mut horizon: Time = 0.0;
    let mut last_batch_time: Time = 0.0;
    let mut batch: Vec<EventRef> = Vec::new();

    while generated < args.events || !queue.is_empty() {
        // Keep a few bursts in flight ahead of the delivery horizon.
        if generated < args.events {
            for _ in 0..16.min(args.events - generated) {
                let sender: AgentId = rng.random_range(0..args.agents * 4);
                let receiver: AgentId = rng.random_range(0..args.agents);
                let sent = horizon + rng.random_range(0.0..10.0);
                let recv = sent + rng.random_range(0.0..25.0) + 0.001;
                queue.enqueue(receiver, Event::new(sender, receiver, sent, recv));
                generated += 1;
            }
        }

        batch.clear();
        queue.dequeue_next_agent_events(&mut batch);
        if let Some(first) = batch.first() {
            ensure!(
                first.receive_time() >= last_batch_time,
                "delivery regressed from {last_batch_time} to {}",
                first.receive_time()
            );
            last_batch_time = first.receive_time();
            horizon = horizon.max(last_batch_time);
            batches += 1;
            delivered += batch.len();
            for event in &batch {
                pool.dec_ref(event);
            }
        }

        if args.rollback_rate > 0.0 && rng.random::<f64>() < args.rollback_rate {
            let dest = rng.random_range(0..args.agents);
            let sender = rng.random_range(0..args.agents * 4);
            cancelled += queue.erase_after(dest, sender, horizon);
        }
    }

    ensure!(
        pool.outstanding() == 0,
        "reference counts leaked: {} outstanding",
        pool.outstanding()
    );

    let mut stats = Vec::new();
    queue.report_stats(&mut stats)?;
    Ok(BenchReport {
        queue: kind.as_str().to_string(),
        agents: args.agents,
        generated,
        delivered,
        batches,
        cancelled,
        elapsed_ms: started.elapsed().as_millis(),
        pool: pool.stats(),
        stats: String::from_utf8_lossy(&stats).into_owned(),
    })
}

fn run_multi_threaded(args: &Args) -> Result<BenchReport> {
    let pool = Arc::new(EventPool::new(true));
    let config = QueueConfig {
        shared_events: true,
        ..QueueConfig::default()
    };
    let mut queue = ThreeTierSkipQueue::new(config, pool.clone());
    for agent in 0..args.agents {
        queue
            .add_agent(agent)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    let queue = Arc::new(queue);

    let per_thread = args.events / args.threads.max(1) as u64;
    let total = per_thread * args.threads.max(1) as u64;
    let enqueued = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let (delivered, batches) = std::thread::scope(|scope| {
        for thread in 0..args.threads.max(1) as u64 {
            let queue = Arc::clone(&queue);
            let enqueued = Arc::clone(&enqueued);
            let agents = args.agents;
            let seed = args.seed;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed ^ (thread + 1));
                for i in 0..per_thread {
                    // Disjoint sender ranges keep rollback ownership clear.
                    let sender = thread * per_thread + i;
                    let receiver = rng.random_range(0..agents);
                    let sent: Time = rng.random_range(0.0..1000.0);
                    let recv = sent + rng.random_range(0.0..50.0) + 0.001;
                    queue.enqueue(Event::new(sender, receiver, sent, recv));
                    enqueued.fetch_add(1, Ordering::Release);
                }
            });
        }

        let queue = Arc::clone(&queue);
        let pool = Arc::clone(&pool);
        let enqueued = Arc::clone(&enqueued);
        scope
            .spawn(move || {
                let mut delivered = 0usize;
                let mut batches = 0usize;
                let mut batch: Vec<EventRef> = Vec::new();
                let mut idle = 0u32;
                // The stream cannot be monotone while below-frontier inserts
                // are landing; once every enqueue is in, each pop takes the
                // global minimum, so the suffix must be non-decreasing.
                let mut quiescent_floor: Option<Time> = None;
                while delivered < total as usize && idle < 5_000_000 {
                    let quiescent = enqueued.load(Ordering::Acquire) == total;
                    let Some(agent) = queue.pop_next_agent() else {
                        idle += 1;
                        std::thread::yield_now();
                        continue;
                    };
                    batch.clear();
                    queue.dequeue_next_events(&agent, &mut batch);
                    queue.push_agent(agent);
                    if batch.is_empty() {
                        idle += 1;
                        std::thread::yield_now();
                        continue;
                    }
                    idle = 0;
                    let time = batch[0].receive_time();
                    if quiescent {
                        if let Some(floor) = quiescent_floor {
                            assert!(
                                time >= floor,
                                "post-quiescence delivery regressed from {floor} to {time}"
                            );
                        }
                        quiescent_floor = Some(time);
                    }
                    batches += 1;
                    delivered += batch.len();
                    for event in &batch {
                        pool.dec_ref(event);
                    }
                }
                (delivered, batches)
            })
            .join()
            .expect("dequeue thread panicked")
    });

    ensure!(delivered == total as usize, "events lost: {delivered}/{total}");
    ensure!(
        pool.outstanding() == 0,
        "reference counts leaked: {} outstanding",
        pool.outstanding()
    );

    let mut stats = Vec::new();
    queue.report_stats(&mut stats)?;
    Ok(BenchReport {
        queue: "mt-three-tier".to_string(),
        agents: args.agents,
        generated: total,
        delivered,
        batches,
        cancelled: 0,
        elapsed_ms: started.elapsed().as_millis(),
        pool: pool.stats(),
        stats: String::from_utf8_lossy(&stats).into_owned(),
    })
}
