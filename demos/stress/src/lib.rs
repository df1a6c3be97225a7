//! Multi-threaded validation harness for [`casq::LockFreeQueue`].
//!
//! Producers draw sequential tickets from a shared counter and enqueue them;
//! consumers draw from an independent counter and dequeue until every ticket
//! has been removed. The collected values are then checked for loss and
//! duplication.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{Builder, Scope, ScopedJoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail, ensure};
use casq::LockFreeQueue;

pub use anyhow::Error;

#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub producers: usize,
    pub consumers: usize,
    pub max_count: usize,
    /// Randomly yield between operations to shake up interleavings.
    pub jitter: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            producers: 2,
            consumers: 2,
            max_count: 2048,
            jitter: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.producers > 0, "at least one producer is required");
        ensure!(self.consumers > 0, "at least one consumer is required");
        ensure!(self.max_count > 0, "max count must not be zero");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Report {
    /// Items enqueued by each producer.
    pub produced: Vec<usize>,
    /// Items dequeued by each consumer.
    pub consumed: Vec<usize>,
    /// Dequeues that found the queue empty and handed their ticket back.
    pub empty_retries: usize,
    pub values: Vec<usize>,
    pub elapsed: Duration,
}

impl Report {
    pub fn removed(&self) -> usize {
        self.consumed.iter().sum()
    }

    /// Checks that exactly the tickets `0..max_count` were delivered once each.
    pub fn verify(&self, max_count: usize) -> Result<()> {
        let produced = self.produced.iter().sum::<usize>();
        ensure!(
            produced == max_count,
            "producers enqueued {produced} of {max_count} items"
        );

        let removed = self.removed();
        ensure!(
            removed == self.values.len(),
            "consumers reported {removed} removals but {} values were collected",
            self.values.len()
        );

        let mut seen = HashSet::with_capacity(self.values.len());
        for &val in &self.values {
            if val >= max_count {
                bail!("dequeued {val}, which was never enqueued");
            }
            if !seen.insert(val) {
                bail!("dequeued {val} more than once");
            }
        }
        ensure!(
            seen.len() == removed,
            "collected {} distinct values from {removed} removals",
            seen.len()
        );
        ensure!(removed == max_count, "removed {removed} of {max_count} items");
        Ok(())
    }
}

#[derive(Default)]
struct Consumed {
    values: Vec<usize>,
    empty_retries: usize,
}

/// Drives one producer/consumer round against a fresh queue.
pub fn run(config: &Config) -> Result<Report> {
    config.validate()?;
    let Config {
        producers,
        consumers,
        max_count,
        jitter,
    } = *config;
    tracing::debug!("started round, config={config:?}");

    let queue = &LockFreeQueue::new();
    let enqueue_counter = &AtomicUsize::new(0);
    let dequeue_counter = &AtomicUsize::new(0);

    let now = Instant::now();
    let mut report = std::thread::scope(|cx| -> Result<Report> {
        // Producers go first so that consumers always have someone to wait on.
        let producers = (0..producers)
            .map(|i| {
                spawn_worker(cx, format!("producer-{i}"), move || {
                    produce(queue, enqueue_counter, max_count, jitter)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let consumers = (0..consumers)
            .map(|i| {
                spawn_worker(cx, format!("consumer-{i}"), move || {
                    consume(queue, dequeue_counter, max_count, jitter)
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut report = Report::default();
        for h in producers {
            report.produced.push(join_worker(h)?);
        }
        for h in consumers {
            let Consumed {
                values,
                empty_retries,
            } = join_worker(h)?;
            report.consumed.push(values.len());
            report.empty_retries += empty_retries;
            report.values.extend(values);
        }
        Ok(report)
    })?;
    report.elapsed = now.elapsed();

    tracing::debug!(
        "finished round, removed={}, retries={}, elapsed={:?}",
        report.removed(),
        report.empty_retries,
        report.elapsed
    );
    Ok(report)
}

fn spawn_worker<'scope, 'env, T, F>(
    cx: &'scope Scope<'scope, 'env>,
    name: String,
    f: F,
) -> Result<ScopedJoinHandle<'scope, T>>
where
    T: 'scope + Send,
    F: 'scope + Send + FnOnce() -> T,
{
    Builder::new()
        .name(name.clone())
        .spawn_scoped(cx, f)
        .with_context(|| format!("failed to spawn {name}"))
}

fn join_worker<T>(h: ScopedJoinHandle<'_, T>) -> Result<T> {
    let name = h.thread().name().unwrap_or("worker").to_owned();
    h.join().map_err(|_| anyhow!("{name} panicked"))
}

fn produce(
    queue: &LockFreeQueue<usize>,
    counter: &AtomicUsize,
    max_count: usize,
    jitter: bool,
) -> usize {
    let mut count = 0;
    loop {
        let val = counter.fetch_add(1, Ordering::Relaxed);
        if val >= max_count {
            break;
        }
        queue.enqueue(val);
        count += 1;
        maybe_yield(jitter);
    }
    tracing::info!("generated {count} items");
    count
}

fn consume(
    queue: &LockFreeQueue<usize>,
    counter: &AtomicUsize,
    max_count: usize,
    jitter: bool,
) -> Consumed {
    let mut out = Consumed::default();
    while claim_ticket(counter, max_count) {
        match queue.dequeue() {
            Some(val) => out.values.push(val),
            None => {
                // Producers are behind, hand the ticket back and retry later.
                counter.fetch_sub(1, Ordering::AcqRel);
                out.empty_retries += 1;
                std::thread::yield_now();
            },
        }
        maybe_yield(jitter);
    }
    tracing::info!(
        "consumed {} items, retries={}",
        out.values.len(),
        out.empty_retries
    );
    out
}

/// Takes a ticket unless all `max_count` are already claimed.
///
/// The counter never runs past `max_count`, so a ticket handed back by a
/// consumer that saw an empty queue is always claimable again.
fn claim_ticket(counter: &AtomicUsize, max_count: usize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < max_count).then_some(n + 1)
        })
        .is_ok()
}

fn maybe_yield(jitter: bool) {
    if jitter && fastrand::u8(..) < 32 {
        std::thread::yield_now();
    }
}
