//! Batch accumulator workers
//!
//! Each worker owns a batch and a timer and reads from the shared queue.
//! A batch is flushed when the first of these fires:
//!
//! | Trigger          | Flush            | Then           |
//! |------------------|------------------|----------------|
//! | cancellation     | remainder        | exit           |
//! | queue closed     | remainder        | exit           |
//! | batch full       | full batch       | restart timer  |
//! | timer tick       | whatever is held | keep going     |
//!
//! The select is biased in that order, so cancellation pre-empts a pending
//! item and a pending item pre-empts the timer. Timer flushes may hand the
//! sink an empty batch; terminal flushes skip the sink when nothing is held.
//!
//! Flush failures are logged and counted, never retried here.

use crate::metrics::Metrics;
use crate::queue::BoundedQueue;
use crate::stage::{Shutdown, WorkerSet};
use kanava_core::BatchSink;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Accumulator tuning
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Flush as soon as a batch holds this many items
    pub max_batch_size: usize,
    /// Flush at least this often
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Spawn `count` accumulator workers into `set`
pub fn spawn_accumulators<T>(
    set: &mut WorkerSet,
    count: usize,
    queue: Arc<BoundedQueue<T>>,
    sink: Arc<dyn BatchSink<T>>,
    config: BatchConfig,
    cancel: Shutdown,
    metrics: Arc<Metrics>,
) where
    T: Send + Sync + 'static,
{
    for id in 0..count {
        set.spawn(accumulate(
            id,
            Arc::clone(&queue),
            Arc::clone(&sink),
            config,
            cancel.clone(),
            Arc::clone(&metrics),
        ));
    }
}

/// One accumulator worker
pub async fn accumulate<T>(
    id: usize,
    queue: Arc<BoundedQueue<T>>,
    sink: Arc<dyn BatchSink<T>>,
    config: BatchConfig,
    mut cancel: Shutdown,
    metrics: Arc<Metrics>,
) where
    T: Send + Sync + 'static,
{
    let max = config.max_batch_size.max(1);
    let mut batch: Vec<T> = Vec::with_capacity(max);

    let start = tokio::time::Instant::now() + config.flush_interval;
    let mut ticker = tokio::time::interval_at(start, config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(worker = id, held = batch.len(), "Accumulator cancelled");
                if !batch.is_empty() {
                    flush(id, sink.as_ref(), &mut batch, &metrics).await;
                }
                return;
            }
            item = queue.pop() => match item {
                Some(item) => {
                    batch.push(item);
                    if batch.len() >= max {
                        flush(id, sink.as_ref(), &mut batch, &metrics).await;
                        ticker.reset();
                    }
                }
                None => {
                    debug!(worker = id, held = batch.len(), "Queue closed, flushing remainder");
                    if !batch.is_empty() {
                        flush(id, sink.as_ref(), &mut batch, &metrics).await;
                    }
                    return;
                }
            },
            _ = ticker.tick() => {
                flush(id, sink.as_ref(), &mut batch, &metrics).await;
            }
        }
    }
}

/// Hand the batch to the sink once and clear it, whatever the outcome
async fn flush<T>(id: usize, sink: &dyn BatchSink<T>, batch: &mut Vec<T>, metrics: &Metrics)
where
    T: Send + Sync,
{
    let size = batch.len();
    let started = Instant::now();

    match sink.flush(batch).await {
        Ok(written) => {
            if written > 0 {
                metrics.record_flush(written, started.elapsed());
                debug!(worker = id, sink = sink.name(), size, written, "Batch flushed");
            }
        }
        Err(e) => {
            metrics.flush_errors.inc();
            warn!(worker = id, sink = sink.name(), size, error = %e, "Batch flush failed");
        }
    }

    batch.clear();
}
