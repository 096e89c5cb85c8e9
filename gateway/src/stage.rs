//! Generic worker stage
//!
//! Every pool in kanava is the same shape: N tasks reading one shared
//! [`BoundedQueue`] until it is closed and drained, or until the stage is
//! cancelled. This module holds the pieces they share:
//!
//! - [`shutdown_channel`] - a one-shot broadcast signal over `watch`
//! - [`WorkerSet`] - the spawned tasks of one pool, joined together
//! - [`ItemHandler`] + [`spawn_item_workers`] - per-item pools
//!
//! Batch pools live in [`crate::batch`] and reuse the signal and the set.

use crate::queue::BoundedQueue;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Create a linked trigger/listener pair
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

/// Sending half of a shutdown signal
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Fire the signal; every current and future listener observes it
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    /// True once fired
    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Another listener on this signal
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

/// Listening half of a shutdown signal
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// A listener that never fires
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the value readable; the dropped sender means "never fires"
        drop(tx);
        Shutdown { rx }
    }

    /// True once the signal has fired
    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal fires
    ///
    /// If the trigger is dropped without firing this never resolves.
    /// Cancel-safe.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// The tasks of one worker pool
pub struct WorkerSet {
    name: &'static str,
    tasks: JoinSet<()>,
}

impl WorkerSet {
    /// Empty set for pool `name`
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tasks: JoinSet::new(),
        }
    }

    /// Spawn one worker
    pub fn spawn<F>(&mut self, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(worker);
    }

    /// Number of workers not yet joined
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True if every worker has been joined
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every worker to exit
    ///
    /// A panicked worker is logged and counted; it does not stop the join.
    /// Cancel-safe: dropping the future leaves the unjoined workers in the
    /// set, so the join can be resumed.
    pub async fn join(&mut self) -> usize {
        let mut panicked = 0;
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                warn!(pool = self.name, error = %e, "Worker exited abnormally");
                panicked += 1;
            }
        }
        debug!(pool = self.name, "All workers exited");
        panicked
    }

    /// Abort every remaining worker and wait for them
    pub async fn abort(&mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Per-item processing step of a worker pool
#[async_trait]
pub trait ItemHandler<T>: Send + Sync {
    /// Process one dequeued item to its terminal disposition
    async fn handle(&self, item: T);
}

/// Spawn `count` workers that feed `handler` from `queue`
///
/// Each worker exits when the queue is closed and drained, or when
/// `cancel` fires; an item already being handled is finished first.
pub fn spawn_item_workers<T, H>(
    set: &mut WorkerSet,
    count: usize,
    queue: Arc<BoundedQueue<T>>,
    handler: Arc<H>,
    cancel: Shutdown,
) where
    T: Send + 'static,
    H: ItemHandler<T> + ?Sized + 'static,
{
    for id in 0..count {
        let queue = Arc::clone(&queue);
        let handler = Arc::clone(&handler);
        let mut cancel = cancel.clone();
        let pool = set.name;
        set.spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(pool, worker = id, "Worker cancelled");
                        break;
                    }
                    item = queue.pop() => item,
                };
                match item {
                    Some(item) => handler.handle(item).await,
                    None => {
                        debug!(pool, worker = id, "Queue closed and drained");
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl ItemHandler<u32> for Recorder {
        async fn handle(&self, item: u32) {
            self.seen.lock().push(item);
        }
    }

    #[tokio::test]
    async fn test_shutdown_signal_reaches_all_listeners() {
        let (trigger, shutdown) = shutdown_channel();
        let mut a = shutdown.clone();
        let mut b = trigger.subscribe();

        assert!(!shutdown.is_fired());
        trigger.fire();
        trigger.fire();

        a.cancelled().await;
        b.cancelled().await;
        assert!(shutdown.is_fired());
        assert!(trigger.is_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_does_not_fire() {
        let mut never = Shutdown::never();
        let res = tokio::time::timeout(Duration::from_secs(60), never.cancelled()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_item_workers_drain_then_exit_on_close() {
        let queue = Arc::new(BoundedQueue::new(16));
        let handler = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let (_trigger, cancel) = shutdown_channel();

        let mut set = WorkerSet::new("test");
        spawn_item_workers(&mut set, 3, Arc::clone(&queue), Arc::clone(&handler), cancel);
        assert_eq!(set.len(), 3);

        for i in 0..10 {
            queue.push(i);
        }
        queue.close();

        assert_eq!(set.join().await, 0);
        let mut seen = handler.seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_item_workers_exit_on_cancel_with_open_queue() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(16));
        let handler = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let (trigger, cancel) = shutdown_channel();

        let mut set = WorkerSet::new("test");
        spawn_item_workers(&mut set, 2, Arc::clone(&queue), handler, cancel);

        trigger.fire();
        tokio::time::timeout(Duration::from_secs(1), set.join())
            .await
            .unwrap();
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_join_counts_panicked_workers() {
        let mut set = WorkerSet::new("test");
        set.spawn(async {});
        set.spawn(async { panic!("boom") });

        assert_eq!(set.join().await, 1);
    }
}
