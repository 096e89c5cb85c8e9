//! Rejection notices back to devices
//!
//! When a credential is rejected the producer queues a notice and moves on.
//! A small worker pool publishes each notice as `{"error": "<reason>"}` on
//! `devices/<id>/auth_response`. The notice channel is bounded; when it is
//! full the notice is dropped and counted, so producers never wait on the
//! return path.

use crate::metrics::Metrics;
use crate::stage::WorkerSet;
use bytes::Bytes;
use kanava_core::Publisher;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default notice channel depth
pub const DEFAULT_NOTICE_CAPACITY: usize = 1024;

/// A queued rejection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub device_id: String,
    pub reason: String,
}

impl Rejection {
    /// Topic the notice is published on
    pub fn topic(&self) -> String {
        format!("devices/{}/auth_response", self.device_id)
    }

    /// Notice body
    pub fn payload(&self) -> Bytes {
        Bytes::from(serde_json::json!({ "error": self.reason }).to_string())
    }
}

/// Bounded, non-blocking rejection publisher
pub struct RejectionNotifier {
    tx: Mutex<Option<mpsc::Sender<Rejection>>>,
    workers: tokio::sync::Mutex<WorkerSet>,
    metrics: Arc<Metrics>,
}

impl RejectionNotifier {
    /// Start `workers` publishers fed by a channel of depth `capacity`
    pub fn start(
        publisher: Arc<dyn Publisher>,
        workers: usize,
        capacity: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Rejection>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut set = WorkerSet::new("notifier");
        for id in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let publisher = Arc::clone(&publisher);
            let metrics = Arc::clone(&metrics);
            set.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(rejection) = next else {
                        debug!(worker = id, "Notice channel closed");
                        break;
                    };
                    match publisher
                        .publish(&rejection.topic(), rejection.payload())
                        .await
                    {
                        Ok(()) => metrics.rejections_sent.inc(),
                        Err(e) => {
                            metrics.rejections_dropped.inc();
                            warn!(device = %rejection.device_id, error = %e, "Failed to publish auth response");
                        }
                    }
                }
            });
        }

        Self {
            tx: Mutex::new(Some(tx)),
            workers: tokio::sync::Mutex::new(set),
            metrics,
        }
    }

    /// Queue a notice without waiting
    ///
    /// Returns false if the notice was dropped (channel full or notifier
    /// closed).
    pub fn notify(&self, device_id: &str, reason: &str) -> bool {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            self.metrics.rejections_dropped.inc();
            return false;
        };
        match tx.try_send(Rejection {
            device_id: device_id.to_string(),
            reason: reason.to_string(),
        }) {
            Ok(()) => true,
            Err(_) => {
                self.metrics.rejections_dropped.inc();
                debug!(device = device_id, "Notice channel full, dropping notice");
                false
            }
        }
    }

    /// Stop accepting notices, publish what is queued, and wait for the pool
    pub async fn close(&self) {
        self.tx.lock().take();
        self.workers.lock().await.join().await;
    }
}
