//! Source loop: inbound transport into the bounded queue
//!
//! [`SourceLoop`] runs a [`MessageSource`] on its own task and hands every
//! delivered message to an [`Intake`], which pushes it into the queue
//! according to the stage's [`OverflowPolicy`].

use crate::metrics::{DropReason, Metrics};
use crate::queue::{BoundedQueue, PushError};
use crate::stage::Shutdown;
use async_trait::async_trait;
use kanava_core::{Message, MessageHandler, MessageSource, PluginError};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// What the intake does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the message and count it; the source never waits
    #[default]
    Drop,
    /// Wait for space; give up only on shutdown
    Block,
}

/// Queue-facing message handler
pub struct Intake {
    queue: Arc<BoundedQueue<Message>>,
    policy: OverflowPolicy,
    shutdown: Shutdown,
    metrics: Arc<Metrics>,
}

impl Intake {
    /// Handler pushing into `queue` under `policy`
    ///
    /// `shutdown` aborts a blocked push; it is unused under `Drop`.
    pub fn new(
        queue: Arc<BoundedQueue<Message>>,
        policy: OverflowPolicy,
        shutdown: Shutdown,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            queue,
            policy,
            shutdown,
            metrics,
        }
    }

    fn rejected(&self, err: PushError<Message>) {
        let reason = if err.is_full() {
            DropReason::QueueFull
        } else {
            DropReason::Shutdown
        };
        self.metrics.record_dropped(reason);
        let msg = err.into_inner();
        debug!(id = %msg.id, source = %msg.source, reason = reason.as_str(), "Message dropped at intake");
    }
}

#[async_trait]
impl MessageHandler for Intake {
    async fn handle(&self, msg: Message) {
        let started = Instant::now();
        self.metrics.received.inc();

        match self.policy {
            OverflowPolicy::Drop => {
                if let Err(err) = self.queue.try_push(msg) {
                    self.rejected(err);
                }
            }
            OverflowPolicy::Block => {
                let mut shutdown = self.shutdown.clone();
                tokio::select! {
                    biased;
                    res = self.queue.push_wait(msg) => {
                        if let Err(err) = res {
                            self.rejected(err);
                        }
                    }
                    _ = shutdown.cancelled() => {
                        self.metrics.record_dropped(DropReason::Shutdown);
                        debug!("Blocked push abandoned on shutdown");
                    }
                }
            }
        }

        self.metrics
            .consume_latency
            .observe(started.elapsed().as_secs_f64());
    }
}

/// A running message source
pub struct SourceLoop {
    source: Arc<dyn MessageSource>,
    task: Option<JoinHandle<Result<(), PluginError>>>,
}

impl SourceLoop {
    /// Connect `source` and start delivering into `handler`
    ///
    /// A connect failure is returned and nothing is spawned.
    pub async fn start(
        source: Arc<dyn MessageSource>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, PluginError> {
        source.connect().await?;

        let runner = Arc::clone(&source);
        let task = tokio::spawn(async move {
            let name = runner.name();
            info!(source = name, "Source loop started");
            let res = runner.run(handler).await;
            match &res {
                Ok(()) => info!(source = name, "Source loop finished"),
                Err(e) => error!(source = name, error = %e, "Source loop terminated"),
            }
            res
        });

        Ok(Self {
            source,
            task: Some(task),
        })
    }

    /// Name of the underlying source
    pub fn name(&self) -> &'static str {
        self.source.name()
    }

    /// True if `run` has returned
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Stop the source and wait for its loop to return
    ///
    /// When this returns no further message reaches the handler. The run
    /// error, if any, takes precedence over a stop error.
    pub async fn stop(&mut self) -> Result<(), PluginError> {
        let stopped = self.source.stop().await;

        let Some(task) = self.task.take() else {
            return stopped;
        };
        let ran = match task.await {
            Ok(res) => res,
            Err(e) => Err(PluginError::Shutdown(format!("source task failed: {e}"))),
        };
        ran.and(stopped)
    }
}
