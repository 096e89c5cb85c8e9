//! Pipeline lifecycle
//!
//! Two pipelines share one orchestration discipline:
//!
//! ```text
//! Ingress:  source ─► queue ─► producers (auth gate) ─► message sink
//! Loader:   source ─► queue ─► accumulators          ─► batch sink
//! ```
//!
//! # Startup
//!
//! Dependencies before dependants: sink, auth, queue, workers, source.
//! A source that fails to connect aborts startup with
//! [`KanavaError::Startup`]; whatever was already started is torn down.
//!
//! # Shutdown
//!
//! 1. Fire the shutdown signal (aborts a blocked intake push)
//! 2. Stop the source and wait until its loop has returned
//! 3. Close the queue; only now, so no push can race the close
//! 4. Join the workers as they drain the queue, bounded by
//!    `shutdown_timeout`. On timeout, fire cancellation: accumulators flush
//!    what they hold, producers finish their current item, and whatever is
//!    still queued is counted as dropped (`shutdown`)
//! 5. Close the sink
//! 6. Join the error-drain pool; it exits when the sink's error channel
//!    closes

use crate::auth::AuthGate;
use crate::batch::spawn_accumulators;
use crate::config::{IngressConfig, LoaderConfig};
use crate::error::{KanavaError, Result};
use crate::metrics::{DropReason, Metrics};
use crate::notify::RejectionNotifier;
use crate::producer::{ProducerLoop, spawn_error_drain};
use crate::queue::BoundedQueue;
use crate::source::{Intake, OverflowPolicy, SourceLoop};
use crate::stage::{ShutdownTrigger, WorkerSet, shutdown_channel, spawn_item_workers};
use kanava_core::{
    BatchSink, CredentialAuthority, Message, MessageSink, MessageSource, PluginError, Publisher,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Outcome of a pipeline shutdown
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Items still queued when workers were cancelled
    pub abandoned: usize,
    /// True if graceful draining exceeded `shutdown_timeout`
    pub timed_out: bool,
    /// Terminal error reported by the source, if any
    pub source_error: Option<PluginError>,
    /// Error from closing the sink, if any
    pub sink_error: Option<PluginError>,
}

impl ShutdownReport {
    /// True if every queued item reached a worker and nothing failed
    pub fn is_clean(&self) -> bool {
        self.abandoned == 0
            && !self.timed_out
            && self.source_error.is_none()
            && self.sink_error.is_none()
    }
}

/// The source/queue/worker core shared by both pipelines
struct Orchestrator {
    name: &'static str,
    shutdown: ShutdownTrigger,
    cancel: ShutdownTrigger,
    source: SourceLoop,
    queue: Arc<BoundedQueue<Message>>,
    workers: WorkerSet,
    metrics: Arc<Metrics>,
    shutdown_timeout: Duration,
}

impl Orchestrator {
    /// Steps 1 to 4
    async fn drain(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        info!(pipeline = self.name, queued = self.queue.len(), "Shutting down");

        self.shutdown.fire();

        if let Err(e) = self.source.stop().await {
            error!(pipeline = self.name, source = self.source.name(), error = %e, "Source ended with error");
            report.source_error = Some(e);
        }

        self.queue.close();

        if tokio::time::timeout(self.shutdown_timeout, self.workers.join())
            .await
            .is_err()
        {
            report.timed_out = true;
            warn!(
                pipeline = self.name,
                queued = self.queue.len(),
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "Workers did not drain in time, cancelling"
            );
            self.cancel.fire();
            if tokio::time::timeout(self.shutdown_timeout, self.workers.join())
                .await
                .is_err()
            {
                error!(pipeline = self.name, "Workers ignored cancellation, aborting");
                self.workers.abort().await;
            }
        }

        report.abandoned = self.queue.discard_remaining();
        if report.abandoned > 0 {
            self.metrics
                .record_dropped_n(DropReason::Shutdown, report.abandoned as u64);
            warn!(pipeline = self.name, abandoned = report.abandoned, "Queued items abandoned");
        }
        report
    }
}

/// Plugins the ingress pipeline runs between
pub struct IngressPlugins<A> {
    /// Device transport
    pub source: Arc<dyn MessageSource>,
    /// Durable log producer
    pub sink: Arc<dyn MessageSink>,
    /// Token authority
    pub authority: Arc<A>,
    /// Return path for rejection notices
    pub publisher: Arc<dyn Publisher>,
}

/// Running ingress pipeline
pub struct IngressPipeline<A: CredentialAuthority> {
    core: Orchestrator,
    gate: Arc<AuthGate<A>>,
    notifier: Arc<RejectionNotifier>,
    sink: Arc<dyn MessageSink>,
    drain: WorkerSet,
}

impl<A: CredentialAuthority + 'static> IngressPipeline<A> {
    /// Start every stage, dependencies first
    pub async fn start(
        config: IngressConfig,
        plugins: IngressPlugins<A>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let IngressPlugins {
            source,
            sink,
            authority,
            publisher,
        } = plugins;

        // Sink: error channel and its drain pool
        let mut drain = WorkerSet::new("drain");
        match sink.take_errors() {
            Some(errors) => spawn_error_drain(
                &mut drain,
                config.drain_workers,
                errors,
                sink.name(),
                Arc::clone(&metrics),
            ),
            None => warn!(sink = sink.name(), "Sink error channel already taken"),
        }

        // Auth
        let gate = Arc::new(
            AuthGate::new(authority, config.auth_timeout).with_metrics(Arc::clone(&metrics)),
        );
        gate.warm_up().await;

        // Queue and workers
        let queue = Arc::new(BoundedQueue::new(config.queue_capacity));
        let (shutdown, shutdown_rx) = shutdown_channel();
        let (cancel, cancel_rx) = shutdown_channel();

        let notifier = Arc::new(RejectionNotifier::start(
            publisher,
            config.notifier_workers,
            config.notice_capacity,
            Arc::clone(&metrics),
        ));
        let producer = Arc::new(ProducerLoop::new(
            Arc::clone(&gate),
            Arc::clone(&sink),
            Arc::clone(&notifier),
            config.topic.clone(),
            Arc::clone(&metrics),
        ));
        let mut workers = WorkerSet::new("producer");
        spawn_item_workers(
            &mut workers,
            config.producer_workers,
            Arc::clone(&queue),
            producer,
            cancel_rx,
        );

        // Source last
        let intake = Arc::new(Intake::new(
            Arc::clone(&queue),
            OverflowPolicy::Drop,
            shutdown_rx,
            Arc::clone(&metrics),
        ));
        let source = match SourceLoop::start(Arc::clone(&source), intake).await {
            Ok(source) => source,
            Err(e) => {
                error!(source = source.name(), error = %e, "Source failed to start");
                queue.close();
                workers.join().await;
                notifier.close().await;
                if let Err(e) = sink.close().await {
                    warn!(error = %e, "Sink close failed during aborted startup");
                }
                drain.join().await;
                return Err(KanavaError::startup("source", e));
            }
        };

        info!(
            producers = config.producer_workers,
            drain = config.drain_workers,
            notifiers = config.notifier_workers,
            capacity = queue.capacity(),
            topic = %config.topic,
            "Ingress pipeline started"
        );

        Ok(Self {
            core: Orchestrator {
                name: "ingress",
                shutdown,
                cancel,
                source,
                queue,
                workers,
                metrics,
                shutdown_timeout: config.shutdown_timeout,
            },
            gate,
            notifier,
            sink,
            drain,
        })
    }

    /// The hand-off queue
    pub fn queue(&self) -> &Arc<BoundedQueue<Message>> {
        &self.core.queue
    }

    /// The auth gate
    pub fn gate(&self) -> &Arc<AuthGate<A>> {
        &self.gate
    }

    /// True if the source loop returned on its own
    pub fn source_finished(&self) -> bool {
        self.core.source.is_finished()
    }

    /// Ordered shutdown
    pub async fn shutdown(mut self) -> ShutdownReport {
        let mut report = self.core.drain().await;

        // Producers are gone: no more notices or produce calls
        self.notifier.close().await;

        if let Err(e) = self.sink.close().await {
            error!(sink = self.sink.name(), error = %e, "Sink close failed");
            report.sink_error = Some(e);
        }
        self.drain.join().await;

        if let Err(e) = self.gate.authority().close().await {
            warn!(error = %e, "Authority close failed");
        }

        info!(
            abandoned = report.abandoned,
            timed_out = report.timed_out,
            "Ingress pipeline stopped"
        );
        report
    }
}

/// Plugins the loader pipeline runs between
pub struct LoaderPlugins {
    /// Durable log reader
    pub source: Arc<dyn MessageSource>,
    /// Analytical store
    pub sink: Arc<dyn BatchSink<Message>>,
}

/// Running loader pipeline
pub struct LoaderPipeline {
    core: Orchestrator,
    sink: Arc<dyn BatchSink<Message>>,
}

impl LoaderPipeline {
    /// Start every stage, dependencies first
    pub async fn start(
        config: LoaderConfig,
        plugins: LoaderPlugins,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let LoaderPlugins { source, sink } = plugins;

        let queue = Arc::new(BoundedQueue::new(config.queue_capacity));
        let (shutdown, shutdown_rx) = shutdown_channel();
        let (cancel, cancel_rx) = shutdown_channel();

        let mut workers = WorkerSet::new("accumulator");
        spawn_accumulators(
            &mut workers,
            config.workers,
            Arc::clone(&queue),
            Arc::clone(&sink),
            config.batch,
            cancel_rx,
            Arc::clone(&metrics),
        );

        let intake = Arc::new(Intake::new(
            Arc::clone(&queue),
            OverflowPolicy::Block,
            shutdown_rx,
            Arc::clone(&metrics),
        ));
        let source = match SourceLoop::start(Arc::clone(&source), intake).await {
            Ok(source) => source,
            Err(e) => {
                error!(source = source.name(), error = %e, "Source failed to start");
                queue.close();
                workers.join().await;
                if let Err(e) = sink.close().await {
                    warn!(error = %e, "Sink close failed during aborted startup");
                }
                return Err(KanavaError::startup("source", e));
            }
        };

        info!(
            workers = config.workers,
            batch_size = config.batch.max_batch_size,
            flush_interval_ms = config.batch.flush_interval.as_millis() as u64,
            capacity = queue.capacity(),
            "Loader pipeline started"
        );

        Ok(Self {
            core: Orchestrator {
                name: "loader",
                shutdown,
                cancel,
                source,
                queue,
                workers,
                metrics,
                shutdown_timeout: config.shutdown_timeout,
            },
            sink,
        })
    }

    /// The hand-off queue
    pub fn queue(&self) -> &Arc<BoundedQueue<Message>> {
        &self.core.queue
    }

    /// True if the source loop returned on its own
    pub fn source_finished(&self) -> bool {
        self.core.source.is_finished()
    }

    /// Ordered shutdown
    pub async fn shutdown(mut self) -> ShutdownReport {
        let mut report = self.core.drain().await;

        if let Err(e) = self.sink.close().await {
            error!(sink = self.sink.name(), error = %e, "Batch sink close failed");
            report.sink_error = Some(e);
        }

        info!(
            abandoned = report.abandoned,
            timed_out = report.timed_out,
            "Loader pipeline stopped"
        );
        report
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::adapters::{ChannelSource, MemoryLog};
    use crate::auth::LocalAuthority;
    use crate::batch::BatchConfig;
    use crate::telemetry::DeviceReading;
    use async_trait::async_trait;
    use bytes::Bytes;
    use kanava_core::TokenKind;
    use parking_lot::Mutex;
    use prometheus::Registry;

    struct NullPublisher;

    #[async_trait]
    impl Publisher for NullPublisher {
        async fn publish(
            &self,
            _topic: &str,
            _payload: Bytes,
        ) -> std::result::Result<(), PluginError> {
            Ok(())
        }
    }

    /// Batch sink that blocks every flush until released
    struct SlowSink {
        rows: Mutex<Vec<usize>>,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl BatchSink<Message> for SlowSink {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn flush(&self, batch: &[Message]) -> std::result::Result<usize, PluginError> {
            if batch.is_empty() {
                return Ok(0);
            }
            self.release.notified().await;
            self.rows.lock().push(batch.len());
            Ok(batch.len())
        }
    }

    fn ingress_config() -> IngressConfig {
        IngressConfig {
            queue_capacity: 64,
            producer_workers: 2,
            drain_workers: 1,
            notifier_workers: 1,
            notice_capacity: 16,
            auth_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
            topic: "telemetry".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ingress_start_and_clean_shutdown() {
        let authority = Arc::new(LocalAuthority::new());
        let log = MemoryLog::new();
        let metrics = Metrics::register(&Registry::new(), "ingress").unwrap();
        let (source, tx) = ChannelSource::new(16);

        let pipeline = IngressPipeline::start(
            ingress_config(),
            IngressPlugins {
                source: Arc::new(source),
                sink: log.clone(),
                authority: Arc::clone(&authority),
                publisher: Arc::new(NullPublisher),
            },
            Arc::clone(&metrics),
        )
        .await
        .unwrap();
        assert_eq!(metrics.key_fetches.get(), 1, "key warmed up at startup");

        let token = authority
            .issuer()
            .issue(1, TokenKind::Access, Duration::from_secs(60))
            .unwrap();
        for i in 0..10 {
            let reading = DeviceReading {
                id: format!("dev-{i}"),
                latitude: 0.0,
                longitude: 0.0,
                altitude: 0.0,
                battery: 1.0,
                timestamp: 0,
                token: Some(token.clone()),
            };
            tx.send(Message::new("devices/telemetry", reading.encode().unwrap()))
                .await
                .unwrap();
        }
        // Let the source deliver before stopping it
        while metrics.received.get() < 10 {
            tokio::task::yield_now().await;
        }

        let report = pipeline.shutdown().await;
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(log.len("telemetry"), 10);
        assert_eq!(metrics.sent.get(), 10);
    }

    #[tokio::test]
    async fn test_failed_source_connect_is_fatal() {
        let (source, _tx) = ChannelSource::new(1);
        source.fail_connect("no broker");
        let log = MemoryLog::new();

        let err = IngressPipeline::start(
            ingress_config(),
            IngressPlugins {
                source: Arc::new(source),
                sink: log.clone(),
                authority: Arc::new(LocalAuthority::new()),
                publisher: Arc::new(NullPublisher),
            },
            Metrics::register(&Registry::new(), "ingress").unwrap(),
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(err, KanavaError::Startup { component: "source", .. }));
        assert_eq!(err.kind(), kanava_core::FailureKind::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loader_timeout_cancels_and_counts_abandoned() {
        let sink = Arc::new(SlowSink {
            rows: Mutex::new(Vec::new()),
            release: tokio::sync::Notify::new(),
        });
        let metrics = Metrics::register(&Registry::new(), "loader").unwrap();
        let (source, tx) = ChannelSource::new(16);

        let pipeline = LoaderPipeline::start(
            LoaderConfig {
                queue_capacity: 16,
                workers: 1,
                batch: BatchConfig {
                    max_batch_size: 2,
                    flush_interval: Duration::from_secs(60),
                },
                shutdown_timeout: Duration::from_secs(1),
            },
            LoaderPlugins {
                source: Arc::new(source),
                sink: sink.clone(),
            },
            Arc::clone(&metrics),
        )
        .await
        .unwrap();

        for i in 0..6u8 {
            tx.send(Message::new("telemetry", Bytes::from(vec![i])))
                .await
                .unwrap();
        }
        while metrics.received.get() < 6 {
            tokio::task::yield_now().await;
        }

        // The single worker is stuck in its first flush. Release it only
        // after the graceful timeout has expired
        let s = Arc::clone(&sink);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            s.release.notify_one();
        });

        let report = pipeline.shutdown().await;
        assert!(report.timed_out);
        assert_eq!(sink.rows.lock().as_slice(), &[2]);
        assert_eq!(report.abandoned, 4);
        assert_eq!(metrics.dropped(DropReason::Shutdown), 4);
    }
}
