//! Auth-gated forwarding workers
//!
//! [`ProducerLoop`] is the per-item step of the ingress worker pool:
//!
//! ```text
//! dequeue ─► decode ─► authenticate ─► strip credential ─► produce
//!              │            │
//!              ▼            ▼
//!          malformed    auth_failed + rejection notice
//! ```
//!
//! `produce` is fire-and-forget; delivery failures come back on the sink's
//! error channel and are counted by the drain pool ([`spawn_error_drain`]).

use crate::auth::AuthGate;
use crate::metrics::{DropReason, Metrics};
use crate::notify::RejectionNotifier;
use crate::stage::{ItemHandler, WorkerSet};
use crate::telemetry::DeviceReading;
use async_trait::async_trait;
use kanava_core::{CredentialAuthority, ErrorReceiver, Message, MessageSink};
use std::sync::Arc;
use tracing::{debug, error};

/// Per-item handler for the ingress pool
pub struct ProducerLoop<A: CredentialAuthority> {
    gate: Arc<AuthGate<A>>,
    sink: Arc<dyn MessageSink>,
    notifier: Arc<RejectionNotifier>,
    topic: String,
    metrics: Arc<Metrics>,
}

impl<A: CredentialAuthority> ProducerLoop<A> {
    /// Handler that authenticates each reading and produces it to `topic`
    ///
    /// Rejected readings go to `notifier`; nothing is retried.
    pub fn new(
        gate: Arc<AuthGate<A>>,
        sink: Arc<dyn MessageSink>,
        notifier: Arc<RejectionNotifier>,
        topic: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            gate,
            sink,
            notifier,
            topic: topic.into(),
            metrics,
        }
    }

    fn reject(&self, device_id: &str, reason: &str) {
        self.metrics.auth_fail.inc();
        self.metrics.record_dropped(DropReason::AuthFailed);
        self.notifier.notify(device_id, reason);
        debug!(device = device_id, reason, "Reading rejected");
    }
}

#[async_trait]
impl<A: CredentialAuthority + 'static> ItemHandler<Message> for ProducerLoop<A> {
    async fn handle(&self, mut msg: Message) {
        let reading = match DeviceReading::decode(&msg.payload) {
            Ok(reading) => reading,
            Err(e) => {
                self.metrics.record_dropped(DropReason::Malformed);
                debug!(id = %msg.id, error = %e, "Dropping malformed reading");
                return;
            }
        };

        let out_of_band = msg.take_credential();
        let (embedded, record) = reading.into_parts();
        let Some(token) = out_of_band.or(embedded) else {
            self.reject(&record.id, "missing token");
            return;
        };

        if let Err(e) = self.gate.authenticate(&token).await {
            self.reject(&record.id, &e.to_string());
            return;
        }
        self.metrics.auth_success.inc();

        match record.encode() {
            Ok(payload) => {
                self.sink.produce(&self.topic, payload);
                self.metrics.sent.inc();
            }
            Err(e) => {
                self.metrics.record_dropped(DropReason::Malformed);
                error!(id = %msg.id, error = %e, "Failed to encode record");
            }
        }
    }
}

/// Spawn `count` workers counting errors from a sink's error channel
///
/// Workers exit once the channel closes, which happens after the sink's
/// `close` has flushed everything.
pub fn spawn_error_drain(
    set: &mut WorkerSet,
    count: usize,
    errors: ErrorReceiver,
    sink_name: &'static str,
    metrics: Arc<Metrics>,
) {
    let errors = Arc::new(tokio::sync::Mutex::new(errors));
    for _ in 0..count.max(1) {
        let errors = Arc::clone(&errors);
        let metrics = Arc::clone(&metrics);
        set.spawn(async move {
            loop {
                let next = errors.lock().await.recv().await;
                let Some(err) = next else {
                    break;
                };
                metrics.send_errors.inc();
                error!(sink = sink_name, error = %err, kind = %err.kind(), "Sink delivery failed");
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::adapters::MemoryLog;
    use crate::auth::{LocalAuthority, TokenIssuer};
    use crate::telemetry::TelemetryRecord;
    use async_trait::async_trait;
    use bytes::Bytes;
    use kanava_core::{PluginError, Publisher, TokenKind};
    use parking_lot::Mutex;
    use prometheus::Registry;
    use std::time::Duration;

    struct CapturePublisher(Mutex<Vec<String>>);

    #[async_trait]
    impl Publisher for CapturePublisher {
        async fn publish(&self, topic: &str, _payload: Bytes) -> Result<(), PluginError> {
            self.0.lock().push(topic.to_string());
            Ok(())
        }
    }

    struct Harness {
        authority: Arc<LocalAuthority>,
        log: Arc<MemoryLog>,
        publisher: Arc<CapturePublisher>,
        notifier: Arc<RejectionNotifier>,
        metrics: Arc<Metrics>,
        producer: ProducerLoop<LocalAuthority>,
    }

    fn harness() -> Harness {
        let authority = Arc::new(LocalAuthority::new());
        let log = MemoryLog::new();
        let publisher = Arc::new(CapturePublisher(Mutex::new(Vec::new())));
        let metrics = Metrics::register(&Registry::new(), "ingress").unwrap();
        let notifier = Arc::new(RejectionNotifier::start(
            publisher.clone(),
            1,
            16,
            Arc::clone(&metrics),
        ));
        let gate = Arc::new(AuthGate::new(Arc::clone(&authority), Duration::from_secs(2)));
        let producer = ProducerLoop::new(
            gate,
            log.clone(),
            Arc::clone(&notifier),
            "telemetry",
            Arc::clone(&metrics),
        );
        Harness {
            authority,
            log,
            publisher,
            notifier,
            metrics,
            producer,
        }
    }

    fn reading(id: &str, token: Option<String>) -> Message {
        let reading = DeviceReading {
            id: id.to_string(),
            latitude: 1.0,
            longitude: 2.0,
            altitude: 3.0,
            battery: 50.0,
            timestamp: 1_700_000_000,
            token,
        };
        Message::new("devices/telemetry", reading.encode().unwrap())
    }

    fn token(issuer: &TokenIssuer) -> String {
        issuer
            .issue(1, TokenKind::Access, Duration::from_secs(60))
            .unwrap()
    }

    #[tokio::test]
    async fn test_valid_reading_forwarded_without_token() {
        let h = harness();
        let token = token(&h.authority.issuer());

        h.producer.handle(reading("dev-1", Some(token))).await;
        h.log.close().await.unwrap();

        let records = h.log.records("telemetry");
        assert_eq!(records.len(), 1);
        let record = TelemetryRecord::decode(&records[0]).unwrap();
        assert_eq!(record.id, "dev-1");
        assert!(!std::str::from_utf8(&records[0]).unwrap().contains("token"));
        assert_eq!(h.metrics.auth_success.get(), 1);
        assert_eq!(h.metrics.sent.get(), 1);
    }

    #[tokio::test]
    async fn test_out_of_band_credential_takes_precedence() {
        let h = harness();
        let good = token(&h.authority.issuer());

        let msg = reading("dev-1", Some("garbage".to_string())).with_credential(good);
        h.producer.handle(msg).await;

        assert_eq!(h.metrics.auth_success.get(), 1);
    }

    #[tokio::test]
    async fn test_rejected_reading_notifies_device() {
        let h = harness();
        let stranger = TokenIssuer::generate();

        h.producer
            .handle(reading("dev-7", Some(token(&stranger))))
            .await;
        h.producer.handle(reading("dev-8", None)).await;
        h.notifier.close().await;
        h.log.close().await.unwrap();

        assert_eq!(h.metrics.auth_fail.get(), 2);
        assert_eq!(h.metrics.dropped(DropReason::AuthFailed), 2);
        assert_eq!(h.log.len("telemetry"), 0);
        let mut topics = h.publisher.0.lock().clone();
        topics.sort();
        assert_eq!(
            topics,
            ["devices/dev-7/auth_response", "devices/dev-8/auth_response"]
        );
    }

    #[tokio::test]
    async fn test_malformed_payload_dropped() {
        let h = harness();

        h.producer
            .handle(Message::new("devices/telemetry", Bytes::from_static(b"nope")))
            .await;

        assert_eq!(h.metrics.dropped(DropReason::Malformed), 1);
        assert_eq!(h.metrics.auth_fail.get(), 0);
        assert_eq!(h.authority.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_error_drain_counts_until_channel_closes() {
        let h = harness();
        let errors = h.log.take_errors().unwrap();
        let mut drain = WorkerSet::new("drain");
        spawn_error_drain(&mut drain, 2, errors, "memory_log", Arc::clone(&h.metrics));

        h.log.set_failing(true);
        let token = token(&h.authority.issuer());
        for _ in 0..3 {
            h.producer.handle(reading("dev-1", Some(token.clone()))).await;
        }
        h.log.close().await.unwrap();
        drain.join().await;

        assert_eq!(h.metrics.sent.get(), 3);
        assert_eq!(h.metrics.send_errors.get(), 3);
    }
}
