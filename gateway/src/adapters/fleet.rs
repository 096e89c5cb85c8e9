//! Simulated device fleet
//!
//! Each simulated device holds an access token from a [`LocalAuthority`]
//! and publishes a jittered location/battery reading on every tick. The
//! fleet is also the return path: when a rejection notice arrives on
//! `devices/<id>/auth_response`, that device fetches a fresh token, as a
//! real device would after its token was refused.

use crate::auth::LocalAuthority;
use crate::auth::token::unix_now;
use crate::telemetry::DeviceReading;
use async_trait::async_trait;
use bytes::Bytes;
use kanava_core::{Message, MessageHandler, MessageSource, PluginError, Publisher, TokenKind};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Fleet settings
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Number of devices
    pub devices: usize,
    /// Time between readings from each device
    pub interval: Duration,
    /// Topic readings are published on
    pub topic: String,
    /// Lifetime of issued access tokens
    pub token_ttl: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            devices: 10,
            interval: Duration::from_millis(100),
            topic: "devices/telemetry".to_string(),
            token_ttl: Duration::from_secs(15 * 60),
        }
    }
}

struct Device {
    id: String,
    sub: u64,
    token: RwLock<String>,
}

/// Simulated devices publishing signed readings
pub struct SimulatedFleet {
    authority: Arc<LocalAuthority>,
    devices: Vec<Device>,
    config: FleetConfig,
    stop_tx: watch::Sender<bool>,
    published: AtomicU64,
    refreshes: AtomicU64,
}

impl SimulatedFleet {
    /// Create the fleet and log every device in
    pub fn new(authority: Arc<LocalAuthority>, config: FleetConfig) -> Result<Self, PluginError> {
        let issuer = authority.issuer();
        let devices = (0..config.devices)
            .map(|n| {
                let sub = n as u64 + 1;
                let token = issuer.issue(sub, TokenKind::Access, config.token_ttl)?;
                Ok(Device {
                    id: format!("device-{sub}"),
                    sub,
                    token: RwLock::new(token),
                })
            })
            .collect::<Result<Vec<_>, PluginError>>()?;
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            authority,
            devices,
            config,
            stop_tx,
            published: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
        })
    }

    /// Device identifiers
    pub fn device_ids(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.id.clone()).collect()
    }

    /// Replace a device's token (e.g. with a stale one)
    pub fn set_token(&self, device_id: &str, token: String) -> bool {
        match self.device(device_id) {
            Some(device) => {
                *device.token.write() = token;
                true
            }
            None => false,
        }
    }

    /// A device's current token
    pub fn token(&self, device_id: &str) -> Option<String> {
        self.device(device_id).map(|d| d.token.read().clone())
    }

    /// Readings published so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Token refreshes triggered by rejection notices
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn device(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    fn reading(&self, device: &Device) -> Result<Bytes, PluginError> {
        let mut rng = rand::thread_rng();
        DeviceReading {
            id: device.id.clone(),
            latitude: 55.7 + rng.gen_range(-0.05..0.05),
            longitude: 37.6 + rng.gen_range(-0.05..0.05),
            altitude: 120.0 + rng.gen_range(-5.0..5.0),
            battery: rng.gen_range(20.0..100.0),
            timestamp: unix_now(),
            token: Some(device.token.read().clone()),
        }
        .encode()
    }

    /// Publish one round of readings, one per device
    pub async fn publish_round(&self, handler: &dyn MessageHandler) {
        for device in &self.devices {
            match self.reading(device) {
                Ok(payload) => {
                    handler
                        .handle(Message::new(self.config.topic.clone(), payload))
                        .await;
                    self.published.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(device = %device.id, error = %e, "Failed to encode reading"),
            }
        }
    }

    fn refresh_token(&self, device: &Device) -> Result<(), PluginError> {
        let token = self
            .authority
            .issuer()
            .issue(device.sub, TokenKind::Access, self.config.token_ttl)?;
        *device.token.write() = token;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl MessageSource for SimulatedFleet {
    fn name(&self) -> &'static str {
        "simulated_fleet"
    }

    async fn run(&self, handler: Arc<dyn MessageHandler>) -> Result<(), PluginError> {
        let mut stop = self.stop_tx.subscribe();
        if *stop.borrow_and_update() {
            return Ok(());
        }

        info!(
            devices = self.devices.len(),
            interval_ms = self.config.interval.as_millis() as u64,
            "Fleet publishing"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => return Ok(()),
                _ = ticker.tick() => self.publish_round(handler.as_ref()).await,
            }
        }
    }

    async fn stop(&self) -> Result<(), PluginError> {
        self.stop_tx.send_replace(true);
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct AuthResponse {
    error: String,
}

#[async_trait]
impl Publisher for SimulatedFleet {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PluginError> {
        let Some(device_id) = topic
            .strip_prefix("devices/")
            .and_then(|rest| rest.strip_suffix("/auth_response"))
        else {
            debug!(topic, "Fleet ignoring publish on unrelated topic");
            return Ok(());
        };
        let Some(device) = self.device(device_id) else {
            return Err(PluginError::Send(format!("no such device '{device_id}'")));
        };

        let response: AuthResponse = serde_json::from_slice(&payload)
            .map_err(|e| PluginError::Decode(format!("invalid auth response: {e}")))?;
        info!(device = device_id, reason = %response.error, "Device token refused, refreshing");
        self.refresh_token(device)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Collect(Mutex<Vec<Message>>);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle(&self, msg: Message) {
            self.0.lock().push(msg);
        }
    }

    fn fleet(devices: usize) -> (Arc<LocalAuthority>, SimulatedFleet) {
        let authority = Arc::new(LocalAuthority::new());
        let fleet = SimulatedFleet::new(
            Arc::clone(&authority),
            FleetConfig {
                devices,
                ..FleetConfig::default()
            },
        )
        .unwrap();
        (authority, fleet)
    }

    #[tokio::test]
    async fn test_round_publishes_signed_reading_per_device() {
        let (authority, fleet) = fleet(3);
        let sink = Collect(Mutex::new(Vec::new()));

        fleet.publish_round(&sink).await;

        let messages = sink.0.lock();
        assert_eq!(messages.len(), 3);
        for msg in messages.iter() {
            assert_eq!(msg.source, "devices/telemetry");
            let reading = DeviceReading::decode(&msg.payload).unwrap();
            let claims = authority.issuer().parse(reading.token.as_deref().unwrap()).unwrap();
            assert_eq!(format!("device-{}", claims.sub), reading.id);
        }
        assert_eq!(fleet.published(), 3);
    }

    #[tokio::test]
    async fn test_rejection_notice_refreshes_token() {
        let (authority, fleet) = fleet(1);
        authority.rotate();
        let stale = fleet.token("device-1").unwrap();
        assert!(authority.issuer().parse(&stale).is_err());

        fleet
            .publish(
                "devices/device-1/auth_response",
                Bytes::from_static(br#"{"error":"invalid token signature"}"#),
            )
            .await
            .unwrap();

        let fresh = fleet.token("device-1").unwrap();
        assert!(authority.issuer().parse(&fresh).is_ok());
        assert_eq!(fleet.refreshes(), 1);
    }

    #[tokio::test]
    async fn test_notice_for_unknown_device_fails() {
        let (_authority, fleet) = fleet(1);
        let err = fleet
            .publish("devices/ghost/auth_response", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Send(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_stopped() {
        let (_authority, fleet) = fleet(2);
        let fleet = Arc::new(fleet);
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));

        let f = Arc::clone(&fleet);
        let s = Arc::clone(&sink);
        let task = tokio::spawn(async move { f.run(s).await });

        // First tick is immediate, then one per 100ms
        tokio::time::sleep(Duration::from_millis(250)).await;
        fleet.stop().await.unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(sink.0.lock().len(), 6);
    }
}
