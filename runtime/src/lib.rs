//! kanava runtime: process wiring for the telemetry pipelines
//!
//! Provides [`run()`] for the demo deployment, and [`RuntimeBuilder`] for
//! callers that need control over configuration or the metrics server.
//!
//! The demo wires both pipelines end to end:
//!
//! ```text
//! SimulatedFleet ─► IngressPipeline ─► MemoryLog ─► LoaderPipeline ─► JsonLinesStore
//!       ▲                  │
//!       └── notices ───────┘
//! ```
//!
//! # Quick start
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     kanava_runtime::run().await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

use kanava_gateway::adapters::{FleetConfig, JsonLinesStore, MemoryLog, SimulatedFleet};
use kanava_gateway::{
    Config, IngressPipeline, IngressPlugins, LoaderPipeline, LoaderPlugins, LocalAuthority,
    LogFormat, Metrics, MetricsServer, ShutdownReport,
};
use prometheus::Registry;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Consumer group the loader reads the log as
pub const LOADER_GROUP: &str = "loader";

/// Run the demo deployment with configuration from the environment.
///
/// Initialises tracing and the metrics server, starts both pipelines, and
/// blocks until SIGINT or SIGTERM.
pub async fn run() -> anyhow::Result<()> {
    RuntimeBuilder::new().run().await
}

/// Combined outcome of stopping both pipelines
#[derive(Debug, Default)]
pub struct RuntimeReport {
    pub ingress: ShutdownReport,
    pub loader: ShutdownReport,
}

impl RuntimeReport {
    pub fn is_clean(&self) -> bool {
        self.ingress.is_clean() && self.loader.is_clean()
    }
}

/// Both pipelines and the plugins connecting them
pub struct Runtime {
    ingress: IngressPipeline<LocalAuthority>,
    loader: LoaderPipeline,
    fleet: Arc<SimulatedFleet>,
    log: Arc<MemoryLog>,
    store: Arc<JsonLinesStore>,
    log_topic: String,
    drain_timeout: Duration,
}

impl Runtime {
    /// Start ingress and loader, registering their metrics on `registry`
    pub async fn start(config: &Config, registry: &Registry) -> anyhow::Result<Self> {
        let ingress_metrics = Metrics::register(registry, "ingress")?;
        let loader_metrics = Metrics::register(registry, "loader")?;

        let authority = Arc::new(LocalAuthority::new());
        let fleet = Arc::new(SimulatedFleet::new(
            Arc::clone(&authority),
            FleetConfig {
                devices: config.devices,
                interval: config.publish_interval,
                topic: config.telemetry_topic.clone(),
                ..FleetConfig::default()
            },
        )?);
        let log = MemoryLog::with_topics([config.log_topic.clone()]);
        let store = Arc::new(
            JsonLinesStore::new(config.store_path.clone())
                .with_metrics(Arc::clone(&loader_metrics)),
        );

        let ingress = IngressPipeline::start(
            config.ingress(),
            IngressPlugins {
                source: fleet.clone(),
                sink: log.clone(),
                authority,
                publisher: fleet.clone(),
            },
            ingress_metrics,
        )
        .await?;

        let loader = match LoaderPipeline::start(
            config.loader(),
            LoaderPlugins {
                source: Arc::new(log.reader(&config.log_topic, LOADER_GROUP)),
                sink: store.clone(),
            },
            loader_metrics,
        )
        .await
        {
            Ok(loader) => loader,
            Err(e) => {
                ingress.shutdown().await;
                return Err(e.into());
            }
        };

        info!(
            devices = config.devices,
            topic = %config.log_topic,
            store = %config.store_path.display(),
            "Pipelines running"
        );

        Ok(Self {
            ingress,
            loader,
            fleet,
            log,
            store,
            log_topic: config.log_topic.clone(),
            drain_timeout: config.shutdown_timeout,
        })
    }

    pub fn fleet(&self) -> &Arc<SimulatedFleet> {
        &self.fleet
    }

    pub fn log(&self) -> &Arc<MemoryLog> {
        &self.log
    }

    pub fn store(&self) -> &Arc<JsonLinesStore> {
        &self.store
    }

    /// Stop ingress, let the loader catch up with the log, then stop it
    pub async fn shutdown(self) -> RuntimeReport {
        let ingress = self.ingress.shutdown().await;

        let deadline = Instant::now() + self.drain_timeout;
        while self.log.committed(LOADER_GROUP, &self.log_topic) < self.log.len(&self.log_topic) {
            if Instant::now() >= deadline {
                warn!(
                    committed = self.log.committed(LOADER_GROUP, &self.log_topic),
                    logged = self.log.len(&self.log_topic),
                    "Loader did not catch up with the log before shutdown"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let loader = self.loader.shutdown().await;
        RuntimeReport { ingress, loader }
    }
}

/// Builder for controlling runtime behaviour.
///
/// # Example
///
/// ```ignore
/// RuntimeBuilder::new()
///     .metrics_addr("127.0.0.1:9100".parse()?)
///     .run()
///     .await
/// ```
pub struct RuntimeBuilder {
    config: Option<Config>,
    metrics_addr: Option<SocketAddr>,
    metrics_enabled: bool,
}

impl RuntimeBuilder {
    /// Create a new builder; configuration is read from the environment
    /// unless [`config`](Self::config) is given.
    pub fn new() -> Self {
        Self {
            config: None,
            metrics_addr: None,
            metrics_enabled: true,
        }
    }

    /// Use `config` instead of `KANAVA_*` variables
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the metrics HTTP server address.
    ///
    /// Default: `KANAVA_METRICS_ADDR`, or `0.0.0.0:2112`.
    pub fn metrics_addr(mut self, addr: SocketAddr) -> Self {
        self.metrics_addr = Some(addr);
        self
    }

    /// Do not serve `/metrics` and `/health`
    pub fn disable_metrics_server(mut self) -> Self {
        self.metrics_enabled = false;
        self
    }

    /// Initialise tracing and run until SIGINT or SIGTERM.
    ///
    /// This is the terminal method; it blocks until shutdown.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let config = match self.config.take() {
            Some(config) => config,
            None => Config::from_env()?,
        };
        init_tracing(&config);

        let report = self.config(config).run_until(shutdown_signal()).await?;
        if !report.is_clean() {
            warn!(?report, "Shutdown was not clean");
        }
        info!("kanava shutdown complete");
        Ok(())
    }

    /// Run until `signal` resolves, without touching global tracing state
    pub async fn run_until<F>(self, signal: F) -> anyhow::Result<RuntimeReport>
    where
        F: Future<Output = ()>,
    {
        let config = match self.config {
            Some(config) => config,
            None => Config::from_env()?,
        };
        config.validate()?;

        let registry = Arc::new(Registry::new());
        let metrics_handle = if self.metrics_enabled {
            let addr = self.metrics_addr.unwrap_or(config.metrics_addr);
            Some(MetricsServer::start(addr, Arc::clone(&registry)))
        } else {
            None
        };

        let result = Runtime::start(&config, &registry).await;
        let runtime = match result {
            Ok(runtime) => runtime,
            Err(e) => {
                if let Some(handle) = metrics_handle {
                    handle.abort();
                }
                return Err(e);
            }
        };

        signal.await;
        let report = runtime.shutdown().await;

        if let Some(handle) = metrics_handle {
            handle.abort();
        }
        Ok(report)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialise the tracing subscriber based on config.
///
/// `RUST_LOG` wins over `KANAVA_LOG_LEVEL` when set.
pub fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.log_format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn demo_config(dir: &tempfile::TempDir) -> Config {
        Config {
            producer_workers: 2,
            loader_workers: 2,
            batch_size: 8,
            flush_interval: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
            store_path: dir.path().join("telemetry.jsonl"),
            devices: 3,
            publish_interval: Duration::from_millis(10),
            ..Config::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_runtime_moves_every_logged_reading_into_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = demo_config(&dir);
        let registry = Registry::new();

        let runtime = Runtime::start(&config, &registry).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let log = Arc::clone(runtime.log());
        let store = Arc::clone(runtime.store());
        let fleet = Arc::clone(runtime.fleet());
        let report = runtime.shutdown().await;

        assert!(report.is_clean(), "{report:?}");
        let logged = log.len(&config.log_topic);
        assert!(logged > 0);
        assert_eq!(logged as u64, fleet.published());
        assert_eq!(store.rows().await.unwrap().len(), logged);
        assert_eq!(log.committed(LOADER_GROUP, &config.log_topic), logged);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_metrics_registered_under_both_subsystems() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let runtime = Runtime::start(&demo_config(&dir), &registry).await.unwrap();

        let text = kanava_gateway::metrics::gather(&registry);
        assert!(text.contains("kanava_ingress_received_total"));
        assert!(text.contains("kanava_loader_received_total"));

        runtime.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_until_stops_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        let report = RuntimeBuilder::new()
            .config(demo_config(&dir))
            .disable_metrics_server()
            .run_until(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(report.is_clean(), "{report:?}");
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_starting() {
        let config = Config {
            batch_size: 0,
            ..Config::default()
        };
        let err = RuntimeBuilder::new()
            .config(config)
            .disable_metrics_server()
            .run_until(std::future::ready(()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("KANAVA_BATCH_SIZE"));
    }
}
