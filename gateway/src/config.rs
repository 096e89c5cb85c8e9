//! Configuration for kanava
//!
//! All settings come from `KANAVA_*` environment variables, optionally
//! seeded from a `.env` file. Every variable has a default, so an empty
//! environment yields a runnable demo configuration.
//!
//! | Variable                      | Default              |
//! |-------------------------------|----------------------|
//! | `KANAVA_QUEUE_CAPACITY`       | 10000                |
//! | `KANAVA_PRODUCER_WORKERS`     | 2 × CPUs             |
//! | `KANAVA_DRAIN_WORKERS`        | 1                    |
//! | `KANAVA_NOTIFIER_WORKERS`     | 5                    |
//! | `KANAVA_LOADER_WORKERS`       | 2 × CPUs             |
//! | `KANAVA_BATCH_SIZE`           | 1000                 |
//! | `KANAVA_FLUSH_INTERVAL_MS`    | 1000                 |
//! | `KANAVA_AUTH_TIMEOUT_MS`      | 2000                 |
//! | `KANAVA_SHUTDOWN_TIMEOUT_MS`  | 10000                |
//! | `KANAVA_TELEMETRY_TOPIC`      | `devices/telemetry`  |
//! | `KANAVA_LOG_TOPIC`            | `telemetry`          |
//! | `KANAVA_METRICS_ADDR`         | `0.0.0.0:2112`       |
//! | `KANAVA_LOG_LEVEL`            | `info`               |
//! | `KANAVA_LOG_FORMAT`           | `pretty`             |
//! | `KANAVA_STORE_PATH`           | `telemetry.jsonl`    |
//! | `KANAVA_DEVICES`              | 10                   |
//! | `KANAVA_PUBLISH_INTERVAL_MS`  | 100                  |

use crate::batch::BatchConfig;
use crate::error::{KanavaError, Result};
use crate::notify::DEFAULT_NOTICE_CAPACITY;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON lines
    Json,
    /// Human-readable
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = KanavaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(KanavaError::Config(format!(
                "KANAVA_LOG_FORMAT must be 'json' or 'pretty', got '{other}'"
            ))),
        }
    }
}

/// Ingress pipeline settings
#[derive(Debug, Clone)]
pub struct IngressConfig {
    pub queue_capacity: usize,
    pub producer_workers: usize,
    pub drain_workers: usize,
    pub notifier_workers: usize,
    pub notice_capacity: usize,
    pub auth_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Log topic authenticated records are produced to
    pub topic: String,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Config::default().ingress()
    }
}

/// Loader pipeline settings
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub queue_capacity: usize,
    pub workers: usize,
    pub batch: BatchConfig,
    pub shutdown_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Config::default().loader()
    }
}

/// Full process configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub queue_capacity: usize,
    pub producer_workers: usize,
    pub drain_workers: usize,
    pub notifier_workers: usize,
    pub loader_workers: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub auth_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Topic devices publish readings on
    pub telemetry_topic: String,
    /// Durable log topic between ingress and loader
    pub log_topic: String,
    pub metrics_addr: SocketAddr,
    pub log_level: String,
    pub log_format: LogFormat,
    pub store_path: PathBuf,
    /// Simulated devices in the demo
    pub devices: usize,
    pub publish_interval: Duration,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            producer_workers: default_workers(),
            drain_workers: 1,
            notifier_workers: 5,
            loader_workers: default_workers(),
            batch_size: 1000,
            flush_interval: Duration::from_millis(1000),
            auth_timeout: Duration::from_millis(2000),
            shutdown_timeout: Duration::from_millis(10_000),
            telemetry_topic: "devices/telemetry".to_string(),
            log_topic: "telemetry".to_string(),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 2112)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            store_path: PathBuf::from("telemetry.jsonl"),
            devices: 10,
            publish_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Load from the process environment (after reading `.env`, if any)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Config::default();
        let config = Self {
            queue_capacity: parse(&lookup, "KANAVA_QUEUE_CAPACITY", d.queue_capacity)?,
            producer_workers: parse(&lookup, "KANAVA_PRODUCER_WORKERS", d.producer_workers)?,
            drain_workers: parse(&lookup, "KANAVA_DRAIN_WORKERS", d.drain_workers)?,
            notifier_workers: parse(&lookup, "KANAVA_NOTIFIER_WORKERS", d.notifier_workers)?,
            loader_workers: parse(&lookup, "KANAVA_LOADER_WORKERS", d.loader_workers)?,
            batch_size: parse(&lookup, "KANAVA_BATCH_SIZE", d.batch_size)?,
            flush_interval: millis(&lookup, "KANAVA_FLUSH_INTERVAL_MS", d.flush_interval)?,
            auth_timeout: millis(&lookup, "KANAVA_AUTH_TIMEOUT_MS", d.auth_timeout)?,
            shutdown_timeout: millis(&lookup, "KANAVA_SHUTDOWN_TIMEOUT_MS", d.shutdown_timeout)?,
            telemetry_topic: lookup("KANAVA_TELEMETRY_TOPIC").unwrap_or(d.telemetry_topic),
            log_topic: lookup("KANAVA_LOG_TOPIC").unwrap_or(d.log_topic),
            metrics_addr: parse(&lookup, "KANAVA_METRICS_ADDR", d.metrics_addr)?,
            log_level: lookup("KANAVA_LOG_LEVEL").unwrap_or(d.log_level),
            log_format: match lookup("KANAVA_LOG_FORMAT") {
                Some(s) => s.parse()?,
                None => d.log_format,
            },
            store_path: lookup("KANAVA_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.store_path),
            devices: parse(&lookup, "KANAVA_DEVICES", d.devices)?,
            publish_interval: millis(&lookup, "KANAVA_PUBLISH_INTERVAL_MS", d.publish_interval)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipelines cannot run with
    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("KANAVA_QUEUE_CAPACITY", self.queue_capacity),
            ("KANAVA_PRODUCER_WORKERS", self.producer_workers),
            ("KANAVA_DRAIN_WORKERS", self.drain_workers),
            ("KANAVA_NOTIFIER_WORKERS", self.notifier_workers),
            ("KANAVA_LOADER_WORKERS", self.loader_workers),
            ("KANAVA_BATCH_SIZE", self.batch_size),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(KanavaError::Config(format!("{name} must be greater than 0")));
            }
        }

        let durations = [
            ("KANAVA_FLUSH_INTERVAL_MS", self.flush_interval),
            ("KANAVA_AUTH_TIMEOUT_MS", self.auth_timeout),
            ("KANAVA_SHUTDOWN_TIMEOUT_MS", self.shutdown_timeout),
            ("KANAVA_PUBLISH_INTERVAL_MS", self.publish_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(KanavaError::Config(format!("{name} must be greater than 0")));
            }
        }

        if self.log_topic.is_empty() {
            return Err(KanavaError::Config("KANAVA_LOG_TOPIC must not be empty".into()));
        }
        Ok(())
    }

    /// Settings for the ingress pipeline
    pub fn ingress(&self) -> IngressConfig {
        IngressConfig {
            queue_capacity: self.queue_capacity,
            producer_workers: self.producer_workers,
            drain_workers: self.drain_workers,
            notifier_workers: self.notifier_workers,
            notice_capacity: DEFAULT_NOTICE_CAPACITY,
            auth_timeout: self.auth_timeout,
            shutdown_timeout: self.shutdown_timeout,
            topic: self.log_topic.clone(),
        }
    }

    /// Settings for the loader pipeline
    pub fn loader(&self) -> LoaderConfig {
        LoaderConfig {
            queue_capacity: self.queue_capacity,
            workers: self.loader_workers,
            batch: BatchConfig {
                max_batch_size: self.batch_size,
                flush_interval: self.flush_interval,
            },
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| KanavaError::Config(format!("invalid {key} '{raw}': {e}"))),
        None => Ok(default),
    }
}

fn millis<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}
