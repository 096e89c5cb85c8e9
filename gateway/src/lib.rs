//! kanava - concurrent telemetry ingestion pipelines
//!
//! Devices publish signed readings; the ingress pipeline authenticates and
//! forwards them onto a durable log; the loader pipeline batches them into
//! an analytical store.
//!
//! ```text
//! Ingress:  source ─► BoundedQueue ─► producers ─► AuthGate ─► message sink
//!                                          └─► rejection notices
//! Loader:   log reader ─► BoundedQueue ─► accumulators ─► batch sink
//! ```
//!
//! Transports and stores plug in through the traits in `kanava-core`;
//! in-process implementations live in [`adapters`].

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod adapters;
pub mod auth;
pub mod batch;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod metrics_server;
pub mod notify;
pub mod producer;
pub mod queue;
pub mod source;
pub mod stage;
pub mod telemetry;

pub use auth::{AuthGate, KeySnapshot, LocalAuthority, TokenIssuer};
pub use batch::BatchConfig;
pub use config::{Config, IngressConfig, LoaderConfig, LogFormat};
pub use error::{FailureKind, KanavaError, PluginError, Result};
pub use lifecycle::{IngressPipeline, IngressPlugins, LoaderPipeline, LoaderPlugins, ShutdownReport};
pub use metrics::{DropReason, Metrics};
pub use metrics_server::MetricsServer;
pub use queue::{BoundedQueue, PushError};
pub use source::{Intake, OverflowPolicy, SourceLoop};
pub use stage::{ItemHandler, Shutdown, ShutdownTrigger, WorkerSet};
pub use telemetry::{DeviceReading, TelemetryRecord};

pub use kanava_core::{
    BatchSink, Claims, CredentialAuthority, Message, MessageHandler, MessageId, MessageSink,
    MessageSource, Publisher, TokenKind,
};
