//! kanava-core - Core types for the kanava telemetry pipeline
//!
//! This crate holds the types shared between the pipeline and the plugins
//! that connect it to the outside world:
//!
//! - [`Message`] - the pipeline envelope (zero-copy payload, optional credential)
//! - [`MessageSource`] / [`MessageHandler`] - inbound transports
//! - [`MessageSink`], [`BatchSink`], [`Publisher`] - outbound paths
//! - [`CredentialAuthority`] - signed-token verification
//! - [`PluginError`] / [`FailureKind`] - plugin errors and their classification
//!
//! Transport adapters (brokers, stores, auth services) depend on this crate
//! only, so they never pull in the pipeline runtime.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

mod credential;
mod error;
/// The pipeline message envelope
pub mod message;
mod sink;
mod source;

pub use credential::{Claims, CredentialAuthority, TokenKind};
pub use error::{FailureKind, PluginError};
pub use message::{Message, MessageId};
pub use sink::{BatchSink, ErrorReceiver, MessageSink, Publisher};
pub use source::{MessageHandler, MessageSource};
