//! Error types for kanava plugins

use thiserror::Error;

/// Error type for plugin operations
///
/// The standard error used across the plugin boundary: sources, sinks,
/// credential authorities and publishers all report failures with it.
/// Every variant maps onto a [`FailureKind`] so the pipeline can count and
/// log an outcome without inspecting messages.
///
/// # Example
///
/// ```
/// use kanava_core::{FailureKind, PluginError};
///
/// let err = PluginError::Connection("broker refused".to_string());
/// assert_eq!(err.kind(), FailureKind::Transient);
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// Initialization failed
    ///
    /// A plugin could not be brought up: bad configuration, unreachable
    /// broker at startup, missing key material.
    #[error("initialization failed: {0}")]
    Init(String),

    /// Payload could not be decoded
    #[error("decode failed: {0}")]
    Decode(String),

    /// Credential rejected
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Send failed
    ///
    /// A sink or publisher could not deliver. Examples: broker timeout,
    /// write error, partition unavailable.
    #[error("send failed: {0}")]
    Send(String),

    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// Plugin used before it is ready or after it was closed
    #[error("plugin not ready")]
    NotReady,

    /// Shutdown error
    ///
    /// Examples: failed to flush buffers, timeout waiting for pending writes.
    #[error("shutdown error: {0}")]
    Shutdown(String),
}

impl PluginError {
    /// Classify this error for metrics and logging
    pub fn kind(&self) -> FailureKind {
        match self {
            PluginError::Init(_) => FailureKind::Fatal,
            PluginError::Decode(_) => FailureKind::Malformed,
            PluginError::Auth(_) => FailureKind::AuthFailure,
            PluginError::Send(_)
            | PluginError::Connection(_)
            | PluginError::Timeout(_)
            | PluginError::NotReady
            | PluginError::Shutdown(_) => FailureKind::Transient,
        }
    }
}

/// Outcome classification attached to a dropped or failed item
///
/// Pure observation: the pipeline records the kind and moves on, it never
/// changes control flow based on it inside a hot loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Network or broker unavailable; retried by the source/sink layer
    Transient,
    /// Payload failed to decode
    Malformed,
    /// Credential invalid after the single key-refresh retry
    AuthFailure,
    /// Queue full, item dropped
    Overflow,
    /// Cannot establish a source/sink at startup
    Fatal,
}

impl FailureKind {
    /// Label used for metrics and structured logs
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Malformed => "malformed",
            FailureKind::AuthFailure => "auth_failure",
            FailureKind::Overflow => "overflow",
            FailureKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
