//! Sink traits for kanava plugins
//!
//! Two kinds of sink sit at the end of the pipeline:
//!
//! - [`MessageSink`] - asynchronous, fire-and-forget forwarding onto a
//!   durable log. Delivery failures arrive later on an error channel.
//! - [`BatchSink`] - synchronous bulk writes into a store, one call per
//!   accumulated batch.
//!
//! [`Publisher`] is the return path toward devices, used for rejection
//! notices.

use crate::error::PluginError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Receiving half of a sink's asynchronous error channel
pub type ErrorReceiver = mpsc::Receiver<PluginError>;

/// Asynchronous message sink (durable log producer)
///
/// # Implementation Requirements
///
/// - `produce` must not block on network I/O; it hands the payload to the
///   sink's internal buffer and returns.
/// - Delivery failures are reported on the channel returned by
///   [`take_errors`](MessageSink::take_errors). The channel must close once
///   [`close`](MessageSink::close) has flushed everything, so that error
///   consumers can exit.
/// - Implementations must tolerate concurrent `produce` calls from many
///   workers.
///
/// # Example
///
/// ```ignore
/// use kanava_core::{MessageSink, PluginError, ErrorReceiver};
///
/// struct NullSink;
///
/// #[async_trait::async_trait]
/// impl MessageSink for NullSink {
///     fn name(&self) -> &'static str { "null" }
///     fn produce(&self, _topic: &str, _payload: bytes::Bytes) {}
///     fn take_errors(&self) -> Option<ErrorReceiver> { None }
///     async fn close(&self) -> Result<(), PluginError> { Ok(()) }
/// }
/// ```
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Short name for logging and metrics
    fn name(&self) -> &'static str;

    /// Queue a payload for asynchronous delivery to `topic`
    fn produce(&self, topic: &str, payload: Bytes);

    /// Take the asynchronous error channel
    ///
    /// Returns `Some` exactly once; later calls return `None`.
    fn take_errors(&self) -> Option<ErrorReceiver>;

    /// Flush pending deliveries and release resources
    ///
    /// After this returns the error channel is closed.
    async fn close(&self) -> Result<(), PluginError>;
}

/// Synchronous bulk-write sink
///
/// The accumulator calls [`flush`](BatchSink::flush) once per batch and
/// never retries: a returned error is logged and counted, nothing more.
/// Retry policy, if any, belongs inside the implementation.
///
/// Flush metrics count the rows a sink reports as written, not the batch
/// size, so rows a sink skips never show up as flushed.
#[async_trait]
pub trait BatchSink<T>: Send + Sync {
    /// Short name for logging and metrics
    fn name(&self) -> &'static str;

    /// Write a batch, returning how many rows were actually written
    ///
    /// `batch` may be empty (timer flush with nothing accumulated); an
    /// empty batch must be a no-op that returns `Ok(0)`.
    async fn flush(&self, batch: &[T]) -> Result<usize, PluginError>;

    /// Release resources once no more batches will arrive
    async fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Return path toward message originators
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` on `topic`
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PluginError>;
}
