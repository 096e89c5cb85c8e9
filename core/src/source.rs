//! Source traits for kanava plugins

use crate::error::PluginError;
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;

/// Callback a source invokes once per delivered message
///
/// The handler may await (for sources that accept backpressure), but the
/// pipeline's drop-on-full handler returns without suspending.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Hand one message to the pipeline
    async fn handle(&self, msg: Message);
}

/// Inbound transport
///
/// `run` blocks until the source is stopped or hits a terminal transport
/// error, calling the handler at least once per delivered message. `stop`
/// releases transport resources and makes a pending `run` return.
///
/// No ordering guarantee is required across distinct partitions.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Establish the transport before delivery starts
    ///
    /// An error here is treated as fatal: the pipeline refuses to start.
    async fn connect(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Deliver messages to `handler` until stopped
    async fn run(&self, handler: Arc<dyn MessageHandler>) -> Result<(), PluginError>;

    /// Stop delivery and release the transport
    async fn stop(&self) -> Result<(), PluginError>;
}
