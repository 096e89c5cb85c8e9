//! Channel-fed source for embedding and tests

use async_trait::async_trait;
use kanava_core::{Message, MessageHandler, MessageSource, PluginError};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Source that delivers whatever is sent on its paired channel
///
/// `run` returns when `stop` is called or every sender is dropped. The
/// receiver is dropped when `run` returns, so later sends fail.
pub struct ChannelSource {
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
    stop_tx: watch::Sender<bool>,
    connect_error: Mutex<Option<String>>,
}

impl ChannelSource {
    /// Source plus the sender feeding it
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop_tx, _) = watch::channel(false);
        (
            Self {
                rx: Mutex::new(Some(rx)),
                stop_tx,
                connect_error: Mutex::new(None),
            },
            tx,
        )
    }

    /// Make `connect` fail with a connection error
    pub fn fail_connect(&self, reason: &str) {
        *self.connect_error.lock() = Some(reason.to_string());
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn connect(&self) -> Result<(), PluginError> {
        match self.connect_error.lock().clone() {
            Some(reason) => Err(PluginError::Connection(reason)),
            None => Ok(()),
        }
    }

    async fn run(&self, handler: Arc<dyn MessageHandler>) -> Result<(), PluginError> {
        let mut rx = self.rx.lock().take().ok_or(PluginError::NotReady)?;
        let mut stop = self.stop_tx.subscribe();
        if *stop.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => return Ok(()),
                msg = rx.recv() => match msg {
                    Some(msg) => handler.handle(msg).await,
                    None => return Ok(()),
                },
            }
        }
    }

    async fn stop(&self) -> Result<(), PluginError> {
        self.stop_tx.send_replace(true);
        Ok(())
    }
}
