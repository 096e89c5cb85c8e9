//! JSON-lines analytical store
//!
//! Each flushed batch is decoded into [`TelemetryRecord`] rows and appended
//! to a file in one write. Rows that fail to decode are counted as flush
//! errors and skipped; the rest of the batch is still written, and only
//! those rows are reported back as written.

use crate::metrics::Metrics;
use crate::telemetry::TelemetryRecord;
use async_trait::async_trait;
use kanava_core::{BatchSink, Message, PluginError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Append-only JSON-lines store for telemetry rows
pub struct JsonLinesStore {
    path: PathBuf,
    // Serializes appends so concurrent batches never interleave lines
    write_lock: Mutex<()>,
    metrics: Option<Arc<Metrics>>,
}

impl JsonLinesStore {
    /// Store appending to `path` (created on first write)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            metrics: None,
        }
    }

    /// Count rejected rows in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// File backing this store
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every stored row
    pub async fn rows(&self) -> Result<Vec<TelemetryRecord>, PluginError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PluginError::Connection(format!("read store: {e}"))),
        };
        text.lines()
            .filter(|l| !l.is_empty())
            .map(|l| TelemetryRecord::decode(l.as_bytes()))
            .collect()
    }
}

#[async_trait]
impl BatchSink<Message> for JsonLinesStore {
    fn name(&self) -> &'static str {
        "jsonl_store"
    }

    async fn flush(&self, batch: &[Message]) -> Result<usize, PluginError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut buf = Vec::with_capacity(batch.len() * 128);
        let mut written = 0usize;
        let mut rejected = 0u64;
        for msg in batch {
            match TelemetryRecord::decode(&msg.payload) {
                Ok(record) => {
                    if let Err(e) = serde_json::to_writer(&mut buf, &record) {
                        return Err(PluginError::Send(format!("encode row: {e}")));
                    }
                    buf.push(b'\n');
                    written += 1;
                }
                Err(e) => {
                    rejected += 1;
                    warn!(id = %msg.id, error = %e, "Skipping undecodable row");
                }
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.flush_errors.inc_by(rejected);
        }
        if written == 0 {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PluginError::Connection(format!("open {}: {e}", self.path.display())))?;
        file.write_all(&buf)
            .await
            .map_err(|e| PluginError::Send(format!("append rows: {e}")))?;
        file.flush()
            .await
            .map_err(|e| PluginError::Send(format!("append rows: {e}")))?;

        debug!(rows = written, rejected, "Rows appended");
        Ok(written)
    }
}
