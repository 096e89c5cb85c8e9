//! In-process topic log
//!
//! [`MemoryLog`] stands in for a durable broker. Producers append through
//! the [`MessageSink`] interface: `produce` hands the record to a writer
//! task and returns, and delivery failures come back on the error channel.
//! Consumers read through [`LogReader`], a [`MessageSource`] that tracks a
//! committed offset per consumer group, so a restarted reader in the same
//! group resumes where the last one stopped.

use async_trait::async_trait;
use bytes::Bytes;
use kanava_core::{ErrorReceiver, Message, MessageHandler, MessageSink, MessageSource, PluginError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const DEFAULT_BUFFER: usize = 4096;
const ERROR_BUFFER: usize = 256;

#[derive(Default)]
struct Topic {
    records: RwLock<Vec<Bytes>>,
    appended: Notify,
}

#[derive(Default)]
struct LogState {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    /// Committed offsets keyed by (group, topic)
    offsets: Mutex<HashMap<(String, String), usize>>,
    failing: AtomicBool,
}

impl LogState {
    fn topic(&self, name: &str) -> Arc<Topic> {
        if let Some(topic) = self.topics.read().get(name) {
            return Arc::clone(topic);
        }
        Arc::clone(self.topics.write().entry(name.to_string()).or_default())
    }

    fn append(&self, name: &str, payload: Bytes) {
        let topic = self.topic(name);
        topic.records.write().push(payload);
        topic.appended.notify_waiters();
    }
}

/// Buffered in-process topic log
pub struct MemoryLog {
    state: Arc<LogState>,
    allowed: Option<HashSet<String>>,
    tx: Mutex<Option<mpsc::Sender<(String, Bytes)>>>,
    errors_tx: Mutex<Option<mpsc::Sender<PluginError>>>,
    errors_rx: Mutex<Option<ErrorReceiver>>,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MemoryLog {
    /// Log accepting any topic
    pub fn new() -> Arc<Self> {
        Self::build(DEFAULT_BUFFER, None)
    }

    /// Log with a bounded append buffer
    pub fn with_buffer(capacity: usize) -> Arc<Self> {
        Self::build(capacity, None)
    }

    /// Log accepting only `topics`; appends elsewhere fail asynchronously
    pub fn with_topics<I, S>(topics: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(
            DEFAULT_BUFFER,
            Some(topics.into_iter().map(Into::into).collect()),
        )
    }

    fn build(capacity: usize, allowed: Option<HashSet<String>>) -> Arc<Self> {
        let state = Arc::new(LogState::default());
        let (tx, mut rx) = mpsc::channel::<(String, Bytes)>(capacity.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_BUFFER);

        let writer_state = Arc::clone(&state);
        let writer_errors = errors_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some((topic, payload)) = rx.recv().await {
                if writer_state.failing.load(Ordering::SeqCst) {
                    let err = PluginError::Send(format!("append to '{topic}' failed"));
                    match writer_errors.try_send(err) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!("Memory log error channel full, dropping append error");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            debug!("Error channel closed, discarding append error");
                        }
                    }
                    continue;
                }
                writer_state.append(&topic, payload);
            }
            debug!("Memory log writer drained");
        });

        Arc::new(Self {
            state,
            allowed,
            tx: Mutex::new(Some(tx)),
            errors_tx: Mutex::new(Some(errors_tx)),
            errors_rx: Mutex::new(Some(errors_rx)),
            writer: tokio::sync::Mutex::new(Some(writer)),
        })
    }

    /// Make subsequent appends fail (reported on the error channel)
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of every record appended to `topic`
    pub fn records(&self, topic: &str) -> Vec<Bytes> {
        self.state.topic(topic).records.read().clone()
    }

    /// Number of records in `topic`
    pub fn len(&self, topic: &str) -> usize {
        self.state.topic(topic).records.read().len()
    }

    /// Committed offset of `group` on `topic`
    pub fn committed(&self, group: &str, topic: &str) -> usize {
        self.state
            .offsets
            .lock()
            .get(&(group.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Reader delivering `topic` to consumer `group`
    pub fn reader(&self, topic: &str, group: &str) -> LogReader {
        let (stop_tx, _) = watch::channel(false);
        LogReader {
            state: Arc::clone(&self.state),
            topic: topic.to_string(),
            group: group.to_string(),
            stop_tx,
        }
    }

    fn report(&self, err: PluginError) {
        if let Some(tx) = self.errors_tx.lock().as_ref() {
            if tx.try_send(err).is_err() {
                warn!("Memory log error channel full, dropping error");
            }
        }
    }
}

#[async_trait]
impl MessageSink for MemoryLog {
    fn name(&self) -> &'static str {
        "memory_log"
    }

    fn produce(&self, topic: &str, payload: Bytes) {
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(topic) {
                self.report(PluginError::Send(format!("unknown topic '{topic}'")));
                return;
            }
        }

        let res = match self.tx.lock().as_ref() {
            Some(tx) => tx.try_send((topic.to_string(), payload)).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    PluginError::Send("append buffer full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => PluginError::NotReady,
            }),
            None => Err(PluginError::NotReady),
        };
        if let Err(e) = res {
            self.report(e);
        }
    }

    fn take_errors(&self) -> Option<ErrorReceiver> {
        self.errors_rx.lock().take()
    }

    async fn close(&self) -> Result<(), PluginError> {
        self.tx.lock().take();
        let writer = self.writer.lock().await.take();
        if let Some(writer) = writer {
            writer
                .await
                .map_err(|e| PluginError::Shutdown(format!("log writer failed: {e}")))?;
        }
        // The writer's clone is gone; dropping ours closes the channel
        self.errors_tx.lock().take();
        Ok(())
    }
}

/// Consumer-group reader over one topic of a [`MemoryLog`]
///
/// Delivers from the group's committed offset and commits after each
/// message is handled.
pub struct LogReader {
    state: Arc<LogState>,
    topic: String,
    group: String,
    stop_tx: watch::Sender<bool>,
}

impl LogReader {
    fn offset(&self) -> usize {
        self.state
            .offsets
            .lock()
            .get(&(self.group.clone(), self.topic.clone()))
            .copied()
            .unwrap_or(0)
    }

    fn commit(&self, offset: usize) {
        self.state
            .offsets
            .lock()
            .insert((self.group.clone(), self.topic.clone()), offset);
    }
}

#[async_trait]
impl MessageSource for LogReader {
    fn name(&self) -> &'static str {
        "log_reader"
    }

    async fn run(&self, handler: Arc<dyn MessageHandler>) -> Result<(), PluginError> {
        let topic = self.state.topic(&self.topic);
        let mut stop = self.stop_tx.subscribe();
        let mut offset = self.offset();

        loop {
            if *stop.borrow_and_update() {
                return Ok(());
            }

            let appended = topic.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let next = topic.records.read().get(offset).cloned();
            match next {
                Some(payload) => {
                    handler.handle(Message::new(self.topic.clone(), payload)).await;
                    offset += 1;
                    self.commit(offset);
                }
                None => {
                    tokio::select! {
                        _ = stop.changed() => return Ok(()),
                        _ = &mut appended => {}
                    }
                }
            }
        }
    }

    async fn stop(&self) -> Result<(), PluginError> {
        self.stop_tx.send_replace(true);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Collect(tokio::sync::mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle(&self, msg: Message) {
            let _ = self.0.send(msg);
        }
    }

    #[tokio::test]
    async fn test_produce_then_close_persists_everything() {
        let log = MemoryLog::new();
        for i in 0..100 {
            log.produce("telemetry", Bytes::from(format!("{i}")));
        }
        log.close().await.unwrap();

        let records = log.records("telemetry");
        assert_eq!(records.len(), 100);
        assert_eq!(records[99], "99");
    }

    #[tokio::test]
    async fn test_unknown_topic_reported_on_error_channel() {
        let log = MemoryLog::with_topics(["telemetry"]);
        let mut errors = log.take_errors().unwrap();
        assert!(log.take_errors().is_none());

        log.produce("other", Bytes::from_static(b"x"));
        log.close().await.unwrap();

        assert!(matches!(errors.recv().await, Some(PluginError::Send(_))));
        assert!(errors.recv().await.is_none(), "channel closes after close()");
    }

    #[tokio::test]
    async fn test_failing_appends_reported() {
        let log = MemoryLog::new();
        let mut errors = log.take_errors().unwrap();
        log.set_failing(true);

        log.produce("telemetry", Bytes::from_static(b"x"));
        log.produce("telemetry", Bytes::from_static(b"y"));
        log.close().await.unwrap();

        let mut count = 0;
        while errors.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
        assert_eq!(log.len("telemetry"), 0);
    }

    #[tokio::test]
    async fn test_close_completes_when_errors_are_never_drained() {
        let log = MemoryLog::new();
        log.set_failing(true);

        // More failures than the error channel holds, and nobody reading it
        for i in 0..(ERROR_BUFFER + 44) {
            log.produce("telemetry", Bytes::from(format!("{i}")));
        }
        tokio::time::timeout(Duration::from_secs(3), log.close())
            .await
            .unwrap()
            .unwrap();

        let mut errors = log.take_errors().unwrap();
        let mut count = 0;
        while errors.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, ERROR_BUFFER);
    }

    #[tokio::test]
    async fn test_produce_after_close_is_not_ready() {
        let log = MemoryLog::new();
        let mut errors = log.take_errors().unwrap();
        log.close().await.unwrap();

        log.produce("telemetry", Bytes::from_static(b"late"));
        assert!(errors.recv().await.is_none());
        assert_eq!(log.len("telemetry"), 0);
    }

    #[tokio::test]
    async fn test_reader_follows_appends_and_commits() {
        let log = MemoryLog::new();
        log.produce("t", Bytes::from_static(b"1"));

        let reader = Arc::new(log.reader("t", "loader"));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let r = Arc::clone(&reader);
        let task = tokio::spawn(async move { r.run(Arc::new(Collect(tx))).await });

        assert_eq!(rx.recv().await.unwrap().payload, "1");
        log.produce("t", Bytes::from_static(b"2"));
        assert_eq!(rx.recv().await.unwrap().payload, "2");

        reader.stop().await.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(log.committed("loader", "t"), 2);
    }

    #[tokio::test]
    async fn test_new_reader_resumes_from_group_offset() {
        let log = MemoryLog::new();
        for i in 0..3 {
            log.produce("t", Bytes::from(format!("{i}")));
        }
        log.close().await.unwrap();

        let first = Arc::new(log.reader("t", "g"));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let r = Arc::clone(&first);
        let task = tokio::spawn(async move { r.run(Arc::new(Collect(tx))).await });
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        first.stop().await.unwrap();
        task.await.unwrap().unwrap();

        // The group's position survives the reader; another group starts from zero
        assert_eq!(log.committed("g", "t"), 3);
        assert_eq!(log.committed("other", "t"), 0);

        let other = Arc::new(log.reader("t", "other"));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let r = Arc::clone(&other);
        let task = tokio::spawn(async move { r.run(Arc::new(Collect(tx))).await });
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.payload, "0");
        other.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
