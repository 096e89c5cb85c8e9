//! Bounded hand-off queue between pipeline stages
//!
//! A fixed-capacity multi-producer multi-consumer FIFO built on
//! crossbeam's `ArrayQueue`. Producers never block on `push`: a full queue
//! rejects the item and hands it back. Consumers `pop` asynchronously and
//! park on a `Notify` when the queue is empty.
//!
//! # Closing
//!
//! ```text
//! open ──close()──► closed, draining ──(empty)──► pop() returns None
//! ```
//!
//! `close()` is idempotent. After it, pushes fail with [`PushError::Closed`]
//! and `pop()` keeps yielding queued items until the queue is empty.
//!
//! Close only after every producer has stopped. A push that races the close
//! can land after the last consumer has seen "closed and empty" and would
//! then never be popped. The lifecycle orchestrator stops the source before
//! closing.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// Why a push was rejected; carries the item back to the caller
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// Queue at capacity
    Full(T),
    /// Queue closed
    Closed(T),
}

impl<T> PushError<T> {
    /// Recover the rejected item
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }

    /// True if rejected for capacity
    pub fn is_full(&self) -> bool {
        matches!(self, PushError::Full(_))
    }
}

/// Counters for queue monitoring
#[derive(Default)]
pub struct QueueStats {
    /// Items accepted
    pub pushed: AtomicU64,
    /// Items rejected (full or closed)
    pub rejected: AtomicU64,
    /// Items handed to consumers
    pub popped: AtomicU64,
}

/// Fixed-capacity MPMC queue with close-then-drain semantics
pub struct BoundedQueue<T> {
    items: ArrayQueue<T>,
    closed: AtomicBool,
    /// Signalled on push and on close
    available: Notify,
    /// Signalled on pop and on close
    space: Notify,
    stats: QueueStats,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items
    ///
    /// A capacity of zero is raised to one; configuration validation rejects
    /// zero before it gets here.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity.max(1)),
            closed: AtomicBool::new(false),
            available: Notify::new(),
            space: Notify::new(),
            stats: QueueStats::default(),
        }
    }

    /// Push without blocking
    ///
    /// Returns `true` if enqueued, `false` if the queue is full or closed.
    pub fn push(&self, item: T) -> bool {
        self.try_push(item).is_ok()
    }

    /// Push without blocking, handing the item back on rejection
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        match self.enqueue(item) {
            Ok(()) => {
                self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(rejected) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(rejected)
            }
        }
    }

    /// Push, waiting for free space
    ///
    /// Fails only if the queue closes before space frees up. Cancel-safe in
    /// the sense that dropping the future drops the item and nothing else.
    pub async fn push_wait(&self, mut item: T) -> Result<(), PushError<T>> {
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.enqueue(item) {
                Ok(()) => {
                    self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(PushError::Full(back)) => item = back,
                Err(closed) => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(closed);
                }
            }

            notified.await;
        }
    }

    fn enqueue(&self, item: T) -> Result<(), PushError<T>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PushError::Closed(item));
        }
        match self.items.push(item) {
            Ok(()) => {
                self.available.notify_one();
                Ok(())
            }
            Err(item) => Err(PushError::Full(item)),
        }
    }

    /// Pop the next item, waiting while the queue is open and empty
    ///
    /// Returns `None` once the queue is closed and drained. Cancel-safe: an
    /// item is only removed when the future completes with it.
    pub async fn pop(&self) -> Option<T> {
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return self.try_pop();
            }

            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Re-check after registering so a push or close between the
            // first check and `enable` is not missed
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return self.try_pop();
            }

            notified.await;
        }
    }

    /// Pop without waiting
    pub fn try_pop(&self) -> Option<T> {
        let item = self.items.pop()?;
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        self.space.notify_one();
        Some(item)
    }

    /// Stop accepting pushes; queued items remain poppable
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.available.notify_waiters();
            self.space.notify_waiters();
        }
    }

    /// Pop and discard everything still queued, returning the count
    pub fn discard_remaining(&self) -> usize {
        let mut discarded = 0;
        while self.try_pop().is_some() {
            discarded += 1;
        }
        discarded
    }

    /// True once `close()` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current number of queued items (approximate under concurrency)
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Items accepted so far
    pub fn total_pushed(&self) -> u64 {
        self.stats.pushed.load(Ordering::Relaxed)
    }

    /// Items rejected so far
    pub fn total_rejected(&self) -> u64 {
        self.stats.rejected.load(Ordering::Relaxed)
    }

    /// Items popped so far
    pub fn total_popped(&self) -> u64 {
        self.stats.popped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_full_queue_rejects_third_push() {
        let queue = BoundedQueue::new(2);

        assert!(queue.push("A"));
        assert!(queue.push("B"));
        assert!(!queue.push("C"));

        assert_eq!(queue.total_rejected(), 1);
        assert_eq!(queue.pop().await, Some("A"));
        assert_eq!(queue.pop().await, Some("B"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_try_push_returns_item_on_full() {
        let queue = BoundedQueue::new(1);
        queue.try_push(1).unwrap();

        let err = queue.try_push(2).unwrap_err();
        assert!(err.is_full());
        assert_eq!(err.into_inner(), 2);
    }

    #[test]
    fn test_len_never_exceeds_capacity() {
        let queue = BoundedQueue::new(5);
        for i in 0..50 {
            queue.push(i);
            assert!(queue.len() <= queue.capacity());
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.total_rejected(), 45);
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(0);
        assert_eq!(queue.capacity(), 1);
    }

    #[tokio::test]
    async fn test_close_drains_then_reports_closed() {
        let queue = BoundedQueue::new(4);
        queue.push(1);
        queue.push(2);
        queue.close();
        queue.close(); // idempotent

        assert!(!queue.push(3));
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, None);
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_parked_consumers() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4));

        let mut consumers = Vec::new();
        for _ in 0..3 {
            let q = Arc::clone(&queue);
            consumers.push(tokio::spawn(async move { q.pop().await }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        for c in consumers {
            let result = tokio::time::timeout(Duration::from_secs(1), c)
                .await
                .expect("consumer should wake on close")
                .unwrap();
            assert_eq!(result, None);
        }
    }

    #[tokio::test]
    async fn test_push_wait_resumes_after_pop() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.push(1);

        let q = Arc::clone(&queue);
        let blocked = tokio::spawn(async move { q.push_wait(2).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!blocked.is_finished());

        assert_eq!(queue.pop().await, Some(1));
        blocked.await.unwrap().unwrap();
        assert_eq!(queue.pop().await, Some(2));
    }

    #[tokio::test]
    async fn test_push_wait_fails_when_closed() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.push(1);

        let q = Arc::clone(&queue);
        let blocked = tokio::spawn(async move { q.push_wait(2).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let err = blocked.await.unwrap().unwrap_err();
        assert_eq!(err, PushError::Closed(2));
    }

    #[tokio::test]
    async fn test_discard_remaining_counts_items() {
        let queue = BoundedQueue::new(8);
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.discard_remaining(), 5);
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_item_observed_exactly_once() {
        let queue = Arc::new(BoundedQueue::new(64));

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&queue);
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = q.pop().await {
                    seen.push(item);
                }
                seen
            }));
        }

        let mut producers = Vec::new();
        for t in 0..4u32 {
            let q = Arc::clone(&queue);
            producers.push(tokio::spawn(async move {
                for i in 0..500u32 {
                    q.push_wait(t * 1000 + i).await.unwrap();
                }
            }));
        }
        for p in producers {
            p.await.unwrap();
        }
        queue.close();

        let mut all = Vec::new();
        for c in consumers {
            all.extend(c.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 2000);
        assert_eq!(unique.len(), 2000);
    }

    #[tokio::test]
    async fn test_single_consumer_sees_fifo_order() {
        let queue = BoundedQueue::new(16);
        for i in 0..10 {
            queue.push(i);
        }
        queue.close();

        let mut out = Vec::new();
        while let Some(i) = queue.pop().await {
            out.push(i);
        }
        assert_eq!(out, (0..10).collect::<Vec<_>>());
    }
}
