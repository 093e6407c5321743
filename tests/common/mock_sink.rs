//! Mock EventSink for testing.
//!
//! Records every written batch for assertions and can be configured to
//! fail writes (all of them, or the next N) to exercise the retry path.

use cdc_relay::error::RelayError;
use cdc_relay::sink::{BoxFuture, EventSink, SinkMessage};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Mock implementation of [`EventSink`] that records all calls.
///
/// # Example
/// ```rust,ignore
/// let sink = Arc::new(MockSink::new());
/// sink.fail_next(2); // first two write calls fail
///
/// // ... drive the sync worker ...
///
/// assert_eq!(sink.write_attempts(), 3);
/// assert_eq!(sink.delivered_keys().await, vec!["e1".to_string()]);
/// ```
#[derive(Default)]
pub struct MockSink {
    /// Successfully written batches, in write order.
    batches: RwLock<Vec<Vec<SinkMessage>>>,
    /// Total write() calls, failed ones included.
    write_attempts: AtomicUsize,
    /// Fail every write while set.
    fail_all: AtomicBool,
    /// Fail this many upcoming writes.
    fail_remaining: AtomicUsize,
    /// Whether close() was called.
    closed: AtomicBool,
}

impl MockSink {
    /// A sink that accepts every write.
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that rejects every write.
    pub fn rejecting() -> Self {
        let sink = Self::default();
        sink.fail_all.store(true, Ordering::SeqCst);
        sink
    }

    /// Fail the next `n` write calls, then accept again.
    #[allow(dead_code)]
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Toggle reject-everything mode.
    #[allow(dead_code)]
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Number of write() calls observed (failed ones included).
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Whether close() was called.
    #[allow(dead_code)]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// All successfully written batches.
    #[allow(dead_code)]
    pub async fn batches(&self) -> Vec<Vec<SinkMessage>> {
        self.batches.read().await.clone()
    }

    /// Message keys across all successful batches, in delivery order.
    pub async fn delivered_keys(&self) -> Vec<String> {
        self.batches
            .read()
            .await
            .iter()
            .flatten()
            .map(|msg| String::from_utf8_lossy(&msg.key).to_string())
            .collect()
    }

    /// Total messages across all successful batches.
    pub async fn delivered_count(&self) -> usize {
        self.batches.read().await.iter().map(Vec::len).sum()
    }

    fn should_fail(&self) -> bool {
        if self.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl EventSink for MockSink {
    fn write(&self, messages: Vec<SinkMessage>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.write_attempts.fetch_add(1, Ordering::SeqCst);
            if self.should_fail() {
                return Err(RelayError::kafka("write", "mock sink write rejected"));
            }
            self.batches.write().await.push(messages);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}
