//! Shared helpers for integration tests.

pub mod mock_sink;

pub use mock_sink::MockSink;

use cdc_relay::buffer::EventBuffer;
use cdc_relay::config::{KafkaConfig, MonitorConfig, RelayConfig, SyncConfig};
use cdc_relay::event::{Event, Operation};
use cdc_relay::monitor::{ConnStatus, ConnectivityMonitor};
use cdc_relay::resilience::RetryConfig;
use cdc_relay::sync::DownstreamSync;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Open a fresh buffer in a temp directory.
pub async fn temp_buffer(ready_window: Duration) -> (TempDir, Arc<EventBuffer>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let buffer = EventBuffer::open(dir.path().join("buffer.db"), ready_window)
        .await
        .expect("open buffer");
    (dir, Arc::new(buffer))
}

/// An immediately-eligible event with a deterministic timestamp.
pub fn make_event(id: &str, nanos_offset: i64) -> Event {
    Event::new(
        id.to_string(),
        Operation::Insert,
        Utc.timestamp_nanos(1_700_000_000_000_000_000 + nanos_offset),
        Map::new(),
        None,
    )
}

/// An event scheduled for future delivery.
#[allow(dead_code)]
pub fn make_scheduled_event(id: &str, nanos_offset: i64, ready_at: DateTime<Utc>) -> Event {
    let mut event = make_event(id, nanos_offset);
    event.ready_at = Some(ready_at);
    event
}

/// A monitor with no probe loop running; tests drive it via force_status.
pub fn manual_monitor(initial: ConnStatus) -> Arc<ConnectivityMonitor> {
    let monitor = ConnectivityMonitor::new(
        &MonitorConfig::for_testing(),
        &KafkaConfig::for_testing(),
    );
    if initial == ConnStatus::Online {
        monitor.force_status(ConnStatus::Online);
    }
    Arc::new(monitor)
}

/// Build a sync worker with fast test cadences and backoff.
pub fn fast_sync(
    buffer: Arc<EventBuffer>,
    sink: Arc<MockSink>,
    monitor: Arc<ConnectivityMonitor>,
) -> DownstreamSync<MockSink> {
    let config = RelayConfig {
        sync: SyncConfig::for_testing(),
        ..RelayConfig::default()
    };
    DownstreamSync::new(buffer, sink, monitor, &config).with_retry(RetryConfig::testing())
}
