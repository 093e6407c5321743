//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Ingestion (events stored, dropped)
//! - Buffer depth
//! - Downstream sync (batches, events, retries)
//! - Connectivity transitions
//! - Maintenance tasks
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `relay_` and follow Prometheus conventions:
//! counters end in `_total`, gauges represent current state, histograms
//! track distributions. Installing a recorder/exporter is the embedding
//! process's concern; without one these calls are no-ops.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an event stored into the buffer by the watcher.
pub fn record_event_stored(operation: &str) {
    counter!("relay_events_stored_total", "operation" => operation.to_string()).increment(1);
}

/// Record an event dropped during ingest (decode or store failure).
pub fn record_event_dropped(reason: &str) {
    counter!("relay_events_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// Set the current buffer depth gauge.
pub fn set_buffer_depth(count: i64) {
    gauge!("relay_buffer_depth").set(count as f64);
}

/// Record a completed sync batch.
pub fn record_batch_synced(events: usize, duration: Duration) {
    counter!("relay_sync_batches_total").increment(1);
    counter!("relay_sync_events_total").increment(events as u64);
    histogram!("relay_sync_batch_duration_seconds").record(duration.as_secs_f64());
    histogram!("relay_sync_batch_size").record(events as f64);
}

/// Record a failed sync batch.
pub fn record_batch_failed() {
    counter!("relay_sync_batch_failures_total").increment(1);
}

/// Record a downstream write retry attempt.
pub fn record_write_retry() {
    counter!("relay_sync_write_retries_total").increment(1);
}

/// Record an event skipped during batch serialization.
pub fn record_event_skipped() {
    counter!("relay_sync_events_skipped_total").increment(1);
}

/// Set the connectivity status gauge (1 = online, 0 = offline).
pub fn set_connectivity(online: bool) {
    gauge!("relay_downstream_online").set(if online { 1.0 } else { 0.0 });
}

/// Record a connectivity transition.
pub fn record_connectivity_transition(online: bool) {
    let status = if online { "online" } else { "offline" };
    counter!("relay_connectivity_transitions_total", "status" => status).increment(1);
}

/// Record events pruned by the cleanup task.
pub fn record_events_cleaned(count: usize) {
    counter!("relay_events_cleaned_total").increment(count as u64);
}

/// Record a scheduled maintenance task run.
pub fn record_task_run(task: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_scheduler_task_runs_total", "task" => task.to_string(), "status" => status)
        .increment(1);
}

/// Record a SQLite busy retry in the buffer.
pub fn record_buffer_retry(operation: &str) {
    counter!("relay_buffer_retries_total", "operation" => operation.to_string()).increment(1);
}
