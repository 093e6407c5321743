//! Downstream sync worker.
//!
//! Drains ready events from the buffer to the downstream log. Two trigger
//! sources feed the loop:
//!
//! - a ticker every `SYNC_INTERVAL`: when Online, up to `batches_per_tick`
//!   batches are attempted in sequence, stopping early on the first error;
//! - the connectivity subscription: an Offline→Online edge triggers one
//!   immediate batch so a recovered downstream drains without waiting for
//!   the next tick.
//!
//! # At-Least-Once
//!
//! An event is deleted only after the downstream write is acked. A crash or
//! delete failure between ack and delete causes redelivery on a later scan;
//! consumers deduplicate by event id.
//!
//! # Retry Accounting
//!
//! `write_with_retry` counts failed *batches*: when a batch exhausts its
//! attempts (or aborts because connectivity dropped), every event in it gets
//! its retry counter bumped once. Shutdown during the retry loop returns
//! without touching the counters.

use crate::buffer::EventBuffer;
use crate::error::{RelayError, Result};
use crate::event::Event;
use crate::metrics;
use crate::monitor::{ConnStatus, ConnectivityMonitor};
use crate::resilience::RetryConfig;
use crate::sink::{encode_event, EventSink, SinkMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Drains ready events from the buffer into an [`EventSink`].
pub struct DownstreamSync<S: EventSink> {
    buffer: Arc<EventBuffer>,
    sink: Arc<S>,
    monitor: Arc<ConnectivityMonitor>,
    /// Rows fetched per drain scan.
    batch_size: usize,
    /// Drain ticker cadence.
    interval: Duration,
    /// Max batches attempted per tick.
    batches_per_tick: usize,
    /// Backoff policy between write attempts.
    retry: RetryConfig,
}

impl<S: EventSink> DownstreamSync<S> {
    /// Create a sync worker from the relay configuration.
    pub fn new(
        buffer: Arc<EventBuffer>,
        sink: Arc<S>,
        monitor: Arc<ConnectivityMonitor>,
        config: &crate::config::RelayConfig,
    ) -> Self {
        Self {
            buffer,
            sink,
            monitor,
            batch_size: config.buffer.batch_size,
            interval: config.sync.interval,
            batches_per_tick: config.sync.batches_per_tick,
            retry: RetryConfig::downstream(config.kafka.retries.max(1)),
        }
    }

    /// Override the backoff policy (tests use a fast schedule).
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run the drain loop until shutdown.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval = ?self.interval,
            batches_per_tick = self.batches_per_tick,
            "Starting downstream sync worker"
        );

        let mut ticker = tokio::time::interval(self.interval);
        let mut status_rx = self.monitor.subscribe();
        // The receiver is seeded; consume the initial value so only real
        // transitions wake the edge branch.
        status_rx.borrow_and_update();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if !self.monitor.is_online() {
                        continue;
                    }
                    for batch in 0..self.batches_per_tick {
                        match self.sync_batch(&shutdown_rx).await {
                            Ok(()) => {}
                            Err(e) => {
                                // Stop on error to avoid cascading failures.
                                warn!(batch = batch + 1, error = %e, "Batch sync failed");
                                break;
                            }
                        }
                    }
                }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        // Monitor dropped; rely on ticker + is_online.
                        continue;
                    }
                    if *status_rx.borrow_and_update() == ConnStatus::Online {
                        info!("Connectivity restored, starting sync process");
                        if let Err(e) = self.sync_batch(&shutdown_rx).await {
                            warn!(error = %e, "Batch sync failed after connectivity restore");
                        }
                    }
                }
            }
        }

        info!("Downstream sync worker stopped");
    }

    /// Drain one batch of ready events. An empty scan is a successful no-op.
    pub async fn sync_batch(&self, shutdown_rx: &watch::Receiver<bool>) -> Result<()> {
        let events = self.buffer.ready_events(self.batch_size).await?;
        if events.is_empty() {
            return Ok(());
        }

        debug!(count = events.len(), "Syncing events downstream");
        let started = std::time::Instant::now();

        let mut messages: Vec<SinkMessage> = Vec::with_capacity(events.len());
        for event in &events {
            match encode_event(event) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    // Event-level skip; the rest of the batch proceeds.
                    warn!(id = %event.id, error = %e, "Failed to serialize event, skipping");
                    metrics::record_event_skipped();
                }
            }
        }

        if messages.is_empty() {
            return Ok(());
        }

        self.write_with_retry(messages, &events, shutdown_rx)
            .await?;

        // Delete after ack. A delete failure is logged but does not fail
        // the batch; the event is simply redelivered later.
        for event in &events {
            if let Err(e) = self.buffer.delete(&event.id, event.timestamp).await {
                warn!(id = %event.id, error = %e, "Failed to delete synced event from buffer");
            }
        }

        metrics::record_batch_synced(events.len(), started.elapsed());
        info!(count = events.len(), "Synced events downstream");
        Ok(())
    }

    /// Write a batch with exponential backoff between attempts.
    ///
    /// Aborts the retry loop early when connectivity drops (the Online edge
    /// will re-trigger) and when shutdown is signaled. On exhaustion or
    /// early offline abort, every event's retry counter is bumped by one.
    async fn write_with_retry(
        &self,
        messages: Vec<SinkMessage>,
        events: &[Event],
        shutdown_rx: &watch::Receiver<bool>,
    ) -> Result<()> {
        let mut shutdown_rx = shutdown_rx.clone();

        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                let delay = self.retry.delay_for_attempt(attempt - 1);
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            // Shutdown interrupts the loop without touching
                            // retry counters.
                            return Err(RelayError::Shutdown);
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                metrics::record_write_retry();
            }

            match self.sink.write(messages.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "Downstream write attempt failed");
                    if !self.monitor.is_online() {
                        info!("Connection lost during downstream write, will retry when online");
                        break;
                    }
                }
            }
        }

        for event in events {
            if let Err(e) = self
                .buffer
                .update_retries(&event.id, event.timestamp, event.retries + 1)
                .await
            {
                warn!(id = %event.id, error = %e, "Failed to update retry count");
            }
        }

        metrics::record_batch_failed();
        Err(RelayError::kafka(
            "write",
            format!(
                "failed to write batch after {} attempts",
                self.retry.max_attempts
            ),
        ))
    }
}
