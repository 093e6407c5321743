//! Cron-driven maintenance tasks.
//!
//! Each entry runs in its own task: the loop sleeps until the schedule's
//! next fire time, runs the job inline, then recomputes. Because a job is
//! awaited inside its own loop, runs of one entry never overlap.
//!
//! # Built-in Entries
//!
//! | name | cadence | action |
//! |---|---|---|
//! | `buffer_stats` | every 5 min | log the buffer depth |
//! | `cleanup_old_events` | daily at 02:00 | prune events past the retry age limit |
//! | `health_check` | every 1 min | warn when the buffer depth crosses the soft cap |
//! | `process_scheduled_events` | every 1 s | informational scan of newly-ready events |
//!
//! The ready scan only observes; moving events downstream is the sync
//! worker's job.

use crate::buffer::EventBuffer;
use crate::error::{RelayError, Result};
use crate::metrics;
use chrono::Utc;
use cron::Schedule;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Events with more than this many failed batches are eligible for cleanup.
const CLEANUP_RETRY_LIMIT: u32 = 10;
/// Cleanup only touches events older than this.
const CLEANUP_AGE_HOURS: i64 = 24;
/// Rows examined per maintenance scan.
const SCAN_LIMIT: usize = 1000;

/// Fires periodic maintenance tasks against the buffer.
pub struct Scheduler {
    buffer: Arc<EventBuffer>,
    /// Early-release window mirrored from the buffer config; used by the
    /// informational ready scan.
    ready_window: chrono::Duration,
    /// Soft depth cap for the health check.
    max_size: usize,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    tasks: Vec<&'static str>,
}

impl Scheduler {
    pub fn new(buffer: Arc<EventBuffer>, ready_window: Duration, max_size: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            buffer,
            ready_window: chrono::Duration::from_std(ready_window)
                .unwrap_or_else(|_| chrono::Duration::MAX),
            max_size,
            shutdown_tx,
            handles: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Register and start the built-in task entries.
    pub fn start(&mut self) -> Result<()> {
        info!("Starting task scheduler");

        let buffer = Arc::clone(&self.buffer);
        self.spawn_entry("buffer_stats", "0 */5 * * * *", move || {
            let buffer = Arc::clone(&buffer);
            async move { buffer_stats_task(&buffer).await }
        })?;

        let buffer = Arc::clone(&self.buffer);
        self.spawn_entry("cleanup_old_events", "0 0 2 * * *", move || {
            let buffer = Arc::clone(&buffer);
            async move { cleanup_task(&buffer).await }
        })?;

        let buffer = Arc::clone(&self.buffer);
        let max_size = self.max_size;
        self.spawn_entry("health_check", "0 * * * * *", move || {
            let buffer = Arc::clone(&buffer);
            async move { health_check_task(&buffer, max_size).await }
        })?;

        let buffer = Arc::clone(&self.buffer);
        let window = self.ready_window;
        self.spawn_entry("process_scheduled_events", "* * * * * *", move || {
            let buffer = Arc::clone(&buffer);
            async move { ready_scan_task(&buffer, window).await }
        })?;

        Ok(())
    }

    /// Signal all entry loops and wait for them to exit.
    pub async fn stop(&mut self) {
        info!("Stopping task scheduler");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler task panicked");
            }
        }
    }

    /// Names of registered entries (diagnostics).
    pub fn task_names(&self) -> &[&'static str] {
        &self.tasks
    }

    fn spawn_entry<F, Fut>(&mut self, name: &'static str, spec: &str, task: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let schedule = Schedule::from_str(spec).map_err(|e| {
            RelayError::Config(format!("invalid cron spec for {}: {}", name, e))
        })?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            debug!(task = name, "Scheduled task loop started");
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    break;
                };
                let Some(instant) = datetime_to_instant(next) else {
                    continue;
                };

                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(instant) => {
                        match task().await {
                            Ok(()) => metrics::record_task_run(name, true),
                            Err(e) => {
                                warn!(task = name, error = %e, "Scheduled task failed");
                                metrics::record_task_run(name, false);
                            }
                        }
                    }
                }
            }
            debug!(task = name, "Scheduled task loop stopped");
        });

        info!(task = name, spec = spec, "Added scheduled task");
        self.handles.push(handle);
        self.tasks.push(name);
        Ok(())
    }
}

/// Convert a future UTC datetime to a tokio instant. Returns `None` when
/// the datetime is not in the future.
fn datetime_to_instant(at: chrono::DateTime<Utc>) -> Option<tokio::time::Instant> {
    let now = Utc::now();
    if at <= now {
        return None;
    }
    let duration = (at - now).to_std().ok()?;
    Some(tokio::time::Instant::now() + duration)
}

/// Log the current buffer depth.
async fn buffer_stats_task(buffer: &EventBuffer) -> Result<()> {
    let count = buffer.count().await?;
    metrics::set_buffer_depth(count);
    info!(events = count, "Buffer statistics");
    Ok(())
}

/// Prune events that exceeded the retry age limit: more than
/// [`CLEANUP_RETRY_LIMIT`] failed batches and older than
/// [`CLEANUP_AGE_HOURS`].
async fn cleanup_task(buffer: &EventBuffer) -> Result<()> {
    debug!("Running cleanup of old failed events");

    let events = buffer.batch(SCAN_LIMIT).await?;
    let cutoff = Utc::now() - chrono::Duration::hours(CLEANUP_AGE_HOURS);
    let mut cleaned = 0usize;

    for event in &events {
        if event.retries > CLEANUP_RETRY_LIMIT && event.timestamp < cutoff {
            if let Err(e) = buffer.delete(&event.id, event.timestamp).await {
                warn!(id = %event.id, error = %e, "Failed to delete old event");
                continue;
            }
            cleaned += 1;
        }
    }

    if cleaned > 0 {
        info!(cleaned, "Cleaned up old failed events");
        metrics::record_events_cleaned(cleaned);
    }

    Ok(())
}

/// Warn when the buffer depth crosses the soft cap. The cap is advisory -
/// ingestion is never blocked.
async fn health_check_task(buffer: &EventBuffer, max_size: usize) -> Result<()> {
    let count = buffer.count().await?;
    if count > max_size as i64 {
        warn!(
            events = count,
            threshold = max_size,
            "Buffer depth over threshold - investigate downstream connectivity"
        );
    }
    Ok(())
}

/// Informational scan: log scheduled events whose ready time has crossed
/// into the delivery window. The sync worker does the actual delivery.
async fn ready_scan_task(buffer: &EventBuffer, window: chrono::Duration) -> Result<()> {
    let events = buffer.batch(SCAN_LIMIT).await?;
    let threshold = Utc::now() + window;
    let mut ready = 0usize;

    for event in &events {
        if let Some(ready_at) = event.ready_at {
            if ready_at > threshold {
                continue;
            }
            debug!(id = %event.id, ready_at = %ready_at, "Scheduled event is now ready");
            ready += 1;
        }
    }

    if ready > 0 {
        info!(ready, "Scheduled events ready for delivery");
    }

    Ok(())
}
