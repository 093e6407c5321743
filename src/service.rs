// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relay service composition and lifecycle.
//!
//! Owns every component and the shutdown protocol.
//!
//! # Startup Order
//!
//! buffer → upstream watcher (client connect) → connectivity monitor →
//! Kafka sink → downstream sync → scheduler. Each acquisition that fails
//! releases everything acquired before it.
//!
//! # Shutdown Order
//!
//! On root cancel: fan the shutdown signal out to all component tasks →
//! join each with a drain timeout → stop the scheduler → close the sink
//! (flushes in-flight writes) → close the upstream client → close the
//! buffer.

use crate::buffer::EventBuffer;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::monitor::ConnectivityMonitor;
use crate::scheduler::Scheduler;
use crate::sink::{EventSink, KafkaSink};
use crate::sync::DownstreamSync;
use crate::watcher::UpstreamWatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long each component task gets to drain on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The composed relay: buffer, watcher, monitor, sync and scheduler.
pub struct RelayService {
    buffer: Arc<EventBuffer>,
    monitor: Arc<ConnectivityMonitor>,
    watcher: Arc<UpstreamWatcher>,
    sink: Arc<KafkaSink>,
    sync: DownstreamSync<KafkaSink>,
    scheduler: Scheduler,
}

impl RelayService {
    /// Build every component. Any failure releases the resources acquired
    /// so far before returning.
    pub async fn new(config: RelayConfig) -> Result<Self> {
        let buffer = Arc::new(
            EventBuffer::open(&config.buffer.path, config.buffer.ready_window).await?,
        );

        let watcher = match UpstreamWatcher::connect(&config.mongodb, Arc::clone(&buffer)).await {
            Ok(watcher) => Arc::new(watcher),
            Err(e) => {
                buffer.close().await;
                return Err(e);
            }
        };

        let monitor = Arc::new(ConnectivityMonitor::new(&config.monitor, &config.kafka));

        let sink = match KafkaSink::new(&config.kafka) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                watcher.close().await;
                buffer.close().await;
                return Err(e);
            }
        };

        let sync = DownstreamSync::new(
            Arc::clone(&buffer),
            Arc::clone(&sink),
            Arc::clone(&monitor),
            &config,
        );

        let scheduler = Scheduler::new(
            Arc::clone(&buffer),
            config.buffer.ready_window,
            config.buffer.max_size,
        );

        Ok(Self {
            buffer,
            monitor,
            watcher,
            sink,
            sync,
            scheduler,
        })
    }

    /// Run until the root shutdown signal fires, then shut everything down
    /// in order. Returns once the buffer is closed.
    pub async fn run(self, mut root_shutdown: watch::Receiver<bool>) -> Result<()> {
        let RelayService {
            buffer,
            monitor,
            watcher,
            sink,
            sync,
            mut scheduler,
        } = self;

        info!("Starting buffered CDC relay");
        scheduler.start()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        {
            let monitor = Arc::clone(&monitor);
            let rx = shutdown_rx.clone();
            handles.push((
                "connectivity monitor",
                tokio::spawn(async move { monitor.run(rx).await }),
            ));
        }

        {
            let rx = shutdown_rx.clone();
            handles.push((
                "downstream sync",
                tokio::spawn(async move { sync.run(rx).await }),
            ));
        }

        {
            let watcher = Arc::clone(&watcher);
            let rx = shutdown_rx.clone();
            handles.push((
                "upstream watcher",
                tokio::spawn(async move {
                    if let Err(e) = watcher.run(rx).await {
                        // Fatal for the component; supervision is external.
                        error!(error = %e, "Upstream watcher failed");
                    }
                }),
            ));
        }

        info!("All components started");

        loop {
            if *root_shutdown.borrow_and_update() {
                break;
            }
            if root_shutdown.changed().await.is_err() {
                // Signal source dropped; treat as shutdown.
                break;
            }
        }

        info!("Shutdown signal received, stopping relay");
        let _ = shutdown_tx.send(true);

        for (name, handle) in handles {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(component = name, "Component stopped"),
                Ok(Err(e)) => {
                    warn!(component = name, error = %e, "Component panicked during shutdown")
                }
                Err(_) => warn!(component = name, "Component timed out during shutdown"),
            }
        }

        scheduler.stop().await;

        if let Err(e) = sink.close().await {
            warn!(error = %e, "Error closing Kafka producer");
        }
        watcher.close().await;
        buffer.close().await;

        info!("Relay shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KafkaConfig, MongoConfig, MonitorConfig, SyncConfig};
    use tempfile::tempdir;

    fn test_config(dir: &tempfile::TempDir) -> RelayConfig {
        let mut config = RelayConfig::default();
        config.buffer.path = dir
            .path()
            .join("service.db")
            .to_string_lossy()
            .to_string();
        // Short timeouts so the (absent) upstream fails fast instead of
        // stalling shutdown.
        config.mongodb = MongoConfig {
            uri: "mongodb://127.0.0.1:27017/?serverSelectionTimeoutMS=200&connectTimeoutMS=200"
                .to_string(),
            ..MongoConfig::default()
        };
        config.kafka = KafkaConfig::for_testing();
        config.monitor = MonitorConfig::for_testing();
        config.sync = SyncConfig::for_testing();
        config
    }

    #[tokio::test]
    async fn test_service_builds_without_live_backends() {
        let dir = tempdir().unwrap();
        let service = RelayService::new(test_config(&dir)).await;
        assert!(service.is_ok());
    }

    #[tokio::test]
    async fn test_service_runs_and_shuts_down() {
        let dir = tempdir().unwrap();
        let service = RelayService::new(test_config(&dir)).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let runner = tokio::spawn(service.run(rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(15), runner)
            .await
            .expect("service did not shut down in time")
            .unwrap();
        assert!(result.is_ok());
    }
}
