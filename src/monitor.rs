//! Downstream connectivity monitor.
//!
//! Maintains a single `{Offline, Online}` status and broadcasts transitions
//! to subscribers. Every `interval`, the monitor attempts a plain TCP
//! connect to each configured broker with a per-attempt timeout; the first
//! success means Online, all failures mean Offline.
//!
//! # Broadcast Semantics
//!
//! Status is published through a `watch` channel: each subscriber holds a
//! one-slot mailbox seeded with the current status, and the publisher's
//! `send_replace` never blocks on slow subscribers. A subscriber that lags
//! simply observes the latest status ("latest-known wins"); intermediate
//! flaps are not replayed. Only transitions are logged and published -
//! steady-state probes are silent.

use crate::config::{KafkaConfig, MonitorConfig};
use crate::error::{RelayError, Result};
use crate::metrics;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info};

/// Downstream reachability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Offline,
    Online,
}

impl std::fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnStatus::Offline => write!(f, "OFFLINE"),
            ConnStatus::Online => write!(f, "ONLINE"),
        }
    }
}

/// Probes downstream brokers and broadcasts status transitions.
pub struct ConnectivityMonitor {
    brokers: Vec<String>,
    interval: Duration,
    connect_timeout: Duration,
    status_tx: watch::Sender<ConnStatus>,
}

impl ConnectivityMonitor {
    /// Create a monitor starting in the Offline state.
    pub fn new(monitor: &MonitorConfig, kafka: &KafkaConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnStatus::Offline);
        Self {
            brokers: kafka.brokers.clone(),
            interval: monitor.interval,
            connect_timeout: monitor.connect_timeout,
            status_tx,
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> ConnStatus {
        *self.status_tx.borrow()
    }

    /// Whether the downstream is currently reachable.
    pub fn is_online(&self) -> bool {
        self.status() == ConnStatus::Online
    }

    /// Subscribe to status transitions.
    ///
    /// The receiver is seeded with the current status; after a transition
    /// `changed()` resolves and `borrow()` yields the latest value.
    pub fn subscribe(&self) -> watch::Receiver<ConnStatus> {
        self.status_tx.subscribe()
    }

    /// Run the probe loop until shutdown. The first probe fires
    /// immediately so consumers do not wait a full interval for the
    /// initial verdict.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        info!(
            brokers = ?self.brokers,
            interval = ?self.interval,
            "Starting connectivity monitor"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
            }
        }

        info!("Connectivity monitor stopped");
    }

    /// Probe all brokers once and publish the status if it changed.
    pub async fn probe_once(&self) {
        let online = self.any_broker_reachable().await;
        let new_status = if online {
            ConnStatus::Online
        } else {
            ConnStatus::Offline
        };
        self.publish(new_status);
    }

    /// Force a status, bypassing the probe. Used by tests and operational
    /// tooling to simulate downstream outages.
    pub fn force_status(&self, status: ConnStatus) {
        self.publish(status);
    }

    fn publish(&self, new_status: ConnStatus) {
        let old_status = *self.status_tx.borrow();
        if old_status == new_status {
            return;
        }

        info!(status = %new_status, "Connectivity status changed");
        metrics::set_connectivity(new_status == ConnStatus::Online);
        metrics::record_connectivity_transition(new_status == ConnStatus::Online);
        self.status_tx.send_replace(new_status);
    }

    async fn any_broker_reachable(&self) -> bool {
        for broker in &self.brokers {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(broker.as_str()))
                .await
            {
                Ok(Ok(_stream)) => {
                    debug!(broker = %broker, "Broker reachable");
                    return true;
                }
                Ok(Err(e)) => {
                    debug!(broker = %broker, error = %e, "Broker connect failed");
                }
                Err(_) => {
                    debug!(broker = %broker, "Broker connect timed out");
                }
            }
        }
        false
    }

    /// Block until the downstream is Online or shutdown is signaled.
    ///
    /// Returns immediately when already Online.
    pub async fn wait_for_online(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let mut status_rx = self.subscribe();

        loop {
            if *status_rx.borrow_and_update() == ConnStatus::Online {
                return Ok(());
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Err(RelayError::Shutdown);
                    }
                }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        // Monitor dropped; treat as shutdown.
                        return Err(RelayError::Shutdown);
                    }
                }
            }
        }
    }
}
