//! # CDC Relay
//!
//! A buffered change-data-capture relay: observes a MongoDB change stream,
//! materializes every change into a durable local event queue, and forwards
//! queued events to Kafka in batches - surviving indefinite downstream
//! outages and honoring per-event future-delivery schedules.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              cdc-relay                               │
//! │                                                                      │
//! │  ┌─────────────────┐    ┌──────────────┐    ┌─────────────────────┐  │
//! │  │ UpstreamWatcher │───►│ EventBuffer  │───►│ DownstreamSync      │  │
//! │  │ (change stream) │    │ (SQLite,     │    │ (batch + backoff)   │  │
//! │  └─────────────────┘    │  ordered)    │    └──────────┬──────────┘  │
//! │                         └──────┬───────┘               │             │
//! │                                │              ┌────────▼──────────┐  │
//! │  ┌─────────────────────┐       │              │ ConnectivityMon.  │  │
//! │  │ Scheduler           │◄──────┘              │ (TCP probe +      │  │
//! │  │ (stats, cleanup,    │                      │  status watch)    │  │
//! │  │  health, ready scan)│                      └───────────────────┘  │
//! │  └─────────────────────┘                                             │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Events flow UpstreamWatcher → EventBuffer → DownstreamSync → Kafka; the
//! buffer is the durability boundary (at-least-once delivery, dedup by
//! event id on the consumer side). [`RelayService`] composes the components
//! and owns the shutdown ordering.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cdc_relay::{RelayConfig, RelayService};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> cdc_relay::Result<()> {
//!     let config = RelayConfig::from_env();
//!     let service = RelayService::new(config).await?;
//!
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     service.run(shutdown_rx).await
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod monitor;
pub mod resilience;
pub mod scheduler;
pub mod service;
pub mod sink;
pub mod sync;
pub mod watcher;

// Re-exports for convenience
pub use buffer::EventBuffer;
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use event::{Event, Operation};
pub use monitor::{ConnStatus, ConnectivityMonitor};
pub use scheduler::Scheduler;
pub use service::RelayService;
pub use sink::{EventSink, KafkaSink, NoOpSink, SinkMessage};
pub use sync::DownstreamSync;
pub use watcher::UpstreamWatcher;
