//! The queued event record and its storage key.
//!
//! An [`Event`] is the unit of work flowing through the relay: the watcher
//! creates one per change-stream record, the buffer persists it, and the
//! downstream sync deletes it after the Kafka ack.
//!
//! # Storage Key
//!
//! Events are keyed by `{unix_nanos}_{id}`. The key is textual and stable
//! across process restarts; together with the JSON value format it is the
//! only persistence contract of the buffer file. Two events sharing both
//! timestamp and id collide and the later write wins.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Change-stream operation kind.
///
/// Serialized lowercase, matching the upstream `operationType` values.
/// `invalidate` is carried but not treated specially anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Replace,
    Invalidate,
}

impl Operation {
    /// The lowercase wire name of this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Replace => "replace",
            Operation::Invalidate => "invalidate",
        }
    }

    /// Parse an upstream `operationType` string.
    ///
    /// Returns `None` for operations outside the relayed set (drop, rename,
    /// etc.) - the watcher skips those records.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Operation::Insert),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            "replace" => Some(Operation::Replace),
            "invalidate" => Some(Operation::Invalidate),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A buffered change event.
///
/// The serialized form is a self-describing JSON object; every field
/// round-trips losslessly (timestamps at nanosecond precision).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stable string identifying the source document change, derived from
    /// the upstream event's native id.
    pub id: String,

    /// The upstream operation kind.
    pub operation: Operation,

    /// Wall-clock instant the event was ingested (not the upstream cluster
    /// time). Forms the leading component of the storage key.
    pub timestamp: DateTime<Utc>,

    /// Opaque upstream payload: document key, full document, cluster time,
    /// operation type. The relay core never inspects it.
    pub data: Map<String, Value>,

    /// Count of failed sync *batches* this event participated in. A
    /// successful batch does not reset it; the cleanup task prunes events
    /// whose counter grows past the retry age limit.
    #[serde(default)]
    pub retries: u32,

    /// Optional instant at which the event becomes eligible for delivery.
    /// Absent means immediately eligible.
    #[serde(rename = "readyAt", default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Build a fresh event as ingested by the watcher (`retries = 0`).
    pub fn new(
        id: String,
        operation: Operation,
        timestamp: DateTime<Utc>,
        data: Map<String, Value>,
        ready_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            operation,
            timestamp,
            data,
            retries: 0,
            ready_at,
        }
    }

    /// The buffer storage key for this event.
    pub fn storage_key(&self) -> String {
        storage_key(self.timestamp, &self.id)
    }

    /// Readiness predicate: ready when `ready_at` is absent or falls within
    /// `window` of `now` (inclusive). A zero window yields strict scheduled
    /// delivery; a positive window releases events early.
    pub fn is_ready(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.ready_at {
            None => true,
            Some(ready_at) => ready_at <= now + window,
        }
    }
}

/// Compose the compound storage key `{unix_nanos}_{id}`.
///
/// Timestamps beyond the nanosecond-representable range saturate; in
/// practice every ingestion timestamp is representable.
pub fn storage_key(timestamp: DateTime<Utc>, id: &str) -> String {
    let nanos = timestamp.timestamp_nanos_opt().unwrap_or(i64::MAX);
    format!("{}_{}", nanos, id)
}
