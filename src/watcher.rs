// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Upstream change stream consumer.
//!
//! Opens a change stream cursor against the configured collection with
//! full-document-on-update lookup, translates every record into an
//! [`Event`], and stores it in the buffer.
//!
//! # Error Tolerance
//!
//! Per-record translation or store failures log and continue - a single bad
//! record never aborts the stream. Losing the cursor itself is fatal for
//! this component: the error surfaces to the service, which logs it; a
//! process restart resumes from the persisted resume token.
//!
//! # Resume Tokens
//!
//! After each handled record the stream's resume token is persisted next to
//! the buffered events. A crash between store and token save causes the
//! record to be re-read on restart, which at-least-once delivery absorbs.
//!
//! # Scheduled Delivery
//!
//! Documents may carry a `requestedReadyTime` field (RFC 3339). When
//! present and parseable it becomes the event's `ready_at`; the buffer's
//! readiness scan holds the event back until the window opens.

use crate::buffer::EventBuffer;
use crate::config::MongoConfig;
use crate::error::{RelayError, Result};
use crate::event::{Event, Operation};
use crate::metrics;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mongodb::bson::{Bson, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::options::FullDocumentType;
use mongodb::{Client, Collection};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Consumes the upstream change stream and feeds the buffer.
pub struct UpstreamWatcher {
    client: Client,
    collection: Collection<Document>,
    buffer: Arc<EventBuffer>,
}

impl UpstreamWatcher {
    /// Connect the upstream client. Fails fast on a malformed URI; actual
    /// reachability is verified when the stream opens.
    pub async fn connect(config: &MongoConfig, buffer: Arc<EventBuffer>) -> Result<Self> {
        let client = Client::with_uri_str(&config.uri)
            .await
            .map_err(|e| RelayError::change_stream("connect", e.to_string()))?;
        let collection = client
            .database(&config.database)
            .collection::<Document>(&config.collection);

        info!(
            database = %config.database,
            collection = %config.collection,
            "Upstream client connected"
        );

        Ok(Self {
            client,
            collection,
            buffer,
        })
    }

    /// Tail the change stream until shutdown or cursor loss.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let resume_token = self.load_resume_token().await;

        let mut watch = self
            .collection
            .watch()
            .full_document(FullDocumentType::UpdateLookup);
        if let Some(token) = resume_token {
            info!("Resuming change stream from persisted token");
            watch = watch.resume_after(token);
        }

        let mut stream = watch
            .await
            .map_err(|e| RelayError::change_stream("open", e.to_string()))?;

        info!("Change stream opened");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                next = stream.next() => match next {
                    Some(Ok(change)) => {
                        self.handle_change(change).await;
                        if let Some(token) = stream.resume_token() {
                            self.save_resume_token(&token).await;
                        }
                    }
                    Some(Err(e)) => {
                        // Cursor loss is fatal for this component.
                        return Err(RelayError::change_stream("next", e.to_string()));
                    }
                    None => {
                        warn!("Change stream ended");
                        break;
                    }
                },
            }
        }

        Ok(())
    }

    async fn handle_change(&self, change: ChangeStreamEvent<Document>) {
        let Some(event) = translate_change(&change) else {
            debug!(operation = ?change.operation_type, "Skipping non-relayed change");
            return;
        };

        match self.buffer.store(&event).await {
            Ok(()) => {
                metrics::record_event_stored(event.operation.as_str());
                match event.ready_at {
                    Some(ready_at) => debug!(
                        id = %event.id,
                        operation = %event.operation,
                        ready_at = %ready_at,
                        "Stored scheduled change event"
                    ),
                    None => debug!(
                        id = %event.id,
                        operation = %event.operation,
                        "Stored change event"
                    ),
                }
            }
            Err(e) => {
                // Best-effort source contract: the event is dropped.
                error!(id = %event.id, error = %e, "Failed to store change event, dropping");
                metrics::record_event_dropped("store");
            }
        }
    }

    async fn load_resume_token(&self) -> Option<ResumeToken> {
        match self.buffer.load_resume_token().await {
            Ok(Some(raw)) => match serde_json::from_str::<ResumeToken>(&raw) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(error = %e, "Persisted resume token unreadable, starting fresh");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to load resume token, starting fresh");
                None
            }
        }
    }

    async fn save_resume_token(&self, token: &ResumeToken) {
        match serde_json::to_string(token) {
            Ok(raw) => {
                if let Err(e) = self.buffer.save_resume_token(&raw).await {
                    warn!(error = %e, "Failed to persist resume token");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize resume token"),
        }
    }

    /// Shut down the upstream client.
    pub async fn close(&self) {
        self.client.clone().shutdown().await;
        info!("Upstream client closed");
    }
}

/// Translate a change-stream record into a buffered event.
///
/// Returns `None` for operations outside the relayed set (drop, rename,
/// etc.). The ingestion timestamp is taken here, not from the upstream
/// cluster time.
pub(crate) fn translate_change(change: &ChangeStreamEvent<Document>) -> Option<Event> {
    let operation = map_operation(&change.operation_type)?;
    let ready_at = change
        .full_document
        .as_ref()
        .and_then(extract_requested_ready_time);

    let mut data = Map::new();
    if let Some(key) = &change.document_key {
        data.insert(
            "documentKey".to_string(),
            Bson::Document(key.clone()).into_relaxed_extjson(),
        );
    }
    if let Some(doc) = &change.full_document {
        data.insert(
            "fullDocument".to_string(),
            Bson::Document(doc.clone()).into_relaxed_extjson(),
        );
    }
    if let Some(ts) = &change.cluster_time {
        data.insert(
            "clusterTime".to_string(),
            serde_json::json!({ "t": ts.time, "i": ts.increment }),
        );
    }
    data.insert(
        "operationType".to_string(),
        Value::String(operation.as_str().to_string()),
    );

    Some(Event::new(
        change_event_id(&change.id),
        operation,
        Utc::now(),
        data,
        ready_at,
    ))
}

fn map_operation(op: &OperationType) -> Option<Operation> {
    match op {
        OperationType::Insert => Some(Operation::Insert),
        OperationType::Update => Some(Operation::Update),
        OperationType::Delete => Some(Operation::Delete),
        OperationType::Replace => Some(Operation::Replace),
        OperationType::Invalidate => Some(Operation::Invalidate),
        _ => None,
    }
}

/// String form of the change event's native id (its resume token). Uses the
/// `_data` payload when present, the whole token document otherwise.
fn change_event_id(token: &ResumeToken) -> String {
    match mongodb::bson::to_document(token) {
        Ok(doc) => match doc.get_str("_data") {
            Ok(data) => data.to_string(),
            Err(_) => doc.to_string(),
        },
        Err(_) => format!("{:?}", token),
    }
}

/// Extract `requestedReadyTime` from the full document when present and
/// parseable as RFC 3339. Anything else means "immediately eligible".
fn extract_requested_ready_time(doc: &Document) -> Option<DateTime<Utc>> {
    let raw = doc.get_str("requestedReadyTime").ok()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{doc, from_document, Timestamp};

    fn change_doc(operation: &str) -> Document {
        doc! {
            "_id": { "_data": "8264ABCDEF" },
            "operationType": operation,
            "clusterTime": Bson::Timestamp(Timestamp { time: 1_700_000_000, increment: 3 }),
            "ns": { "db": "testdb", "coll": "events" },
            "documentKey": { "_id": "doc-42" },
            "fullDocument": { "_id": "doc-42", "payload": "hello" },
        }
    }

    fn parse_change(raw: Document) -> ChangeStreamEvent<Document> {
        from_document(raw).unwrap()
    }

    #[test]
    fn test_translate_insert() {
        let change = parse_change(change_doc("insert"));
        let event = translate_change(&change).unwrap();

        assert_eq!(event.id, "8264ABCDEF");
        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.retries, 0);
        assert!(event.ready_at.is_none());

        assert_eq!(
            event.data.get("operationType"),
            Some(&Value::String("insert".to_string()))
        );
        let key = event.data.get("documentKey").unwrap();
        assert_eq!(key["_id"], Value::String("doc-42".to_string()));
        let full = event.data.get("fullDocument").unwrap();
        assert_eq!(full["payload"], Value::String("hello".to_string()));
        let cluster = event.data.get("clusterTime").unwrap();
        assert_eq!(cluster["t"], serde_json::json!(1_700_000_000u32));
    }

    #[test]
    fn test_translate_all_relayed_operations() {
        for (name, expected) in [
            ("insert", Operation::Insert),
            ("update", Operation::Update),
            ("delete", Operation::Delete),
            ("replace", Operation::Replace),
        ] {
            let mut raw = change_doc(name);
            if name == "delete" {
                // Delete records carry no full document.
                raw.remove("fullDocument");
            }
            let event = translate_change(&parse_change(raw)).unwrap();
            assert_eq!(event.operation, expected, "operation {}", name);
        }
    }

    #[test]
    fn test_translate_skips_unrelayed_operation() {
        let mut raw = change_doc("drop");
        raw.remove("fullDocument");
        raw.remove("documentKey");
        let change = parse_change(raw);
        assert!(translate_change(&change).is_none());
    }

    #[test]
    fn test_ready_at_parsed_from_full_document() {
        let mut raw = change_doc("insert");
        raw.get_document_mut("fullDocument")
            .unwrap()
            .insert("requestedReadyTime", "2030-05-01T10:30:00Z");

        let event = translate_change(&parse_change(raw)).unwrap();
        let ready_at = event.ready_at.unwrap();
        assert_eq!(ready_at.to_rfc3339(), "2030-05-01T10:30:00+00:00");
    }

    #[test]
    fn test_ready_at_ignored_when_unparseable() {
        let mut raw = change_doc("insert");
        raw.get_document_mut("fullDocument")
            .unwrap()
            .insert("requestedReadyTime", "next tuesday");

        let event = translate_change(&parse_change(raw)).unwrap();
        assert!(event.ready_at.is_none());
    }

    #[test]
    fn test_ready_at_ignored_when_not_a_string() {
        let mut raw = change_doc("insert");
        raw.get_document_mut("fullDocument")
            .unwrap()
            .insert("requestedReadyTime", 12345i64);

        let event = translate_change(&parse_change(raw)).unwrap();
        assert!(event.ready_at.is_none());
    }

    #[test]
    fn test_extract_requested_ready_time_roundtrip_offset() {
        let doc = doc! { "requestedReadyTime": "2030-05-01T12:30:00+02:00" };
        let parsed = extract_requested_ready_time(&doc).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2030-05-01T10:30:00+00:00");
    }
}
