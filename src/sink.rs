// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Downstream sink integration.
//!
//! Defines the narrow producer interface the sync worker writes through,
//! plus the Kafka implementation. The trait keeps the sync worker decoupled
//! from librdkafka and makes test mocks trivial.
//!
//! # Message Shape
//!
//! Each buffered event becomes one message: `key = event.id`,
//! `value = JSON(event)`, headers `operation` and `timestamp` (RFC 3339).

use crate::config::KafkaConfig;
use crate::error::{RelayError, Result};
use crate::event::Event;
use chrono::SecondsFormat;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A serialized message ready for the downstream log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkMessage {
    /// Partition key.
    pub key: Vec<u8>,
    /// Serialized event payload.
    pub value: Vec<u8>,
    /// Message headers.
    pub headers: Vec<(String, Vec<u8>)>,
}

/// Serialize an event into its downstream message form.
pub fn encode_event(event: &Event) -> Result<SinkMessage> {
    let value = serde_json::to_vec(event)?;
    Ok(SinkMessage {
        key: event.id.clone().into_bytes(),
        value,
        headers: vec![
            (
                "operation".to_string(),
                event.operation.as_str().as_bytes().to_vec(),
            ),
            (
                "timestamp".to_string(),
                event
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::Secs, true)
                    .into_bytes(),
            ),
        ],
    })
}

/// The producer-side capability the sync worker needs.
///
/// `write` delivers a whole batch or fails; partial delivery inside a failed
/// batch is possible and covered by at-least-once redelivery. `close`
/// flushes in-flight messages.
pub trait EventSink: Send + Sync + 'static {
    /// Write a batch of messages, returning once every message is acked.
    fn write(&self, messages: Vec<SinkMessage>) -> BoxFuture<'_, ()>;

    /// Flush in-flight messages and release the producer.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Map the numeric acks setting onto the producer's `acks` property.
/// Unknown values fall back to leader acks.
fn acks_property(acks: i32) -> &'static str {
    match acks {
        0 => "0",
        1 => "1",
        -1 => "all",
        _ => "1",
    }
}

/// Validate the compression codec name. Unknown codecs fall back to snappy.
fn compression_property(codec: &str) -> &'static str {
    match codec {
        "none" => "none",
        "gzip" => "gzip",
        "snappy" => "snappy",
        "lz4" => "lz4",
        "zstd" => "zstd",
        _ => "snappy",
    }
}

/// Kafka producer sink.
pub struct KafkaSink {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaSink {
    /// Build the producer from config. Fails only on malformed producer
    /// properties; broker reachability is probed separately by the
    /// connectivity monitor.
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("message.timeout.ms", config.timeout.as_millis().to_string())
            .set("acks", acks_property(config.acks))
            .set(
                "compression.codec",
                compression_property(&config.compression),
            )
            .set("batch.num.messages", config.batch_size.to_string())
            .set("linger.ms", config.batch_timeout.as_millis().to_string())
            .set(
                "message.max.bytes",
                config.max_message_bytes.to_string(),
            )
            .create()
            .map_err(|e| RelayError::kafka("create producer", e.to_string()))?;

        info!(
            brokers = %config.brokers.join(","),
            topic = %config.topic,
            acks = acks_property(config.acks),
            compression = compression_property(&config.compression),
            "Kafka producer created"
        );

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            timeout: config.timeout,
        })
    }
}

impl EventSink for KafkaSink {
    fn write(&self, messages: Vec<SinkMessage>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let deliveries = messages.iter().map(|msg| {
                let mut headers = OwnedHeaders::new_with_capacity(msg.headers.len());
                for (key, value) in &msg.headers {
                    headers = headers.insert(Header {
                        key: key.as_str(),
                        value: Some(value.as_slice()),
                    });
                }

                let record = FutureRecord::to(&self.topic)
                    .key(&msg.key)
                    .payload(&msg.value)
                    .headers(headers);

                self.producer.send(record, Timeout::After(self.timeout))
            });

            let results = futures::future::join_all(deliveries).await;
            for result in results {
                if let Err((e, _unsent)) = result {
                    return Err(RelayError::kafka("write", e.to_string()));
                }
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.producer
                .flush(Timeout::After(self.timeout))
                .map_err(|e| RelayError::kafka("flush", e.to_string()))?;
            info!("Kafka producer flushed and closed");
            Ok(())
        })
    }
}

/// A no-op sink for standalone mode and tests.
///
/// Logs writes and succeeds without delivering anywhere.
#[derive(Clone, Default)]
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn write(&self, messages: Vec<SinkMessage>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            debug!(count = messages.len(), "NoOp: would write messages");
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            debug!("NoOp: close");
            Ok(())
        })
    }
}
