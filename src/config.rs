//! Configuration for the CDC relay.
//!
//! Configuration is loaded from environment variables with defaults suitable
//! for local development; unparseable values fall back to their defaults.
//! All structs are serde-able so a config snapshot can be logged or dumped.
//!
//! # Structure
//!
//! ```text
//! RelayConfig
//! ├── mongodb: MongoConfig    # upstream change stream target
//! ├── kafka: KafkaConfig      # downstream producer + broker list
//! ├── buffer: BufferConfig    # durable queue file and scan sizes
//! ├── monitor: MonitorConfig  # connectivity probe cadence
//! └── sync: SyncConfig        # drain ticker and retry policy knobs
//! ```
//!
//! # Environment
//!
//! | Variable | Default |
//! |---|---|
//! | `MONGODB_URI` | `mongodb://localhost:27017` |
//! | `MONGODB_DATABASE` / `MONGODB_COLLECTION` | `testdb` / `events` |
//! | `KAFKA_BROKERS` | `localhost:9092` (comma-separated) |
//! | `KAFKA_TOPIC` | `cdc-events` |
//! | `KAFKA_RETRIES` | `3` |
//! | `KAFKA_ACKS` | `1` (`0`, `1` or `-1`) |
//! | `KAFKA_COMPRESSION` | `snappy` |
//! | `KAFKA_TIMEOUT` | `30s` |
//! | `KAFKA_BATCH_SIZE` / `KAFKA_BATCH_TIMEOUT` | `1000` / `10ms` |
//! | `KAFKA_MAX_MESSAGE_BYTES` | `1000000` |
//! | `BUFFER_PATH` | `./buffer.db` |
//! | `BUFFER_BATCH_SIZE` | `500` |
//! | `BUFFER_MAX_SIZE` | `10000` |
//! | `READY_WINDOW` | `0s` |
//! | `MONITOR_INTERVAL` | `30s` |
//! | `CONNECT_TIMEOUT` | `10s` |
//! | `SYNC_INTERVAL` | `1s` |
//! | `SYNC_BATCHES_PER_TICK` | `3` |

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// The top-level relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub mongodb: MongoConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl RelayConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            mongodb: MongoConfig::from_env(),
            kafka: KafkaConfig::from_env(),
            buffer: BufferConfig::from_env(),
            monitor: MonitorConfig::from_env(),
            sync: SyncConfig::from_env(),
        }
    }
}

/// Upstream change stream target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoConfig {
    /// MongoDB connection string.
    pub uri: String,
    /// Database holding the watched collection.
    pub database: String,
    /// Collection whose change stream is consumed.
    pub collection: String,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database: "testdb".to_string(),
            collection: "events".to_string(),
        }
    }
}

impl MongoConfig {
    fn from_env() -> Self {
        Self {
            uri: env_str("MONGODB_URI", "mongodb://localhost:27017"),
            database: env_str("MONGODB_DATABASE", "testdb"),
            collection: env_str("MONGODB_COLLECTION", "events"),
        }
    }
}

/// Downstream producer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Broker list.
    pub brokers: Vec<String>,
    /// Target topic.
    pub topic: String,
    /// Max write attempts per batch before bumping event retry counters.
    pub retries: u32,
    /// Required acks: 0 = none, 1 = leader, -1 = all.
    pub acks: i32,
    /// Compression codec: none | gzip | snappy | lz4 | zstd.
    pub compression: String,
    /// Per-write delivery timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Producer batching hint (messages per request).
    pub batch_size: usize,
    /// Producer linger hint.
    #[serde(with = "humantime_serde")]
    pub batch_timeout: Duration,
    /// Producer message size cap hint.
    pub max_message_bytes: usize,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            topic: "cdc-events".to_string(),
            retries: 3,
            acks: 1,
            compression: "snappy".to_string(),
            timeout: Duration::from_secs(30),
            batch_size: 1000,
            batch_timeout: Duration::from_millis(10),
            max_message_bytes: 1_000_000,
        }
    }
}

impl KafkaConfig {
    fn from_env() -> Self {
        Self {
            brokers: env_str("KAFKA_BROKERS", "localhost:9092")
                .split(',')
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .collect(),
            topic: env_str("KAFKA_TOPIC", "cdc-events"),
            retries: env_parse("KAFKA_RETRIES", 3),
            acks: env_parse("KAFKA_ACKS", 1),
            compression: env_str("KAFKA_COMPRESSION", "snappy"),
            timeout: env_duration("KAFKA_TIMEOUT", Duration::from_secs(30)),
            batch_size: env_parse("KAFKA_BATCH_SIZE", 1000),
            batch_timeout: env_duration("KAFKA_BATCH_TIMEOUT", Duration::from_millis(10)),
            max_message_bytes: env_parse("KAFKA_MAX_MESSAGE_BYTES", 1_000_000),
        }
    }

    /// Create a config for tests (unroutable broker, fast timeout).
    pub fn for_testing() -> Self {
        Self {
            brokers: vec!["127.0.0.1:1".to_string()],
            timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }
}

/// Durable buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Path of the SQLite buffer file.
    pub path: String,
    /// Rows fetched per drain scan.
    pub batch_size: usize,
    /// Soft depth threshold; crossing it triggers the health warning.
    /// Advisory only - the buffer itself is unbounded.
    pub max_size: usize,
    /// Early-release slack for scheduled events. Zero means strict
    /// scheduled delivery.
    #[serde(with = "humantime_serde")]
    pub ready_window: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            path: "./buffer.db".to_string(),
            batch_size: 500,
            max_size: 10_000,
            ready_window: Duration::ZERO,
        }
    }
}

impl BufferConfig {
    fn from_env() -> Self {
        Self {
            path: env_str("BUFFER_PATH", "./buffer.db"),
            batch_size: env_parse("BUFFER_BATCH_SIZE", 500),
            max_size: env_parse("BUFFER_MAX_SIZE", 10_000),
            ready_window: env_duration("READY_WINDOW", Duration::ZERO),
        }
    }
}

/// Connectivity probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Probe cadence.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// TCP connect timeout per broker.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl MonitorConfig {
    fn from_env() -> Self {
        Self {
            interval: env_duration("MONITOR_INTERVAL", Duration::from_secs(30)),
            connect_timeout: env_duration("CONNECT_TIMEOUT", Duration::from_secs(10)),
        }
    }

    /// Fast cadence for tests.
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(200),
        }
    }
}

/// Drain loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Drain ticker cadence.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Max batches attempted per tick; the loop stops early on the first
    /// error to avoid cascading failures.
    pub batches_per_tick: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batches_per_tick: 3,
        }
    }
}

impl SyncConfig {
    fn from_env() -> Self {
        Self {
            interval: env_duration("SYNC_INTERVAL", Duration::from_secs(1)),
            batches_per_tick: env_parse("SYNC_BATCHES_PER_TICK", 3),
        }
    }

    /// Fast cadence for tests.
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(20),
            batches_per_tick: 3,
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_duration(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| humantime::parse_duration(&v).ok())
        .unwrap_or(default)
}

/// Serde adapter rendering `Duration` fields as humantime strings.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
