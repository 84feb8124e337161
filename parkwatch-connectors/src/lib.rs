//! Bus and Store Connectors for the Telemetry Gateway
//!
//! ## Overview
//!
//! The gateway talks to exactly two external systems:
//!
//! - a **publish/subscribe bus** that field sensors publish telemetry to and
//!   that commands are published back on
//! - a **time-series store** that points are written to and range/statistic
//!   queries are executed against
//!
//! Each is hidden behind a trait so the gateway logic can run against the real
//! thing in production and an in-process double in tests.
//!
//! ```text
//! ┌──────────────┐  MessageBus   ┌────────────────┐  TimeSeriesStore  ┌──────────┐
//! │ MQTT broker  │◀─────────────▶│    Gateway     │──────────────────▶│ InfluxDB │
//! └──────────────┘               └────────────────┘                   └──────────┘
//! ```
//!
//! ### MQTT (`mqtt` feature)
//!
//! **Characteristics:**
//! - One persistent connection, one event loop task
//! - Local fan-out: every `subscribe` call gets its own channel, fed from the
//!   shared event loop by topic-filter matching
//! - Best-effort, at-most-once from the gateway's point of view; broker QoS is
//!   configurable but nothing here retries a lost message
//!
//! ### InfluxDB v2 (`influx` feature)
//!
//! **Characteristics:**
//! - Plain HTTP via `ureq`, moved off the async runtime with
//!   `spawn_blocking`
//! - Writes are line protocol, one request per point, fire-and-forget
//! - Queries are Flux; the CSV response is decoded row by row and streamed
//!   back lazily
//!
//! ### In-memory
//!
//! [`memory::MemoryBus`] and [`memory::MemoryStore`] implement the same traits
//! in-process. They record everything published/written so tests can assert
//! on it, and the store can be scripted with query responses.
//!
//! ## Connector Design Patterns
//!
//! ### 1. Fire-and-forget writes
//!
//! `write_point` never blocks the caller and never reports failure back. A
//! failed write is logged and counted in [`ConnectionStats`]; batching, if
//! any, is the store client's business.
//!
//! ### 2. Lazy row streams
//!
//! `query_rows` returns a [`RowStream`]. Nothing hits the network until the
//! stream is first polled, and dropping the stream abandons the query.
//!
//! ### 3. Retry logic
//!
//! The MQTT event loop reconnects with exponential backoff:
//! ```text
//! retry_delay = min(2^(errors-1), 30) seconds
//! ```
//! After too many consecutive failures the bus is declared unreachable and
//! every subscription is closed, which is the signal for process-level
//! shutdown handling.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use parkwatch_connectors::{MessageBus, mqtt::{MqttBus, MqttConfig}};
//!
//! # async fn example() -> Result<(), parkwatch_connectors::ConnectorError> {
//! let bus = MqttBus::connect(MqttConfig::new("broker.local", 1883).client_id("gateway-1")).await?;
//!
//! let mut telemetry = bus.subscribe("things/+/shadow/update").await?;
//! while let Some(message) = telemetry.recv().await {
//!     println!("{} -> {} bytes", message.topic, message.payload.len());
//! }
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "mqtt")]
pub mod mqtt;

#[cfg(feature = "influx")]
pub mod influx;

pub mod memory;
mod subscribers;

// Re-export common types
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttBus, MqttConfig};

#[cfg(feature = "influx")]
pub use influx::{InfluxConfig, InfluxStore};

pub use memory::{MemoryBus, MemoryStore};

use futures::stream::BoxStream;
use parkwatch_core::{Point, Row};
use thiserror::Error;
use tokio::sync::mpsc;

/// Common connector errors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    Closed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Query execution failed: {0}")]
    Query(String),
}

/// Lazy stream of query result rows
///
/// A mid-stream `Err` is terminal: no rows follow it.
pub type RowStream = BoxStream<'static, Result<Row, ConnectorError>>;

/// One message received from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Receiving end of a bus subscription
///
/// Messages arrive in bus-delivery order. `recv` returns `None` once the bus
/// is shut down or declared unreachable.
#[derive(Debug)]
pub struct Subscription {
    filter: String,
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    pub(crate) fn new(filter: impl Into<String>, rx: mpsc::Receiver<BusMessage>) -> Self {
        Self {
            filter: filter.into(),
            rx,
        }
    }

    /// Topic filter this subscription was created with
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Wait for the next message
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Take a message if one is already queued
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

/// Publish/subscribe message bus
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    /// Subscribe to an MQTT-style topic filter (`+` and `#` wildcards)
    async fn subscribe(&self, filter: &str) -> Result<Subscription, ConnectorError>;

    /// Publish a payload
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ConnectorError>;

    /// Close the connection; every subscription ends
    async fn shutdown(&self);

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Get connection statistics
    fn stats(&self) -> ConnectionStats;
}

/// Time-series store
pub trait TimeSeriesStore: Send + Sync {
    /// Write a point; failures are logged, not returned
    fn write_point(&self, point: Point);

    /// Execute a query, streaming rows back lazily
    fn query_rows(&self, query: &str) -> RowStream;

    /// Get connection statistics
    fn stats(&self) -> ConnectionStats;
}

/// Connection statistics common to all connectors
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Total messages sent successfully
    pub messages_sent: u64,
    /// Total messages received
    pub messages_received: u64,
    /// Total messages failed to send
    pub messages_failed: u64,
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Number of reconnections
    pub reconnections: u32,
    /// Last error message
    pub last_error: Option<String>,
}

impl ConnectionStats {
    pub(crate) fn record_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub(crate) fn record_failure(&mut self, error: impl ToString) {
        self.messages_failed += 1;
        self.last_error = Some(error.to_string());
    }
}

/// MQTT topic-filter matching
///
/// `+` matches one level, a trailing `#` matches any number of levels
/// (including none). Wildcards in the first level never match topics starting
/// with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether some topic matches both MQTT filters
///
/// A broker delivers such a topic once per matching subscription, so local
/// consumers of both filters would see it twice.
pub fn filters_overlap(a: &str, b: &str) -> bool {
    let wildcard_first = |filter: &str| filter.starts_with('+') || filter.starts_with('#');
    if (wildcard_first(a) && b.starts_with('$')) || (wildcard_first(b) && a.starts_with('$')) {
        return false;
    }

    let mut a_levels = a.split('/');
    let mut b_levels = b.split('/');

    loop {
        match (a_levels.next(), b_levels.next()) {
            (Some("#"), _) | (_, Some("#")) => return true,
            (None, None) => return true,
            (Some(x), Some(y)) if x == y || x == "+" || y == "+" => continue,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_filters() {
        assert!(filters_overlap("things/#", "things/+/shadow/update"));
        assert!(filters_overlap("things/+/shadow/update", "things/dev1/+/update"));
        assert!(filters_overlap("things/dev1", "things/dev1"));
        assert!(filters_overlap("things/#", "things"));
        assert!(filters_overlap("#", "things/dev1"));
    }

    #[test]
    fn disjoint_filters() {
        assert!(!filters_overlap("things/+/shadow/update", "things/+/commands"));
        assert!(!filters_overlap("things/+", "things/+/shadow"));
        assert!(!filters_overlap("sensors/#", "things/#"));
        assert!(!filters_overlap("#", "$aws/things/#"));
    }

    #[test]
    fn exact_and_single_level() {
        assert!(topic_matches("things/dev1/shadow/update", "things/dev1/shadow/update"));
        assert!(topic_matches("things/+/shadow/update", "things/dev1/shadow/update"));
        assert!(!topic_matches("things/+/shadow/update", "things/dev1/shadow/delta"));
        assert!(!topic_matches("things/+", "things/dev1/shadow"));
    }

    #[test]
    fn multi_level() {
        assert!(topic_matches("things/#", "things/dev1/shadow/update"));
        assert!(topic_matches("things/#", "things"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("things/#", "sensors/dev1"));
    }

    #[test]
    fn dollar_topics_need_explicit_prefix() {
        assert!(!topic_matches("#", "$aws/things/dev1/shadow/update"));
        assert!(!topic_matches("+/things/#", "$aws/things/dev1"));
        assert!(topic_matches("$aws/things/+/shadow/update", "$aws/things/dev1/shadow/update"));
    }

    #[test]
    fn stats_recording() {
        let mut stats = ConnectionStats::default();
        stats.record_sent(10);
        stats.record_failure("boom");
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.bytes_sent, 10);
        assert_eq!(stats.messages_failed, 1);
        assert_eq!(stats.last_error.as_deref(), Some("boom"));
    }
}
