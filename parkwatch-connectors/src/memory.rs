//! In-process bus and store
//!
//! Both record what passes through them so tests can assert on traffic
//! without a broker or database.

use std::collections::VecDeque;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use parkwatch_core::{Point, Row};

use crate::subscribers::SubscriberSet;
use crate::{
    BusMessage, ConnectionStats, ConnectorError, MessageBus, RowStream, Subscription,
    TimeSeriesStore,
};

const DEFAULT_CAPACITY: usize = 1024;

/// Loopback message bus
///
/// Everything published is recorded and delivered to matching local
/// subscriptions, the same fan-out the MQTT bus does for broker traffic.
pub struct MemoryBus {
    subscribers: SubscriberSet,
    published: Mutex<Vec<BusMessage>>,
    stats: Mutex<ConnectionStats>,
    capacity: usize,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus whose subscriptions buffer at most `capacity` messages
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: SubscriberSet::default(),
            published: Mutex::new(Vec::new()),
            stats: Mutex::new(ConnectionStats::default()),
            capacity,
        }
    }

    /// Every message published so far, in order
    pub fn published(&self) -> Vec<BusMessage> {
        self.published.lock().clone()
    }

    /// Published messages whose topic equals `topic`
    pub fn published_to(&self, topic: &str) -> Vec<BusMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// End every subscription, as a lost broker would
    pub fn close(&self) {
        self.subscribers.close();
    }
}

#[async_trait::async_trait]
impl MessageBus for MemoryBus {
    async fn subscribe(&self, filter: &str) -> Result<Subscription, ConnectorError> {
        self.subscribers.add(filter, self.capacity)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ConnectorError> {
        if self.subscribers.is_closed() {
            self.stats.lock().record_failure("bus closed");
            return Err(ConnectorError::Closed);
        }

        let message = BusMessage::new(topic, payload);
        self.stats.lock().record_sent(message.payload.len());
        self.published.lock().push(message.clone());

        let delivered = self.subscribers.deliver(&message).await;
        self.stats.lock().messages_received += delivered as u64;
        Ok(())
    }

    async fn shutdown(&self) {
        self.close();
    }

    fn is_connected(&self) -> bool {
        !self.subscribers.is_closed()
    }

    fn stats(&self) -> ConnectionStats {
        self.stats.lock().clone()
    }
}

enum ScriptedResponse {
    Items(Vec<Result<Row, ConnectorError>>),
    Hang,
}

/// Recording store with scripted query responses
///
/// Each `query_rows` call consumes the oldest scripted response; with none
/// left the query returns an empty stream.
#[derive(Default)]
pub struct MemoryStore {
    points: Mutex<Vec<Point>>,
    queries: Mutex<Vec<String>>,
    responses: Mutex<VecDeque<ScriptedResponse>>,
    stats: Mutex<ConnectionStats>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next query to yield these rows and complete
    pub fn push_rows(&self, rows: Vec<Row>) {
        self.push_response(rows.into_iter().map(Ok).collect());
    }

    /// Script the next query to yield exactly these items
    pub fn push_response(&self, items: Vec<Result<Row, ConnectorError>>) {
        self.responses.lock().push_back(ScriptedResponse::Items(items));
    }

    /// Script the next query to never produce anything
    pub fn push_hanging_response(&self) {
        self.responses.lock().push_back(ScriptedResponse::Hang);
    }

    /// Points written so far, in write order
    pub fn points(&self) -> Vec<Point> {
        self.points.lock().clone()
    }

    /// Query strings executed so far, in call order
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

impl TimeSeriesStore for MemoryStore {
    fn write_point(&self, point: Point) {
        self.stats.lock().record_sent(point.to_line_protocol().len());
        self.points.lock().push(point);
    }

    fn query_rows(&self, query: &str) -> RowStream {
        self.queries.lock().push(query.to_string());
        match self.responses.lock().pop_front() {
            Some(ScriptedResponse::Items(items)) => stream::iter(items).boxed(),
            Some(ScriptedResponse::Hang) => stream::pending().boxed(),
            None => stream::empty().boxed(),
        }
    }

    fn stats(&self) -> ConnectionStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parkwatch_core::{FieldValue, Scalar};

    fn row(value: i64) -> Row {
        Row {
            device: Some("dev1".into()),
            measurement: "telemetry".into(),
            field: "co2".into(),
            value: Scalar::Integer(value),
            time: 1_000,
        }
    }

    #[tokio::test]
    async fn bus_records_and_delivers() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("things/+/shadow/update").await.unwrap();

        bus.publish("things/dev1/shadow/update", b"a".to_vec()).await.unwrap();
        bus.publish("things/dev1/commands", b"b".to_vec()).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().payload, b"a");
        assert!(sub.try_recv().is_none());
        assert_eq!(bus.published().len(), 2);
        assert_eq!(bus.published_to("things/dev1/commands").len(), 1);
        assert_eq!(bus.stats().messages_sent, 2);
    }

    #[tokio::test]
    async fn closed_bus_rejects_publish() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("#").await.unwrap();
        bus.close();

        assert!(sub.recv().await.is_none());
        assert!(!bus.is_connected());
        assert!(matches!(
            bus.publish("a", vec![]).await,
            Err(ConnectorError::Closed)
        ));
    }

    #[tokio::test]
    async fn store_replays_scripted_responses_in_order() {
        let store = MemoryStore::new();
        store.push_rows(vec![row(1), row(2)]);
        store.push_response(vec![Ok(row(3)), Err(ConnectorError::Query("boom".into()))]);

        let first: Vec<_> = store.query_rows("q1").collect().await;
        assert_eq!(first.len(), 2);

        let second: Vec<_> = store.query_rows("q2").collect().await;
        assert!(second[0].is_ok());
        assert!(second[1].is_err());

        let third: Vec<_> = store.query_rows("q3").collect().await;
        assert!(third.is_empty());

        assert_eq!(store.queries(), vec!["q1", "q2", "q3"]);
    }

    #[test]
    fn store_records_points() {
        let store = MemoryStore::new();
        store.write_point(Point::new("telemetry", 5).field("co2", FieldValue::Integer(400)));
        assert_eq!(store.points().len(), 1);
        assert_eq!(store.stats().messages_sent, 1);
    }
}
