//! Caller-facing telemetry operations
//!
//! [`TelemetryService`] is the boundary the rest of the application calls:
//! property history and statistics come from the store, button presses and
//! command acknowledgements come from the correlator, commands go out on the
//! bus. Every failure is a [`ServiceError`] with an HTTP-equivalent status.
//!
//! Both suspension points (correlation waits and query reads) are cancelled
//! by dropping the returned future, e.g. under a caller's own
//! `tokio::time::timeout`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use parkwatch_connectors::{ConnectorError, MessageBus, TimeSeriesStore};
use parkwatch_core::query::{basic_range_query, statistical_query};
use parkwatch_core::time::{TimeSource, Timestamp};
use parkwatch_core::{Aggregation, ChannelRegistry, MessageType, QuerySpec, Row, TelemetryMessage};
use parkwatch_scoring::RatingProfile;
use serde_json::Value;

use crate::aggregator::RowAggregator;
use crate::config::{GatewayConfig, RoutingSection};
use crate::correlator::EventCorrelator;
use crate::error::ServiceError;

/// Query, correlation and command operations for one gateway
pub struct TelemetryService {
    bus: Arc<dyn MessageBus>,
    correlator: Arc<EventCorrelator>,
    aggregator: RowAggregator,
    clock: Arc<dyn TimeSource>,
    registry: ChannelRegistry,
    routing: RoutingSection,
    bucket: String,
    button_app_id: String,
    ratings: HashMap<String, RatingProfile>,
}

impl TelemetryService {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn TimeSeriesStore>,
        correlator: Arc<EventCorrelator>,
        clock: Arc<dyn TimeSource>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            bus,
            correlator,
            aggregator: RowAggregator::new(store),
            clock,
            registry: config.routing.registry(),
            routing: config.routing.clone(),
            bucket: config.influx.bucket.clone(),
            button_app_id: config.correlation.button_app_id.clone(),
            ratings: config.ratings.clone(),
        }
    }

    pub fn aggregator(&self) -> &RowAggregator {
        &self.aggregator
    }

    /// Store field for a property given as either `appId` or field name
    pub fn property_field(&self, property: &str) -> Result<&str, ServiceError> {
        if let Some(spec) = self.registry.get(property) {
            return Ok(&spec.field);
        }
        self.registry
            .iter()
            .find(|(_, spec)| spec.field == property)
            .map(|(_, spec)| spec.field.as_str())
            .ok_or_else(|| ServiceError::UnknownProperty(property.to_string()))
    }

    fn spec(&self, device_id: &str, property: &str, interval: &str) -> Result<QuerySpec, ServiceError> {
        let field = self.property_field(property)?;
        Ok(QuerySpec::new(&self.bucket, &self.routing.measurement, field, interval)?.for_device(device_id))
    }

    /// Raw readings of one property over the trailing `interval`
    pub async fn get_property(
        &self,
        device_id: &str,
        property: &str,
        interval: &str,
    ) -> Result<Vec<Row>, ServiceError> {
        let spec = self.spec(device_id, property, interval)?;
        self.aggregator
            .collect(&basic_range_query(&spec))
            .await
            .map_err(ServiceError::Query)
    }

    /// One statistic of a property over the trailing `interval`
    ///
    /// `None` when the interval holds no readings.
    pub async fn get_statistic(
        &self,
        device_id: &str,
        property: &str,
        statistic: Aggregation,
        interval: &str,
    ) -> Result<Option<Row>, ServiceError> {
        let spec = self
            .spec(device_id, property, interval)?
            .with_aggregation(statistic);
        let rows = self
            .aggregator
            .collect(&statistical_query(&spec)?)
            .await
            .map_err(ServiceError::Query)?;

        // The reduction drops the device and measurement columns.
        Ok(rows.into_iter().next().map(|mut row| {
            row.device.get_or_insert_with(|| device_id.to_string());
            if row.measurement.is_empty() {
                row.measurement = spec.measurement().to_string();
            }
            if row.field.is_empty() {
                row.field = spec.field().to_string();
            }
            row
        }))
    }

    /// Mean of a property over `interval`, scored with its rating profile
    pub async fn rate_property(
        &self,
        device_id: &str,
        property: &str,
        interval: &str,
    ) -> Result<Option<f64>, ServiceError> {
        let field = self.property_field(property)?.to_string();
        let profile = self
            .ratings
            .get(&field)
            .ok_or_else(|| ServiceError::NoRatingProfile(field.clone()))?;

        let Some(row) = self
            .get_statistic(device_id, &field, Aggregation::Mean, interval)
            .await?
        else {
            return Ok(None);
        };

        let mean = row.value.as_f64().ok_or_else(|| {
            ServiceError::Query(ConnectorError::Query(format!(
                "mean of {} is not numeric: {:?}",
                field, row.value
            )))
        })?;
        Ok(Some(profile.rate(mean)?))
    }

    /// Wait for the next button press on `device_id`
    ///
    /// Returns the device timestamp of the press, or the instant it was
    /// observed when the device sent none.
    pub async fn await_button_press(
        &self,
        device_id: &str,
        timeout: Duration,
    ) -> Result<Timestamp, ServiceError> {
        let button = self.button_app_id.clone();
        let message = self
            .correlator
            .await_device_event(device_id, move |m| m.is_event_for(&button), timeout)
            .await?;
        Ok(message.ts.unwrap_or_else(|| self.clock.now()))
    }

    /// Publish a `CFG_SET` command to a device
    pub async fn publish_command(
        &self,
        device_id: &str,
        app_id: &str,
        data: Value,
    ) -> Result<(), ServiceError> {
        let message = TelemetryMessage::new(app_id, data)
            .with_type(MessageType::CfgSet)
            .with_ts(self.clock.now());
        let payload = message
            .to_payload()
            .map_err(|e| ServiceError::Payload(e.to_string()))?;
        let topic = self.routing.command_topic_for(device_id);

        self.bus
            .publish(&topic, payload)
            .await
            .map_err(ServiceError::Bus)?;
        info!("Published {} command to {}", app_id, topic);
        Ok(())
    }

    /// Publish a command and wait for the device's `CFG_ACK` for it
    pub async fn publish_command_acked(
        &self,
        device_id: &str,
        app_id: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<TelemetryMessage, ServiceError> {
        let expected = app_id.to_string();
        let pending = self.correlator.watch(device_id, move |m| {
            m.message_type == MessageType::CfgAck && m.app_id == expected
        })?;

        self.publish_command(device_id, app_id, data).await?;
        Ok(pending.wait(timeout).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parkwatch_connectors::{MemoryBus, MemoryStore};
    use parkwatch_core::time::FixedTime;
    use parkwatch_core::Scalar;
    use serde_json::json;

    struct Harness {
        service: TelemetryService,
        bus: Arc<MemoryBus>,
        store: Arc<MemoryStore>,
        correlator: Arc<EventCorrelator>,
    }

    fn harness(config: GatewayConfig) -> Harness {
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryStore::new());
        let correlator = Arc::new(EventCorrelator::new());
        let service = TelemetryService::new(
            bus.clone(),
            store.clone(),
            correlator.clone(),
            Arc::new(FixedTime::new(9_000)),
            &config,
        );
        Harness {
            service,
            bus,
            store,
            correlator,
        }
    }

    fn mean_row(value: f64) -> Row {
        Row {
            device: None,
            measurement: String::new(),
            field: "temperature".into(),
            value: Scalar::Float(value),
            time: 0,
        }
    }

    #[test]
    fn property_lookup_by_app_id_or_field() {
        let h = harness(GatewayConfig::default());
        assert_eq!(h.service.property_field("TEMP").unwrap(), "temperature");
        assert_eq!(h.service.property_field("co2").unwrap(), "co2");
        assert_eq!(h.service.property_field("pressure").unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn get_property_builds_device_range_query() {
        let h = harness(GatewayConfig::default());
        h.store.push_rows(vec![mean_row(21.0)]);

        let rows = h.service.get_property("dev1", "TEMP", "2h").await.unwrap();
        assert_eq!(rows.len(), 1);

        let query = &h.store.queries()[0];
        assert!(query.contains("range(start: -2h)"));
        assert!(query.contains("r._field == \"temperature\""));
        assert!(query.contains("r.device == \"dev1\""));
    }

    #[tokio::test]
    async fn invalid_interval_is_caller_error() {
        let h = harness(GatewayConfig::default());
        let err = h.service.get_property("dev1", "TEMP", "1h) |> drop()").await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(h.store.queries().is_empty());
    }

    #[tokio::test]
    async fn statistic_backfills_reduced_columns() {
        let h = harness(GatewayConfig::default());
        h.store.push_rows(vec![mean_row(22.5)]);

        let row = h
            .service
            .get_statistic("dev1", "temperature", Aggregation::Mean, "1d")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.device.as_deref(), Some("dev1"));
        assert_eq!(row.measurement, "telemetry");
        assert_eq!(row.value, Scalar::Float(22.5));
        assert!(h.store.queries()[0].ends_with("|> mean()"));

        assert!(h
            .service
            .get_statistic("dev1", "temperature", Aggregation::Max, "1d")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn query_failure_is_500() {
        let h = harness(GatewayConfig::default());
        h.store.push_response(vec![Err(ConnectorError::Query("bucket not found".into()))]);
        let err = h.service.get_property("dev1", "TEMP", "1h").await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn rate_property_uses_profile() {
        let mut config = GatewayConfig::default();
        config
            .ratings
            .insert("temperature".into(), RatingProfile::s_curve((20.0, 25.0), 0.5));
        let h = harness(config);

        h.store.push_rows(vec![mean_row(22.0)]);
        assert_eq!(h.service.rate_property("dev1", "TEMP", "1h").await.unwrap(), Some(5.0));

        assert_eq!(h.service.rate_property("dev1", "TEMP", "1h").await.unwrap(), None);

        let err = h.service.rate_property("dev1", "LUX", "1h").await.unwrap_err();
        assert!(matches!(err, ServiceError::NoRatingProfile(_)));
    }

    #[tokio::test]
    async fn publish_command_sends_cfg_set() {
        let h = harness(GatewayConfig::default());
        h.service.publish_command("dev1", "LED", json!("on")).await.unwrap();

        let sent = h.bus.published_to("things/dev1/commands");
        assert_eq!(sent.len(), 1);
        let message = TelemetryMessage::decode(&sent[0].payload).unwrap();
        assert_eq!(message.message_type, MessageType::CfgSet);
        assert_eq!(message.app_id, "LED");
        assert_eq!(message.ts, Some(9_000));
    }

    #[tokio::test(start_paused = true)]
    async fn button_press_without_ts_uses_observation_time() {
        let h = harness(GatewayConfig::default());
        let correlator = h.correlator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            correlator.offer("dev1", &TelemetryMessage::new("BUTTON", json!("1")));
        });

        let pressed = h
            .service
            .await_button_press("dev1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(pressed, 9_000);
    }

    #[tokio::test(start_paused = true)]
    async fn button_press_times_out_with_408() {
        let h = harness(GatewayConfig::default());
        let err = h
            .service
            .await_button_press("dev1", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 408);
        assert!(err.is_retryable());
        assert_eq!(h.correlator.pending_total(), 0);
    }

    #[tokio::test]
    async fn acked_command_waits_for_matching_ack() {
        let h = harness(GatewayConfig::default());
        let correlator = h.correlator.clone();
        let bus = h.bus.clone();
        tokio::spawn(async move {
            let mut commands = bus.subscribe("things/+/commands").await.unwrap();
            let _ = commands.recv().await;
            let other = TelemetryMessage::new("BUZZER", json!(1)).with_type(MessageType::CfgAck);
            correlator.offer("dev1", &other);
            let ack = TelemetryMessage::new("LED", json!("on")).with_type(MessageType::CfgAck);
            correlator.offer("dev1", &ack);
        });
        tokio::task::yield_now().await;

        let ack = h
            .service
            .publish_command_acked("dev1", "LED", json!("on"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(ack.app_id, "LED");
        assert_eq!(h.correlator.pending_total(), 0);
    }
}
