//! InfluxDB v2 Store for ParkWatch
//!
//! ## Overview
//!
//! [`InfluxStore`] talks to the InfluxDB v2 HTTP API with the lightweight
//! `ureq` client. `ureq` is blocking, so every request runs on tokio's
//! blocking pool and the async side only ever sees a channel.
//!
//! ## Writes
//!
//! `POST /api/v2/write?org=..&bucket=..&precision=ms` with one line-protocol
//! line per point. Writes are fire-and-forget: a failure is logged with
//! `warn!` and counted in [`ConnectionStats`], the point is dropped.
//!
//! ## Queries
//!
//! `POST /api/v2/query?org=..` with a Flux query and an annotation-free CSV
//! dialect. The response is read record by record:
//!
//! ```text
//! ,result,table,_start,_stop,_time,_value,_field,_measurement,device   <- header
//! ,_result,0,...,2024-05-01T10:00:00Z,21.5,temperature,telemetry,dev1  <- row
//!                                                                       <- next table
//! ,result,table,_field,_value                                           <- new header
//! ,_result,0,temperature,21.9                                           <- aggregate row
//! ```
//!
//! Each table may start with its own header, so headers are re-detected
//! anywhere in the stream. A Flux runtime error arrives as an `error,reference`
//! table and becomes a terminal [`ConnectorError::Query`].
//!
//! Without annotations the column types are unknown, so values are typed by
//! shape: integer, then float, then boolean, then text.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use parkwatch_connectors::{TimeSeriesStore, influx::{InfluxConfig, InfluxStore}};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), parkwatch_connectors::ConnectorError> {
//! let store = InfluxStore::new(
//!     InfluxConfig::new("http://localhost:8086", "parkwatch", "telemetry")
//!         .token("my-token")
//!         .timeout_secs(10),
//! )?;
//!
//! let mut rows = store.query_rows("from(bucket: \"telemetry\") |> range(start: -1h)");
//! while let Some(row) = rows.next().await {
//!     println!("{:?}", row?);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use parking_lot::Mutex;
use parkwatch_core::point::DEVICE_TAG;
use parkwatch_core::{Point, Row, Scalar};
use tokio::sync::mpsc;

use crate::{ConnectionStats, ConnectorError, RowStream, TimeSeriesStore};

/// Rows buffered between the blocking reader and the consumer
const ROW_BUFFER: usize = 256;

/// InfluxDB v2 connection configuration
#[derive(Clone)]
pub struct InfluxConfig {
    /// Base URL, e.g. `http://localhost:8086`
    pub url: String,
    pub org: String,
    pub bucket: String,
    /// API token, sent as `Authorization: Token ..`
    pub token: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    pub user_agent: String,
}

impl std::fmt::Debug for InfluxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxConfig")
            .field("url", &self.url)
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl InfluxConfig {
    pub fn new(url: impl Into<String>, org: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            org: org.into(),
            bucket: bucket.into(),
            token: None,
            timeout: Duration::from_secs(30),
            user_agent: format!("ParkWatch/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    fn validate(&self) -> Result<(), ConnectorError> {
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(ConnectorError::ConfigError(
                "InfluxDB URL must start with http:// or https://".into(),
            ));
        }
        if self.org.is_empty() {
            return Err(ConnectorError::ConfigError("InfluxDB org must not be empty".into()));
        }
        if self.bucket.is_empty() {
            return Err(ConnectorError::ConfigError("InfluxDB bucket must not be empty".into()));
        }
        Ok(())
    }
}

/// Time-series store backed by the InfluxDB v2 HTTP API
pub struct InfluxStore {
    config: InfluxConfig,
    agent: ureq::Agent,
    stats: Arc<Mutex<ConnectionStats>>,
}

impl InfluxStore {
    pub fn new(config: InfluxConfig) -> Result<Self, ConnectorError> {
        config.validate()?;

        let agent = ureq::AgentBuilder::new()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build();

        Ok(Self {
            config,
            agent,
            stats: Arc::new(Mutex::new(ConnectionStats::default())),
        })
    }

    /// Bucket points are written to
    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    fn authorize(&self, mut request: ureq::Request) -> ureq::Request {
        if let Some(token) = &self.config.token {
            request = request.set("Authorization", &format!("Token {}", token));
        }
        request
    }

    fn write_request(&self) -> ureq::Request {
        let request = self
            .agent
            .post(&self.endpoint("/api/v2/write"))
            .query("org", &self.config.org)
            .query("bucket", &self.config.bucket)
            .query("precision", "ms")
            .set("Content-Type", "text/plain; charset=utf-8");
        self.authorize(request)
    }

    fn query_request(&self) -> ureq::Request {
        let request = self
            .agent
            .post(&self.endpoint("/api/v2/query"))
            .query("org", &self.config.org)
            .set("Content-Type", "application/json")
            .set("Accept", "application/csv");
        self.authorize(request)
    }
}

impl TimeSeriesStore for InfluxStore {
    fn write_point(&self, point: Point) {
        let line = point.to_line_protocol();
        let request = self.write_request();
        let stats = self.stats.clone();

        let task = move || match request.send_string(&line) {
            Ok(_) => stats.lock().record_sent(line.len()),
            Err(e) => {
                let message = describe(e);
                warn!("Dropping point, write failed: {}", message);
                stats.lock().record_failure(message);
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(task);
            }
            Err(_) => task(),
        }
    }

    fn query_rows(&self, query: &str) -> RowStream {
        let request = self.query_request();
        let body = serde_json::json!({
            "query": query,
            "type": "flux",
            "dialect": {
                "header": true,
                "annotations": [],
                "delimiter": ",",
            },
        })
        .to_string();
        let stats = self.stats.clone();

        stream::once(async move {
            let (tx, rx) = mpsc::channel(ROW_BUFFER);
            tokio::task::spawn_blocking(move || execute_query(request, &body, &tx, &stats));
            stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
        })
        .flatten()
        .boxed()
    }

    fn stats(&self) -> ConnectionStats {
        self.stats.lock().clone()
    }
}

fn execute_query(
    request: ureq::Request,
    body: &str,
    tx: &mpsc::Sender<Result<Row, ConnectorError>>,
    stats: &Mutex<ConnectionStats>,
) {
    let response = match request.send_string(body) {
        Ok(response) => response,
        Err(e) => {
            let message = describe(e);
            stats.lock().record_failure(&message);
            let _ = tx.blocking_send(Err(ConnectorError::Query(message)));
            return;
        }
    };
    stats.lock().record_sent(body.len());

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(response.into_reader());
    let mut decoder = FluxCsvDecoder::default();

    for record in reader.records() {
        let item = match record {
            Ok(record) => match decoder.decode(&record) {
                Some(item) => item,
                None => continue,
            },
            Err(e) => Err(ConnectorError::Query(format!("malformed CSV response: {}", e))),
        };

        let terminal = item.is_err();
        if tx.blocking_send(item).is_err() {
            debug!("Query stream dropped by consumer, abandoning response");
            return;
        }
        if terminal {
            return;
        }
    }
}

fn describe(error: ureq::Error) -> String {
    match error {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
                .unwrap_or(body);
            format!("HTTP {}: {}", code, message)
        }
        ureq::Error::Transport(transport) => transport.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
struct Columns {
    value: usize,
    field: Option<usize>,
    measurement: Option<usize>,
    time: Option<usize>,
    stop: Option<usize>,
    device: Option<usize>,
}

#[derive(Debug, Default)]
enum DecoderState {
    #[default]
    AwaitingHeader,
    Rows(Columns),
    Error,
}

/// Incremental decoder for annotation-free Flux CSV
#[derive(Debug, Default)]
pub(crate) struct FluxCsvDecoder {
    state: DecoderState,
}

impl FluxCsvDecoder {
    /// Decode one record; `None` for headers and ignorable records
    pub(crate) fn decode(
        &mut self,
        record: &csv::StringRecord,
    ) -> Option<Result<Row, ConnectorError>> {
        if record.iter().all(str::is_empty) {
            return None;
        }

        let position = |name: &str| record.iter().position(|cell| cell == name);

        if let Some(value) = position("_value") {
            self.state = DecoderState::Rows(Columns {
                value,
                field: position("_field"),
                measurement: position("_measurement"),
                time: position("_time"),
                stop: position("_stop"),
                device: position(DEVICE_TAG),
            });
            return None;
        }
        if position("error").is_some() && position("reference").is_some() {
            self.state = DecoderState::Error;
            return None;
        }

        match self.state {
            DecoderState::AwaitingHeader => Some(Err(ConnectorError::Query(
                "response row before any header".into(),
            ))),
            DecoderState::Error => {
                let message = record.get(0).unwrap_or_default();
                Some(Err(ConnectorError::Query(message.to_string())))
            }
            DecoderState::Rows(columns) => Some(decode_row(record, &columns)),
        }
    }
}

fn decode_row(record: &csv::StringRecord, columns: &Columns) -> Result<Row, ConnectorError> {
    let cell = |index: Option<usize>| index.and_then(|i| record.get(i)).filter(|s| !s.is_empty());

    let raw_value = record
        .get(columns.value)
        .ok_or_else(|| ConnectorError::Query("row is missing _value".into()))?;

    let time = match cell(columns.time).or_else(|| cell(columns.stop)) {
        Some(raw) => parse_time(raw)?,
        None => 0,
    };

    Ok(Row {
        device: cell(columns.device).map(str::to_string),
        measurement: cell(columns.measurement).unwrap_or_default().to_string(),
        field: cell(columns.field).unwrap_or_default().to_string(),
        value: parse_scalar(raw_value),
        time,
    })
}

fn parse_time(raw: &str) -> Result<u64, ConnectorError> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| ConnectorError::Query(format!("invalid timestamp {:?}: {}", raw, e)))?;
    Ok(parsed.timestamp_millis().max(0) as u64)
}

fn parse_scalar(raw: &str) -> Scalar {
    if let Ok(v) = raw.parse::<i64>() {
        Scalar::Integer(v)
    } else if let Ok(v) = raw.parse::<f64>() {
        Scalar::Float(v)
    } else if let Ok(v) = raw.parse::<bool>() {
        Scalar::Boolean(v)
    } else {
        Scalar::Text(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(csv_text: &str) -> Vec<Result<Row, ConnectorError>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(csv_text.as_bytes());
        let mut decoder = FluxCsvDecoder::default();
        reader
            .records()
            .filter_map(|record| decoder.decode(&record.unwrap()))
            .collect()
    }

    #[test]
    fn test_url_validation() {
        assert!(InfluxStore::new(InfluxConfig::new("localhost:8086", "o", "b")).is_err());
        assert!(InfluxStore::new(InfluxConfig::new("http://localhost:8086", "", "b")).is_err());
        assert!(InfluxStore::new(InfluxConfig::new("http://localhost:8086", "o", "")).is_err());
        assert!(InfluxStore::new(InfluxConfig::new("https://influx.local", "o", "b")).is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = InfluxConfig::new("http://localhost:8086/", "parkwatch", "telemetry")
            .token("secret")
            .timeout_secs(5);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(!format!("{:?}", config).contains("secret"));

        let store = InfluxStore::new(config).unwrap();
        assert_eq!(store.endpoint("/api/v2/write"), "http://localhost:8086/api/v2/write");
        assert_eq!(store.bucket(), "telemetry");
    }

    #[test]
    fn decodes_range_rows() {
        let rows = decode_all(
            ",result,table,_start,_stop,_time,_value,_field,_measurement,device,channel\n\
             ,_result,0,2024-05-01T09:00:00Z,2024-05-01T10:00:00Z,2024-05-01T09:30:00Z,21.5,temperature,telemetry,dev1,TEMP\n\
             ,_result,0,2024-05-01T09:00:00Z,2024-05-01T10:00:00Z,2024-05-01T09:31:00.250Z,22,temperature,telemetry,dev1,TEMP\n",
        );

        assert_eq!(rows.len(), 2);
        let first = rows[0].as_ref().unwrap();
        assert_eq!(first.device.as_deref(), Some("dev1"));
        assert_eq!(first.measurement, "telemetry");
        assert_eq!(first.field, "temperature");
        assert_eq!(first.value, Scalar::Float(21.5));
        assert_eq!(first.time, 1_714_555_800_000);

        let second = rows[1].as_ref().unwrap();
        assert_eq!(second.value, Scalar::Integer(22));
        assert_eq!(second.time, 1_714_555_860_250);
    }

    #[test]
    fn redetects_header_per_table() {
        let rows = decode_all(
            ",result,table,_time,_value,_field,_measurement,device\n\
             ,_result,0,2024-05-01T09:30:00Z,1,co2,telemetry,dev1\n\
             \n\
             ,result,table,_field,_value\n\
             ,_result,1,co2,415.5\n",
        );

        assert_eq!(rows.len(), 2);
        let aggregate = rows[1].as_ref().unwrap();
        assert_eq!(aggregate.device, None);
        assert_eq!(aggregate.field, "co2");
        assert_eq!(aggregate.value, Scalar::Float(415.5));
        assert_eq!(aggregate.time, 0);
    }

    #[test]
    fn aggregate_time_falls_back_to_window_end() {
        let rows = decode_all(
            ",result,table,_start,_stop,_field,_value\n\
             ,_result,0,2024-05-01T09:00:00Z,2024-05-01T10:00:00Z,humidity,48.25\n",
        );
        assert_eq!(rows[0].as_ref().unwrap().time, 1_714_557_600_000);
    }

    #[test]
    fn error_table_is_terminal_error() {
        let rows = decode_all("error,reference\nfailed to parse query,897\n");
        assert_eq!(rows.len(), 1);
        match &rows[0] {
            Err(ConnectorError::Query(message)) => assert_eq!(message, "failed to parse query"),
            other => panic!("expected query error, got {:?}", other),
        }
    }

    #[test]
    fn bad_timestamp_is_error() {
        let rows = decode_all(",result,table,_time,_value\n,_result,0,yesterday,1\n");
        assert!(matches!(rows[0], Err(ConnectorError::Query(_))));
    }

    #[test]
    fn scalar_typing() {
        assert_eq!(parse_scalar("42"), Scalar::Integer(42));
        assert_eq!(parse_scalar("-1.5"), Scalar::Float(-1.5));
        assert_eq!(parse_scalar("true"), Scalar::Boolean(true));
        assert_eq!(parse_scalar("open"), Scalar::Text("open".into()));
    }

    #[tokio::test]
    async fn unreachable_store_yields_single_error() {
        let store = InfluxStore::new(
            InfluxConfig::new("http://127.0.0.1:1", "o", "b").timeout_secs(2),
        )
        .unwrap();

        let items: Vec<_> = store.query_rows("from(bucket: \"b\")").collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ConnectorError::Query(_))));
        assert_eq!(store.stats().messages_failed, 1);
    }
}
