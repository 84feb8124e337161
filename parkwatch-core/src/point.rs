//! Time-Series Points and the Point Encoder
//!
//! ## Overview
//!
//! A [`Point`] is one append-only datum for the time-series store: a
//! measurement name, string tags, numeric fields and a millisecond timestamp.
//! Points are never mutated after creation; ownership passes to the store
//! client on write.
//!
//! ## Channels
//!
//! Which messages become points, and with what field type, is decided by a
//! static [`ChannelRegistry`] keyed by `appId`:
//!
//! | appId    | field         | kind           |
//! |----------|---------------|----------------|
//! | `TEMP`   | `temperature` | float          |
//! | `HUMID`  | `humidity`    | float          |
//! | `CO2`    | `co2`         | integer        |
//! | `LUX`    | `lux`         | integer        |
//! | `MOTION` | `motion`      | edge-triggered |
//!
//! ### Edge-Triggered Channels
//!
//! Boolean sensors transmit the literal strings `"1"` and `"0"`. Only the
//! rising edge is recorded:
//! ```text
//! "1" → one point, field = 1i
//! "0" → reset, no point
//! ```
//!
//! ## Timestamps
//!
//! The device timestamp (`ts`) wins when present, since it was taken closer to
//! the physical event. Otherwise the encoder's clock supplies the observation
//! instant.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EncodeError;
use crate::message::TelemetryMessage;
use crate::time::{TimeSource, Timestamp};

/// Default measurement name for sensor points
pub const DEFAULT_MEASUREMENT: &str = "telemetry";

/// Tag holding the device identifier
pub const DEVICE_TAG: &str = "device";

/// Tag holding the originating `appId`
pub const CHANNEL_TAG: &str = "channel";

/// Numeric field value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Signed integer, written with the `i` suffix
    Integer(i64),
    /// 64-bit float
    Float(f64),
}

impl FieldValue {
    /// Value as a float regardless of variant
    pub fn as_f64(&self) -> f64 {
        match self {
            FieldValue::Integer(v) => *v as f64,
            FieldValue::Float(v) => *v,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{}i", v),
            FieldValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// One time-series datum
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: Timestamp,
}

impl Point {
    /// Create a point with no tags or fields
    pub fn new(measurement: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    /// Add a tag, replacing any previous value for the key
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add a field, replacing any previous value for the key
    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Measurement name
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Tags, sorted by key
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Fields, sorted by key
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Milliseconds since the Unix epoch
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Render as InfluxDB line protocol with millisecond precision
    ///
    /// ```rust
    /// use parkwatch_core::{FieldValue, Point};
    ///
    /// let point = Point::new("telemetry", 1000)
    ///     .tag("device", "lot 7")
    ///     .field("co2", FieldValue::Integer(415));
    /// assert_eq!(point.to_line_protocol(), "telemetry,device=lot\\ 7 co2=415i 1000");
    /// ```
    pub fn to_line_protocol(&self) -> String {
        let mut line = String::with_capacity(64);
        escape_into(&mut line, &self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            line.push(',');
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            escape_into(&mut line, value, &[',', '=', ' ']);
        }

        let mut first = true;
        for (key, value) in &self.fields {
            line.push(if first { ' ' } else { ',' });
            first = false;
            escape_into(&mut line, key, &[',', '=', ' ']);
            let _ = write!(line, "={}", value);
        }

        let _ = write!(line, " {}", self.timestamp);
        line
    }
}

fn escape_into(out: &mut String, raw: &str, special: &[char]) {
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

/// How a channel's data becomes a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Stored as a float
    Float,
    /// Stored as an integer; fractional values are rejected
    Integer,
    /// `"1"` records a point with value 1, `"0"` is dropped
    EdgeTriggered,
}

/// Persistence rule for one `appId`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Field name in the time-series store
    pub field: String,
    /// Field type
    pub kind: ChannelKind,
}

impl ChannelSpec {
    /// Rule storing into `field` as `kind`
    pub fn new(field: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            field: field.into(),
            kind,
        }
    }
}

/// Static mapping from `appId` to persistence rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRegistry {
    channels: HashMap<String, ChannelSpec>,
}

impl ChannelRegistry {
    /// Registry with no channels
    pub fn empty() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Register (or replace) a channel
    pub fn with_channel(mut self, app_id: impl Into<String>, spec: ChannelSpec) -> Self {
        self.channels.insert(app_id.into(), spec);
        self
    }

    /// Look up the rule for an `appId`
    pub fn get(&self, app_id: &str) -> Option<&ChannelSpec> {
        self.channels.get(app_id)
    }

    /// Whether an `appId` is persisted
    pub fn contains(&self, app_id: &str) -> bool {
        self.channels.contains_key(app_id)
    }

    /// Iterate over registered channels
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChannelSpec)> {
        self.channels.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::empty()
            .with_channel("TEMP", ChannelSpec::new("temperature", ChannelKind::Float))
            .with_channel("HUMID", ChannelSpec::new("humidity", ChannelKind::Float))
            .with_channel("CO2", ChannelSpec::new("co2", ChannelKind::Integer))
            .with_channel("LUX", ChannelSpec::new("lux", ChannelKind::Integer))
            .with_channel("MOTION", ChannelSpec::new("motion", ChannelKind::EdgeTriggered))
    }
}

impl FromIterator<(String, ChannelSpec)> for ChannelRegistry {
    fn from_iter<I: IntoIterator<Item = (String, ChannelSpec)>>(iter: I) -> Self {
        Self {
            channels: iter.into_iter().collect(),
        }
    }
}

/// Turns decoded telemetry into points
pub struct PointEncoder {
    registry: ChannelRegistry,
    measurement: String,
    clock: Box<dyn TimeSource>,
}

impl PointEncoder {
    /// Create an encoder writing to [`DEFAULT_MEASUREMENT`]
    pub fn new(registry: ChannelRegistry, clock: Box<dyn TimeSource>) -> Self {
        Self {
            registry,
            measurement: DEFAULT_MEASUREMENT.to_string(),
            clock,
        }
    }

    /// Override the measurement name
    pub fn with_measurement(mut self, measurement: impl Into<String>) -> Self {
        self.measurement = measurement.into();
        self
    }

    /// Channels this encoder persists
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Measurement points are written to
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Encode a message from `device_id`
    ///
    /// Returns `Ok(None)` when the channel is not registered or an
    /// edge-triggered channel reports a reset.
    pub fn encode(
        &self,
        device_id: &str,
        message: &TelemetryMessage,
    ) -> Result<Option<Point>, EncodeError> {
        let spec = match self.registry.get(&message.app_id) {
            Some(spec) => spec,
            None => return Ok(None),
        };

        let value = match spec.kind {
            ChannelKind::Float => FieldValue::Float(numeric(message)?),
            ChannelKind::Integer => FieldValue::Integer(integer(message)?),
            ChannelKind::EdgeTriggered => match edge(message)? {
                true => FieldValue::Integer(1),
                false => return Ok(None),
            },
        };

        let timestamp = message.ts.unwrap_or_else(|| self.clock.now());

        Ok(Some(
            Point::new(self.measurement.as_str(), timestamp)
                .tag(DEVICE_TAG, device_id)
                .tag(CHANNEL_TAG, message.app_id.as_str())
                .field(spec.field.as_str(), value),
        ))
    }
}

fn numeric(message: &TelemetryMessage) -> Result<f64, EncodeError> {
    let parsed = match &message.data {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| EncodeError::NotNumeric {
            app_id: message.app_id.clone(),
            data: message.data.to_string(),
        })
}

fn integer(message: &TelemetryMessage) -> Result<i64, EncodeError> {
    if let Some(v) = message.data.as_i64() {
        return Ok(v);
    }

    let value = numeric(message)?;
    if value.fract() != 0.0 || value < i64::MIN as f64 || value > i64::MAX as f64 {
        return Err(EncodeError::NotInteger {
            app_id: message.app_id.clone(),
            value,
        });
    }
    Ok(value as i64)
}

fn edge(message: &TelemetryMessage) -> Result<bool, EncodeError> {
    match &message.data {
        Value::String(s) if s == "1" => Ok(true),
        Value::String(s) if s == "0" => Ok(false),
        Value::Number(n) if n.as_u64() == Some(1) => Ok(true),
        Value::Number(n) if n.as_u64() == Some(0) => Ok(false),
        other => Err(EncodeError::NotBinary {
            app_id: message.app_id.clone(),
            data: other.to_string(),
        }),
    }
}
