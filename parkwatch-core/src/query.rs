//! Flux Query Construction
//!
//! ## Overview
//!
//! Queries against the time-series store are rendered from an immutable
//! [`QuerySpec`]. Rendering is pure string work: no execution, no I/O.
//!
//! ### Range Scan
//! ```text
//! from(bucket: "parking")
//!   |> range(start: -1h)
//!   |> filter(fn: (r) => r._measurement == "telemetry")
//!   |> filter(fn: (r) => r._field == "temperature")
//!   |> filter(fn: (r) => r.device == "dev1")
//! ```
//!
//! ### Statistic
//! The range scan followed by a grouping and a reduction:
//! ```text
//!   |> group(columns: ["_field"])
//!   |> mean()
//! ```
//!
//! The device filter is only emitted when a device is set; leaving it out is
//! how callers ask for cross-device aggregates.
//!
//! ## Escaping
//!
//! Every user-supplied value ends up inside a Flux string literal, with `\`
//! and `"` escaped. The interval is validated as a duration literal before it
//! gets anywhere near the query text.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::QueryError;
use crate::point::DEVICE_TAG;
use crate::time::Timestamp;

/// Duration units accepted in an interval, longest first so `mo`/`ms` win over `m`
const DURATION_UNITS: [&str; 11] = ["mo", "ms", "us", "µs", "ns", "s", "m", "h", "d", "w", "y"];

/// Reduction applied by a statistical query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Arithmetic mean
    Mean,
    /// Middle value
    Median,
    /// Standard deviation
    Stddev,
    /// Number of readings
    Count,
    /// Sum of readings
    Sum,
    /// Smallest reading
    Min,
    /// Largest reading
    Max,
    /// Max minus min
    Spread,
}

impl Aggregation {
    /// Flux function name
    pub const fn flux_fn(&self) -> &'static str {
        match self {
            Aggregation::Mean => "mean",
            Aggregation::Median => "median",
            Aggregation::Stddev => "stddev",
            Aggregation::Count => "count",
            Aggregation::Sum => "sum",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Spread => "spread",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flux_fn())
    }
}

impl FromStr for Aggregation {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean" | "avg" | "average" => Ok(Aggregation::Mean),
            "median" => Ok(Aggregation::Median),
            "stddev" | "std" => Ok(Aggregation::Stddev),
            "count" => Ok(Aggregation::Count),
            "sum" => Ok(Aggregation::Sum),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            "spread" => Ok(Aggregation::Spread),
            _ => Err(QueryError::UnknownAggregation(s.to_string())),
        }
    }
}

/// Immutable description of a range or statistic query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    bucket: String,
    interval: String,
    measurement: String,
    field: String,
    device_id: Option<String>,
    aggregation: Option<Aggregation>,
}

impl QuerySpec {
    /// Create a cross-device range scan
    ///
    /// `interval` is a Flux duration literal such as `1h`, `30m` or `1d12h`;
    /// the scan covers `now - interval` to now.
    pub fn new(
        bucket: impl Into<String>,
        measurement: impl Into<String>,
        field: impl Into<String>,
        interval: impl Into<String>,
    ) -> Result<Self, QueryError> {
        let spec = Self {
            bucket: bucket.into(),
            interval: interval.into(),
            measurement: measurement.into(),
            field: field.into(),
            device_id: None,
            aggregation: None,
        };

        if spec.bucket.is_empty() {
            return Err(QueryError::EmptyField("bucket"));
        }
        if spec.measurement.is_empty() {
            return Err(QueryError::EmptyField("measurement"));
        }
        if spec.field.is_empty() {
            return Err(QueryError::EmptyField("field"));
        }
        if !is_duration_literal(&spec.interval) {
            return Err(QueryError::InvalidInterval(spec.interval));
        }

        Ok(spec)
    }

    /// Restrict to one device
    pub fn for_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Reduce with an aggregation
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    /// Bucket scanned
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Trailing window as a Flux duration literal
    pub fn interval(&self) -> &str {
        &self.interval
    }

    /// Measurement filtered on
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Field filtered on
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Device filter, if any
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Reduction, if any
    pub fn aggregation(&self) -> Option<Aggregation> {
        self.aggregation
    }

    /// Render the form this query calls for: statistic if an aggregation is
    /// set, range scan otherwise
    pub fn render(&self) -> String {
        match self.aggregation {
            Some(aggregation) => render_statistic(self, aggregation),
            None => basic_range_query(self),
        }
    }
}

/// Range-filtered scan, ignoring any aggregation on `spec`
pub fn basic_range_query(spec: &QuerySpec) -> String {
    let mut query = format!(
        "from(bucket: {})\n  |> range(start: -{})\n  |> filter(fn: (r) => r._measurement == {})\n  |> filter(fn: (r) => r._field == {})",
        flux_string(&spec.bucket),
        spec.interval,
        flux_string(&spec.measurement),
        flux_string(&spec.field),
    );

    if let Some(device_id) = &spec.device_id {
        query.push_str(&format!(
            "\n  |> filter(fn: (r) => r.{} == {})",
            DEVICE_TAG,
            flux_string(device_id)
        ));
    }

    query
}

/// Range-filtered scan grouped by field and reduced by `spec.aggregation`
pub fn statistical_query(spec: &QuerySpec) -> Result<String, QueryError> {
    let aggregation = spec.aggregation.ok_or(QueryError::MissingAggregation)?;
    Ok(render_statistic(spec, aggregation))
}

fn render_statistic(spec: &QuerySpec, aggregation: Aggregation) -> String {
    format!(
        "{}\n  |> group(columns: [\"_field\"])\n  |> {}()",
        basic_range_query(spec),
        aggregation.flux_fn()
    )
}

/// Quote and escape a Flux string literal
fn flux_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for c in raw.chars() {
        if c == '\\' || c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Whether `literal` is a positive Flux duration (e.g. `1h`, `1h30m`, `2mo`)
pub fn is_duration_literal(literal: &str) -> bool {
    let mut rest = literal;
    if rest.is_empty() {
        return false;
    }

    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return false;
        }
        rest = &rest[digits..];

        match DURATION_UNITS.iter().find(|unit| rest.starts_with(*unit)) {
            Some(unit) => rest = &rest[unit.len()..],
            None => return false,
        }
    }

    true
}

/// Scalar value read back from the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Whole number
    Integer(i64),
    /// Floating-point number
    Float(f64),
    /// `true`/`false`
    Boolean(bool),
    /// Anything else, verbatim
    Text(String),
}

impl Scalar {
    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Integer(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            Scalar::Boolean(_) | Scalar::Text(_) => None,
        }
    }
}

/// One result row of a range or statistic query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Device tag, absent for cross-device aggregates
    pub device: Option<String>,
    /// Measurement name
    pub measurement: String,
    /// Field name
    pub field: String,
    /// Stored or reduced value
    pub value: Scalar,
    /// Sample time, the window end for aggregates, 0 when neither is returned
    pub time: Timestamp,
}
