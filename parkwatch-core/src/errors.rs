//! Error Types for Telemetry Decoding, Encoding and Query Construction
//!
//! ## Design Philosophy
//!
//! Nothing in this crate is allowed to take the process down. Sensor traffic
//! arrives over a lossy bus, so every failure here is an ordinary value:
//!
//! 1. **DecodeError**: the payload was not a telemetry message. The router
//!    reports it to anyone waiting on the device and otherwise drops it.
//! 2. **EncodeError**: the message decoded but its data can't become a point
//!    (e.g. `"warm"` on a temperature channel). Logged and dropped.
//! 3. **QueryError**: a query spec was rejected before any I/O happened.
//!
//! ## Error Handling Strategy
//!
//! ```rust
//! use parkwatch_core::{DecodeError, TelemetryMessage};
//!
//! match TelemetryMessage::decode(b"not json") {
//!     Ok(message) => { /* route it */ }
//!     Err(DecodeError::Malformed(reason)) => {
//!         eprintln!("dropping malformed payload: {}", reason);
//!     }
//!     Err(_) => {}
//! }
//! ```

use thiserror_no_std::Error;

/// Bus payload could not be decoded into a [`TelemetryMessage`](crate::TelemetryMessage)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload was empty
    #[error("Empty payload")]
    Empty,

    /// Payload was not valid JSON or did not match the message shape
    #[error("Malformed payload: {0}")]
    Malformed(String),
}

/// Decoded message could not be turned into a point
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    /// Data is not a number the channel can store
    #[error("Channel {app_id} expects a numeric value, got {data}")]
    NotNumeric {
        /// Channel identifier
        app_id: String,
        /// The offending data, rendered as JSON
        data: String,
    },

    /// Integer channel received a value with a fractional part or out of range
    #[error("Channel {app_id} expects an integer, got {value}")]
    NotInteger {
        /// Channel identifier
        app_id: String,
        /// The offending value
        value: f64,
    },

    /// Edge-triggered channel received something other than `"1"`/`"0"`
    #[error("Channel {app_id} expects \"1\" or \"0\", got {data}")]
    NotBinary {
        /// Channel identifier
        app_id: String,
        /// The offending data, rendered as JSON
        data: String,
    },
}

/// Query spec rejected before rendering
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// A required field was empty
    #[error("Query field '{0}' must not be empty")]
    EmptyField(&'static str),

    /// Interval is not a Flux duration literal
    #[error("Invalid duration literal: {0}")]
    InvalidInterval(String),

    /// Statistical query requested without an aggregation
    #[error("Statistical query requires an aggregation")]
    MissingAggregation,

    /// Aggregation name not recognised
    #[error("Unknown aggregation: {0}")]
    UnknownAggregation(String),
}
