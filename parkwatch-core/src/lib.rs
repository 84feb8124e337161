//! Core telemetry types for ParkWatch
//!
//! Turns raw bus traffic from field sensors into typed data and back:
//! decoding telemetry payloads, addressing devices by topic, encoding
//! time-series points and rendering range/statistic queries.
//!
//! Everything in this crate is synchronous and free of I/O. The async
//! plumbing (bus, store, correlation) lives in `parkwatch-connectors` and
//! `parkwatch-gateway`.
//!
//! ```no_run
//! use parkwatch_core::{ChannelRegistry, PointEncoder, TelemetryMessage, TopicAddress};
//! use parkwatch_core::time::SystemTime;
//!
//! let encoder = PointEncoder::new(ChannelRegistry::default(), Box::new(SystemTime));
//!
//! let address = TopicAddress::parse("things/dev1/shadow/update").unwrap();
//! let message = TelemetryMessage::decode(br#"{"appId":"TEMP","data":21.5}"#).unwrap();
//!
//! if let Ok(Some(point)) = encoder.encode(address.device_id(), &message) {
//!     println!("{}", point.to_line_protocol());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod message;
pub mod point;
pub mod query;
pub mod time;

// Public API
pub use errors::{DecodeError, EncodeError, QueryError};
pub use message::{MessageType, TelemetryMessage, TopicAddress};
pub use point::{ChannelKind, ChannelRegistry, ChannelSpec, FieldValue, Point, PointEncoder};
pub use query::{Aggregation, QuerySpec, Row, Scalar};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_exists() {
        assert!(!VERSION.is_empty());
    }
}
