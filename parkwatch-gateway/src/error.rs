//! Error types for the gateway layer

use std::time::Duration;

use parkwatch_connectors::ConnectorError;
use parkwatch_core::{DecodeError, QueryError};
use parkwatch_scoring::RatingError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors starting the gateway runtime
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

/// Why a correlation wait ended without a matching event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    /// No matching event arrived before the deadline
    #[error("No matching device event within {0:?}")]
    Timeout(Duration),

    /// The awaited device sent a payload that could not be decoded
    #[error("Device sent an undecodable payload: {0}")]
    Decode(DecodeError),

    /// The correlator was shut down while waiting
    #[error("Event correlator closed")]
    Closed,
}

/// Errors surfaced to callers of [`crate::TelemetryService`]
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed device payload: {0}")]
    Decode(DecodeError),

    #[error("Query execution failed: {0}")]
    Query(ConnectorError),

    #[error("Bus error: {0}")]
    Bus(ConnectorError),

    #[error("Invalid query: {0}")]
    InvalidQuery(#[from] QueryError),

    #[error("Rating failed: {0}")]
    Rating(#[from] RatingError),

    #[error("Unknown property {0:?}")]
    UnknownProperty(String),

    #[error("No rating profile for {0:?}")]
    NoRatingProfile(String),

    #[error("Payload encoding failed: {0}")]
    Payload(String),

    #[error("Gateway is shutting down")]
    Closed,
}

impl ServiceError {
    /// HTTP-equivalent status for the caller-facing boundary
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Timeout(_) => 408,
            ServiceError::Decode(_) => 502,
            ServiceError::Query(_) | ServiceError::Payload(_) => 500,
            ServiceError::Bus(ConnectorError::Closed) | ServiceError::Closed => 503,
            ServiceError::Bus(_) => 500,
            ServiceError::InvalidQuery(_) | ServiceError::Rating(_) => 400,
            ServiceError::UnknownProperty(_) | ServiceError::NoRatingProfile(_) => 404,
        }
    }

    /// Whether repeating the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Timeout(_))
    }
}

impl From<CorrelationError> for ServiceError {
    fn from(error: CorrelationError) -> Self {
        match error {
            CorrelationError::Timeout(after) => ServiceError::Timeout(after),
            CorrelationError::Decode(e) => ServiceError::Decode(e),
            CorrelationError::Closed => ServiceError::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        let timeout = ServiceError::from(CorrelationError::Timeout(Duration::from_secs(1)));
        assert_eq!(timeout.status_code(), 408);
        assert!(timeout.is_retryable());

        let decode = ServiceError::from(CorrelationError::Decode(DecodeError::Empty));
        assert_eq!(decode.status_code(), 502);
        assert!(!decode.is_retryable());

        assert_eq!(ServiceError::Query(ConnectorError::Query("x".into())).status_code(), 500);
        assert_eq!(ServiceError::Bus(ConnectorError::Closed).status_code(), 503);
        assert_eq!(ServiceError::Bus(ConnectorError::NotConnected).status_code(), 500);
        assert_eq!(ServiceError::from(QueryError::MissingAggregation).status_code(), 400);
        assert_eq!(ServiceError::UnknownProperty("x".into()).status_code(), 404);
        assert_eq!(ServiceError::from(CorrelationError::Closed).status_code(), 503);
    }
}
