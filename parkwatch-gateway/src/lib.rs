//! ParkWatch Telemetry Gateway
//!
//! ## Overview
//!
//! Field sensors publish JSON telemetry on the bus under
//! `.../things/<deviceId>/...` topics. The gateway:
//!
//! 1. **Routes** every message: decoded events are offered to the event
//!    correlator and, if their `appId` is a registered channel, encoded into
//!    a point and written to the time-series store
//! 2. **Correlates** physical actions with in-flight requests: a caller can
//!    wait for "the next button press on device X" under a hard deadline
//! 3. **Queries** property history and statistics, streaming result rows
//!    back from the store
//! 4. **Commands** devices by publishing `CFG_SET` messages
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐  (topic, payload)  ┌───────────────┐  Point   ┌───────┐
//! │  Bus   │───────────────────▶│ MessageRouter │─────────▶│ Store │
//! └────────┘                    └───────┬───────┘          └───┬───┘
//!     ▲                           offer │                      │ rows
//!     │ CFG_SET              ┌──────────▼─────────┐    ┌───────▼───────┐
//!     │                      │  EventCorrelator   │    │ RowAggregator │
//!     │                      └──────────▲─────────┘    └───────▲───────┘
//!     │                                 │ await                │
//!     └─────────────────────── TelemetryService ───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use parkwatch_gateway::{Gateway, GatewayConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::load("parkwatch.toml")?;
//! let gateway = Gateway::connect(&config).await?;
//! let service = gateway.service();
//!
//! let pressed_at = service.await_button_press("spot-17", Duration::from_secs(30)).await?;
//! let readings = service.get_property("spot-17", "temperature", "1h").await?;
//! println!("pressed at {}, {} readings", pressed_at, readings.len());
//!
//! gateway.stop().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod aggregator;
pub mod config;
pub mod correlator;
pub mod error;
pub mod gateway;
pub mod router;
pub mod service;

pub use aggregator::{PartialRows, RowAggregator};
pub use config::{ConfigError, GatewayConfig};
pub use correlator::{EventCorrelator, PendingEvent, Predicate};
pub use error::{CorrelationError, GatewayError, ServiceError};
pub use gateway::Gateway;
pub use router::{MessageRouter, RouteOutcome, RouterExit, RouterStats};
pub use service::TelemetryService;
