//! Gateway runtime: wires the bus, store, router, correlator and service
//!
//! ```text
//!              ┌──────────── Gateway ─────────────┐
//!  bus ──sub──▶│ router task ────▶ correlator     │
//!              │        │              ▲          │
//!              │        ▼              │          │
//!  store ◀─────│  write_point    TelemetryService │◀── callers
//!              └──────────────────────────────────┘
//! ```
//!
//! One router task consumes all configured subscriptions. The filters are
//! validated to be disjoint, so every bus message is routed exactly once.

use std::sync::Arc;

use log::{error, info};
use parkwatch_connectors::{InfluxStore, MessageBus, MqttBus, TimeSeriesStore};
use parkwatch_core::time::{SystemTime, TimeSource};
use parkwatch_core::PointEncoder;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::correlator::EventCorrelator;
use crate::error::GatewayError;
use crate::router::{MessageRouter, RouterExit, RouterStats};
use crate::service::TelemetryService;

/// Running gateway
pub struct Gateway {
    bus: Arc<dyn MessageBus>,
    router: Arc<MessageRouter>,
    correlator: Arc<EventCorrelator>,
    service: Arc<TelemetryService>,
    shutdown: CancellationToken,
    routing: Option<JoinHandle<RouterExit>>,
}

impl Gateway {
    /// Connect to the configured MQTT broker and InfluxDB and start routing
    pub async fn connect(config: &GatewayConfig) -> Result<Self, GatewayError> {
        config.validate()?;
        let store = InfluxStore::new(config.influx.to_config())?;
        let bus = MqttBus::connect(config.mqtt.to_config()).await?;
        Self::start(Arc::new(bus), Arc::new(store), Arc::new(SystemTime), config).await
    }

    /// Start routing on top of an existing bus and store
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn TimeSeriesStore>,
        clock: Arc<dyn TimeSource>,
        config: &GatewayConfig,
    ) -> Result<Self, GatewayError> {
        config.validate()?;

        let correlator = Arc::new(EventCorrelator::new());
        let encoder = PointEncoder::new(config.routing.registry(), Box::new(clock.clone()))
            .with_measurement(config.routing.measurement.as_str());
        let router = Arc::new(MessageRouter::new(correlator.clone(), store.clone(), encoder));
        let service = Arc::new(TelemetryService::new(
            bus.clone(),
            store,
            correlator.clone(),
            clock,
            config,
        ));

        let mut subscriptions = Vec::with_capacity(config.routing.subscriptions.len());
        for filter in &config.routing.subscriptions {
            subscriptions.push(bus.subscribe(filter).await?);
        }

        let shutdown = CancellationToken::new();
        let routing = {
            let router = router.clone();
            let token = shutdown.clone();
            tokio::spawn(async move { router.run(subscriptions, token).await })
        };

        info!(
            "Gateway started with {} subscription(s)",
            config.routing.subscriptions.len()
        );

        Ok(Self {
            bus,
            router,
            correlator,
            service,
            shutdown,
            routing: Some(routing),
        })
    }

    pub fn service(&self) -> Arc<TelemetryService> {
        self.service.clone()
    }

    pub fn correlator(&self) -> Arc<EventCorrelator> {
        self.correlator.clone()
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Resolves when the router task ends
    ///
    /// Outside of [`Gateway::stop`] that means the bus went away. Once it has
    /// returned, later calls return [`RouterExit::Shutdown`] immediately.
    pub async fn wait(&mut self) -> RouterExit {
        let Some(handle) = self.routing.as_mut() else {
            return RouterExit::Shutdown;
        };
        let result = handle.await;
        self.routing = None;
        match result {
            Ok(exit) => exit,
            Err(e) => {
                error!("Router task failed: {}", e);
                RouterExit::SubscriptionClosed
            }
        }
    }

    /// Stop routing, fail pending waiters and close the bus
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        self.correlator.close();
        if let Some(handle) = self.routing.take() {
            if let Err(e) = handle.await {
                error!("Router task failed: {}", e);
            }
        }
        self.bus.shutdown().await;
        info!("Gateway stopped");
    }
}
