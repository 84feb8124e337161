//! MQTT Bus for ParkWatch
//!
//! ## Overview
//!
//! [`MqttBus`] owns a single `rumqttc` connection. One background task polls
//! the event loop and fans incoming publishes out to every local
//! [`Subscription`] whose filter matches, so any number of gateway components
//! can subscribe without opening extra broker connections.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! connect() ──▶ event loop task ──▶ ConnAck ──▶ connected
//!                    │                  ▲
//!                    ▼ error            │ resubscribe
//!               backoff sleep ──────────┘
//!                    │ too many errors
//!                    ▼
//!          all subscriptions closed
//! ```
//!
//! Backoff after the n-th consecutive error is `min(2^(n-1), 30)` seconds.
//! The broker forgets subscriptions of a clean session across reconnects, so
//! every live filter is re-sent on each ConnAck after the first.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use parkwatch_connectors::{MessageBus, mqtt::{MqttBus, MqttConfig}};
//!
//! # async fn example() -> Result<(), parkwatch_connectors::ConnectorError> {
//! let config = MqttConfig::new("broker.local", 1883)
//!     .client_id("parkwatch-gateway")
//!     .credentials("gateway", "secret")
//!     .qos(1);
//!
//! let bus = MqttBus::connect(config).await?;
//! bus.publish("things/dev1/commands", br#"{"appId":"LED","data":"1"}"#.to_vec()).await?;
//! bus.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio_util::sync::CancellationToken;

use crate::subscribers::SubscriberSet;
use crate::{BusMessage, ConnectionStats, ConnectorError, MessageBus, Subscription};

const MAX_BACKOFF_SECS: u64 = 30;

/// MQTT connection configuration
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// 0, 1 or 2; anything above 2 is treated as 2
    pub qos: u8,
    pub clean_session: bool,
    /// Capacity of the client request queue and of each subscription channel
    pub channel_capacity: usize,
    /// Consecutive event loop errors before the broker is declared unreachable
    pub max_consecutive_errors: u32,
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: format!("parkwatch-{}", std::process::id()),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            qos: 0,
            clean_session: true,
            channel_capacity: 1024,
            max_consecutive_errors: 10,
        }
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn keep_alive_secs(mut self, secs: u64) -> Self {
        self.keep_alive = Duration::from_secs(secs);
        self
    }

    pub fn qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_errors = max;
        self
    }

    fn validate(&self) -> Result<(), ConnectorError> {
        if self.host.is_empty() {
            return Err(ConnectorError::ConfigError("MQTT host must not be empty".into()));
        }
        if self.client_id.is_empty() {
            return Err(ConnectorError::ConfigError("MQTT client id must not be empty".into()));
        }
        if self.channel_capacity == 0 {
            return Err(ConnectorError::ConfigError("channel capacity must be positive".into()));
        }
        if self.max_consecutive_errors == 0 {
            return Err(ConnectorError::ConfigError(
                "max consecutive errors must be positive".into(),
            ));
        }
        Ok(())
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(self.clean_session);
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            options.set_credentials(user, pass);
        }
        options
    }
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Message bus backed by one MQTT connection
pub struct MqttBus {
    config: MqttConfig,
    client: AsyncClient,
    subscribers: Arc<SubscriberSet>,
    connected: Arc<AtomicBool>,
    stats: Arc<Mutex<ConnectionStats>>,
    shutdown: CancellationToken,
}

impl MqttBus {
    /// Create the client and spawn its event loop
    ///
    /// Must be called inside a tokio runtime. The broker connection itself is
    /// established by the event loop, so this returns before the first
    /// ConnAck.
    pub async fn connect(config: MqttConfig) -> Result<Self, ConnectorError> {
        config.validate()?;

        let (client, eventloop) = AsyncClient::new(config.options(), config.channel_capacity);
        let bus = Self {
            client: client.clone(),
            subscribers: Arc::new(SubscriberSet::default()),
            connected: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(ConnectionStats::default())),
            shutdown: CancellationToken::new(),
            config,
        };

        let driver = EventLoopDriver {
            eventloop,
            client,
            qos: qos_from_u8(bus.config.qos),
            max_consecutive_errors: bus.config.max_consecutive_errors,
            subscribers: bus.subscribers.clone(),
            connected: bus.connected.clone(),
            stats: bus.stats.clone(),
            shutdown: bus.shutdown.clone(),
        };
        tokio::spawn(driver.run());

        info!(
            "MQTT bus {} connecting to {}:{}",
            bus.config.client_id, bus.config.host, bus.config.port
        );
        Ok(bus)
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<(), ConnectorError> {
        if self.shutdown.is_cancelled() || self.subscribers.is_closed() {
            return Err(ConnectorError::Closed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageBus for MqttBus {
    async fn subscribe(&self, filter: &str) -> Result<Subscription, ConnectorError> {
        self.ensure_open()?;
        let subscription = self
            .subscribers
            .add(filter, self.config.channel_capacity)?;

        self.client
            .subscribe(filter, qos_from_u8(self.config.qos))
            .await
            .map_err(|e| ConnectorError::ProtocolError(e.to_string()))?;

        info!("MQTT bus {} subscribed to {}", self.config.client_id, filter);
        Ok(subscription)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ConnectorError> {
        self.ensure_open()?;
        let len = payload.len();

        match self
            .client
            .publish(topic, qos_from_u8(self.config.qos), false, payload)
            .await
        {
            Ok(()) => {
                self.stats.lock().record_sent(len);
                Ok(())
            }
            Err(e) => {
                self.stats.lock().record_failure(&e);
                Err(ConnectorError::ProtocolError(e.to_string()))
            }
        }
    }

    async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect request failed: {}", e);
        }
        self.subscribers.close();
        self.connected.store(false, Ordering::SeqCst);
        info!("MQTT bus {} shut down", self.config.client_id);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn stats(&self) -> ConnectionStats {
        self.stats.lock().clone()
    }
}

struct EventLoopDriver {
    eventloop: EventLoop,
    client: AsyncClient,
    qos: QoS,
    max_consecutive_errors: u32,
    subscribers: Arc<SubscriberSet>,
    connected: Arc<AtomicBool>,
    stats: Arc<Mutex<ConnectionStats>>,
    shutdown: CancellationToken,
}

impl EventLoopDriver {
    async fn run(mut self) {
        let mut consecutive_errors: u32 = 0;
        let mut ever_connected = false;

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    consecutive_errors = 0;
                    self.stats.lock().messages_received += 1;
                    let message = BusMessage::new(publish.topic, publish.payload.to_vec());
                    if self.subscribers.deliver(&message).await == 0 {
                        debug!("No local subscriber for {}", message.topic);
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    consecutive_errors = 0;
                    self.connected.store(true, Ordering::SeqCst);
                    if ever_connected {
                        self.stats.lock().reconnections += 1;
                        self.resubscribe();
                    }
                    ever_connected = true;
                    info!("MQTT connection established");
                }
                Ok(_) => {
                    consecutive_errors = 0;
                }
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    self.stats.lock().last_error = Some(e.to_string());
                    consecutive_errors += 1;

                    if consecutive_errors >= self.max_consecutive_errors {
                        error!(
                            "MQTT broker unreachable after {} consecutive errors, closing bus: {}",
                            consecutive_errors, e
                        );
                        break;
                    }

                    let backoff_secs =
                        (1u64 << (consecutive_errors - 1).min(5)).min(MAX_BACKOFF_SECS);
                    warn!(
                        "MQTT error ({}/{}): {}, retrying in {}s",
                        consecutive_errors, self.max_consecutive_errors, e, backoff_secs
                    );

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        self.subscribers.close();
        info!("MQTT event loop stopped");
    }

    fn resubscribe(&self) {
        for filter in self.subscribers.filters() {
            if let Err(e) = self.client.try_subscribe(filter.as_str(), self.qos) {
                warn!("Failed to resubscribe to {}: {}", filter, e);
            }
        }
    }
}
