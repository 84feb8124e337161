//! Inbound message routing
//!
//! Every bus message goes through [`MessageRouter::route`]:
//!
//! ```text
//! topic ──parse──▶ deviceId ──┬─ not device-scoped ──▶ ignored
//!                             │
//! payload ──decode────────────┼─ error ──▶ fail device waiters, log
//!                             │
//!                             ├─▶ correlator.offer(...)          (always)
//!                             └─▶ encoder ──▶ store.write_point  (EVENT only)
//! ```
//!
//! Correlation and persistence are independent: a button press can resolve
//! a waiter and still be recorded.
//!
//! One task consumes every subscription, so each bus message is routed once
//! and a subscription's messages are routed in delivery order.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use parkwatch_connectors::{Subscription, TimeSeriesStore};
use parkwatch_core::{PointEncoder, TelemetryMessage, TopicAddress};
use tokio_util::sync::CancellationToken;

use crate::correlator::EventCorrelator;

/// What happened to one routed message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// At least one correlation waiter was resolved
    pub claimed: bool,
    /// A point was handed to the store
    pub persisted: bool,
}

/// Router counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouterStats {
    /// Messages decoded and dispatched
    pub routed: u64,
    /// Messages that resolved at least one correlation waiter
    pub claimed: u64,
    pub decode_failures: u64,
    pub points_written: u64,
    pub encode_failures: u64,
    /// Messages on topics without a device id
    pub ignored: u64,
}

/// Why [`MessageRouter::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterExit {
    Shutdown,
    SubscriptionClosed,
}

/// Dispatches bus messages to the correlator and the store
pub struct MessageRouter {
    correlator: Arc<EventCorrelator>,
    store: Arc<dyn TimeSeriesStore>,
    encoder: PointEncoder,
    stats: Mutex<RouterStats>,
}

impl MessageRouter {
    pub fn new(
        correlator: Arc<EventCorrelator>,
        store: Arc<dyn TimeSeriesStore>,
        encoder: PointEncoder,
    ) -> Self {
        Self {
            correlator,
            store,
            encoder,
            stats: Mutex::new(RouterStats::default()),
        }
    }

    /// Route one raw bus message
    pub fn route(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        let Some(address) = TopicAddress::parse(topic) else {
            debug!("Ignoring message on non-device topic {}", topic);
            self.stats.lock().ignored += 1;
            return RouteOutcome::default();
        };
        let device_id = address.device_id();

        let message = match TelemetryMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                let failed = self.correlator.fail_device(device_id, &e);
                warn!("Dropping undecodable payload from {}: {} ({} waiter(s) failed)", device_id, e, failed);
                self.stats.lock().decode_failures += 1;
                return RouteOutcome::default();
            }
        };

        let claimed = self.correlator.offer(device_id, &message) > 0;
        let persisted = message.is_event() && self.persist(device_id, &message);

        {
            let mut stats = self.stats.lock();
            stats.routed += 1;
            if claimed {
                stats.claimed += 1;
            }
        }
        debug!(
            "Routed {} from {} (claimed: {}, persisted: {})",
            message.app_id, device_id, claimed, persisted
        );
        RouteOutcome { claimed, persisted }
    }

    fn persist(&self, device_id: &str, message: &TelemetryMessage) -> bool {
        match self.encoder.encode(device_id, message) {
            Ok(Some(point)) => {
                self.store.write_point(point);
                self.stats.lock().points_written += 1;
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Dropping reading from {}: {}", device_id, e);
                self.stats.lock().encode_failures += 1;
                false
            }
        }
    }

    /// Route messages from all `subscriptions` until every one has closed
    /// or `shutdown` fires
    pub async fn run(&self, subscriptions: Vec<Subscription>, shutdown: CancellationToken) -> RouterExit {
        let filters: Vec<String> = subscriptions.iter().map(|s| s.filter().to_string()).collect();
        info!("Router consuming {}", filters.join(", "));

        let mut messages = stream::select_all(subscriptions.into_iter().map(|subscription| {
            stream::unfold(subscription, |mut subscription| async move {
                subscription.recv().await.map(|message| (message, subscription))
            })
            .boxed()
        }));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Router shutting down");
                    return RouterExit::Shutdown;
                }
                message = messages.next() => match message {
                    Some(message) => {
                        self.route(&message.topic, &message.payload);
                    }
                    None => {
                        warn!("Subscriptions closed: {}", filters.join(", "));
                        return RouterExit::SubscriptionClosed;
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        self.stats.lock().clone()
    }
}
