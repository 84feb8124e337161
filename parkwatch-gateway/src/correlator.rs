//! Event Correlation Under Timeout
//!
//! ## Overview
//!
//! A caller that needs "the next event from device X that looks like Y"
//! registers a waiter and suspends. The router offers every decoded message
//! to the correlator; the first decisive event resolves the waiter:
//!
//! - a message for the device that satisfies the predicate, or
//! - an undecodable payload from the device, or
//! - the deadline.
//!
//! ## Guarantees
//!
//! - **Exactly once**: a waiter's result slot is written at most once. Every
//!   resolver (match, decode failure, close) removes the waiter and writes
//!   its slot inside one critical section, so a resolver and the deadline
//!   cannot both resolve it.
//! - **No leaks**: registration returns a [`PendingEvent`] that deregisters
//!   on drop. Resolution, timeout and caller abandonment (dropping the
//!   future) all go through it.
//! - **Match beats timer**: the wait polls the result slot before the timer,
//!   and a deadline that loses the race to an in-flight resolution returns
//!   that resolution instead of a timeout.
//! - **Independent waiters**: several waiters may watch the same device with
//!   different predicates. A message matching several resolves all of them.
//!
//! ```text
//!   caller                 correlator                 router
//!     │ watch(dev, pred) ──▶ waiters[dev] += w
//!     │ wait(timeout) ...                    ◀── offer(dev, msg)
//!     │                    pred(msg)? remove w, send(msg)
//!     │ ◀──────────────── Ok(msg)
//! ```
//!
//! The registry lock is never held across an await point. Predicates run
//! under it and must be cheap.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use parkwatch_core::{DecodeError, TelemetryMessage};
use tokio::sync::oneshot;

use crate::error::CorrelationError;

/// Match condition for a correlation waiter
pub type Predicate = Box<dyn Fn(&TelemetryMessage) -> bool + Send + Sync>;

type Resolution = Result<TelemetryMessage, CorrelationError>;

struct Waiter {
    id: u64,
    predicate: Predicate,
    slot: oneshot::Sender<Resolution>,
}

#[derive(Default)]
struct Registry {
    waiters: HashMap<String, Vec<Waiter>>,
    next_id: u64,
    closed: bool,
}

impl Registry {
    fn remove(&mut self, device_id: &str, id: u64) -> bool {
        let Some(list) = self.waiters.get_mut(device_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|w| w.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.waiters.remove(device_id);
        }
        removed
    }
}

/// Registry of in-flight device correlations
#[derive(Default)]
pub struct EventCorrelator {
    registry: Mutex<Registry>,
}

impl EventCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter without suspending
    ///
    /// Events offered after this call can resolve the returned handle, so
    /// a caller can register, trigger the device, then wait without racing
    /// the reply.
    pub fn watch<P>(&self, device_id: &str, predicate: P) -> Result<PendingEvent<'_>, CorrelationError>
    where
        P: Fn(&TelemetryMessage) -> bool + Send + Sync + 'static,
    {
        let (slot, rx) = oneshot::channel();
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(CorrelationError::Closed);
        }

        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .waiters
            .entry(device_id.to_string())
            .or_default()
            .push(Waiter {
                id,
                predicate: Box::new(predicate),
                slot,
            });
        debug!("Correlation waiter {} registered for {}", id, device_id);

        Ok(PendingEvent {
            correlator: self,
            device_id: device_id.to_string(),
            id,
            rx,
        })
    }

    /// Wait for the first event from `device_id` satisfying `predicate`
    pub async fn await_device_event<P>(
        &self,
        device_id: &str,
        predicate: P,
        timeout: Duration,
    ) -> Result<TelemetryMessage, CorrelationError>
    where
        P: Fn(&TelemetryMessage) -> bool + Send + Sync + 'static,
    {
        self.watch(device_id, predicate)?.wait(timeout).await
    }

    /// Offer a decoded message; returns how many waiters it resolved
    pub fn offer(&self, device_id: &str, message: &TelemetryMessage) -> usize {
        let mut registry = self.registry.lock();
        let Some(list) = registry.waiters.get_mut(device_id) else {
            return 0;
        };

        let mut resolved = 0;
        let mut index = 0;
        while index < list.len() {
            if (list[index].predicate)(message) {
                let waiter = list.swap_remove(index);
                if waiter.slot.send(Ok(message.clone())).is_ok() {
                    resolved += 1;
                }
            } else {
                index += 1;
            }
        }

        if list.is_empty() {
            registry.waiters.remove(device_id);
        }
        if resolved > 0 {
            debug!("{} resolved {} waiter(s) with {}", device_id, resolved, message.app_id);
        }
        resolved
    }

    /// Fail every waiter on `device_id` with a decode error
    pub fn fail_device(&self, device_id: &str, error: &DecodeError) -> usize {
        let mut registry = self.registry.lock();
        registry
            .waiters
            .remove(device_id)
            .into_iter()
            .flatten()
            .map(|w| w.slot.send(Err(CorrelationError::Decode(error.clone()))))
            .filter(Result::is_ok)
            .count()
    }

    /// Fail every waiter with [`CorrelationError::Closed`] and refuse new ones
    pub fn close(&self) {
        let mut registry = self.registry.lock();
        registry.closed = true;
        for waiter in registry.waiters.drain().flat_map(|(_, list)| list) {
            let _ = waiter.slot.send(Err(CorrelationError::Closed));
        }
    }

    /// Live waiters on one device
    pub fn pending(&self, device_id: &str) -> usize {
        self.registry
            .lock()
            .waiters
            .get(device_id)
            .map_or(0, Vec::len)
    }

    /// Live waiters across all devices
    pub fn pending_total(&self) -> usize {
        self.registry.lock().waiters.values().map(Vec::len).sum()
    }

    fn deregister(&self, device_id: &str, id: u64) -> bool {
        self.registry.lock().remove(device_id, id)
    }
}

/// A registered correlation waiter
///
/// Dropping it before resolution deregisters the waiter.
pub struct PendingEvent<'a> {
    correlator: &'a EventCorrelator,
    device_id: String,
    id: u64,
    rx: oneshot::Receiver<Resolution>,
}

impl PendingEvent<'_> {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Suspend until resolution or `timeout`
    pub async fn wait(mut self, timeout: Duration) -> Result<TelemetryMessage, CorrelationError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Err(CorrelationError::Closed),
            Err(_) => {
                if self.correlator.deregister(&self.device_id, self.id) {
                    debug!("Correlation waiter {} on {} timed out", self.id, self.device_id);
                    return Err(CorrelationError::Timeout(timeout));
                }
                // Already removed by a resolver, which wrote the slot before
                // releasing the registry lock.
                match self.rx.try_recv() {
                    Ok(resolution) => resolution,
                    Err(_) => Err(CorrelationError::Timeout(timeout)),
                }
            }
        }
    }
}

impl Drop for PendingEvent<'_> {
    fn drop(&mut self) {
        self.correlator.deregister(&self.device_id, self.id);
    }
}
