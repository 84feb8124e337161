//! Local fan-out from one bus connection to many subscriptions

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{topic_matches, BusMessage, ConnectorError, Subscription};

struct Subscriber {
    filter: String,
    tx: mpsc::Sender<BusMessage>,
}

#[derive(Default)]
struct Inner {
    subscribers: Vec<Subscriber>,
    closed: bool,
}

/// Registered subscriptions of one bus
#[derive(Default)]
pub(crate) struct SubscriberSet {
    inner: Mutex<Inner>,
}

impl SubscriberSet {
    pub(crate) fn add(
        &self,
        filter: &str,
        capacity: usize,
    ) -> Result<Subscription, ConnectorError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ConnectorError::Closed);
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        inner.subscribers.push(Subscriber {
            filter: filter.to_string(),
            tx,
        });
        Ok(Subscription::new(filter, rx))
    }

    /// Distinct filters of live subscriptions
    pub(crate) fn filters(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut filters: Vec<String> = inner
            .subscribers
            .iter()
            .filter(|s| !s.tx.is_closed())
            .map(|s| s.filter.clone())
            .collect();
        filters.sort();
        filters.dedup();
        filters
    }

    /// Deliver to every matching subscription, returning how many accepted it
    ///
    /// Sends wait for channel capacity so a subscription sees messages in
    /// delivery order without gaps.
    pub(crate) async fn deliver(&self, message: &BusMessage) -> usize {
        let targets: Vec<mpsc::Sender<BusMessage>> = {
            let inner = self.inner.lock();
            inner
                .subscribers
                .iter()
                .filter(|s| topic_matches(&s.filter, &message.topic))
                .map(|s| s.tx.clone())
                .collect()
        };

        let mut delivered = 0;
        for tx in targets {
            if tx.send(message.clone()).await.is_ok() {
                delivered += 1;
            }
        }

        self.inner.lock().subscribers.retain(|s| !s.tx.is_closed());
        delivered
    }

    /// Drop every sender so all subscriptions observe end-of-stream
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
