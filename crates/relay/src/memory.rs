//! In-memory relay used by unit and end-to-end tests.
//!
//! Behaves like a single well-behaved relay: stores every published
//! event, answers fetches from the store, and forwards events matching
//! the active subscription to all incoming-stream subscribers. Tests
//! inject remote-authored events with [`InMemoryRelay::inject`].

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use tenex_domain::event::Event;
use tenex_domain::Result;

use crate::filter::Filter;
use crate::traits::RelayClient;

pub struct InMemoryRelay {
    store: Mutex<Vec<Event>>,
    subscription: Mutex<Vec<Filter>>,
    events_tx: broadcast::Sender<Event>,
}

impl Default for InMemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRelay {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            store: Mutex::new(Vec::new()),
            subscription: Mutex::new(Vec::new()),
            events_tx,
        }
    }

    /// Deliver an event as if a remote author published it to the relay.
    pub fn inject(&self, event: Event) {
        self.accept(event);
    }

    /// Every event the relay has accepted, in acceptance order.
    pub fn published(&self) -> Vec<Event> {
        self.store.lock().clone()
    }

    /// Re-deliver a stored event to current subscribers, modelling
    /// at-least-once delivery after a reconnect.
    pub fn redeliver(&self, event_id: &str) {
        let event = self
            .store
            .lock()
            .iter()
            .find(|e| e.id == event_id)
            .cloned();
        if let Some(event) = event {
            let matches = self
                .subscription
                .lock()
                .iter()
                .any(|f| f.matches(&event));
            if matches {
                let _ = self.events_tx.send(event);
            }
        }
    }

    /// Accepted events of the given kind.
    pub fn published_of_kind(&self, kind: u16) -> Vec<Event> {
        self.store
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    fn accept(&self, event: Event) {
        {
            let mut store = self.store.lock();
            if store.iter().any(|e| e.id == event.id) {
                return;
            }
            store.push(event.clone());
        }
        let matches = self
            .subscription
            .lock()
            .iter()
            .any(|f| f.matches(&event));
        if matches {
            let _ = self.events_tx.send(event);
        }
    }
}

#[async_trait::async_trait]
impl RelayClient for InMemoryRelay {
    async fn update_subscription(&self, filters: Vec<Filter>) -> Result<()> {
        *self.subscription.lock() = filters;
        Ok(())
    }

    async fn publish(&self, event: Event) -> Result<()> {
        self.accept(event);
        Ok(())
    }

    async fn fetch(&self, filters: Vec<Filter>, _timeout: Duration) -> Result<Vec<Event>> {
        Ok(self
            .store
            .lock()
            .iter()
            .filter(|e| filters.iter().any(|f| f.matches(e)))
            .cloned()
            .collect())
    }

    fn incoming(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    async fn close(&self) {}
}
