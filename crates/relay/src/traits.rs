//! The relay client contract.
//!
//! The daemon holds exactly one client (a [`crate::ws::RelayPool`] in
//! production, [`crate::memory::InMemoryRelay`] in tests) and speaks to
//! it through this trait. Signature verification of inbound events is the
//! transport's responsibility; everything behind this trait arrives
//! pre-verified.

use std::time::Duration;

use tokio::sync::broadcast;

use tenex_domain::event::Event;
use tenex_domain::Result;

use crate::filter::Filter;

#[async_trait::async_trait]
pub trait RelayClient: Send + Sync {
    /// Replace the daemon's consolidated subscription with a new filter
    /// set. Events matching any filter flow to [`Self::incoming`]
    /// subscribers with at-least-once delivery.
    async fn update_subscription(&self, filters: Vec<Filter>) -> Result<()>;

    /// Publish a signed event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// One-shot query: collect stored events matching the filters until
    /// the relays signal end-of-stored-events or the timeout elapses.
    async fn fetch(&self, filters: Vec<Filter>, timeout: Duration) -> Result<Vec<Event>>;

    /// Subscribe to the merged inbound event stream.
    fn incoming(&self) -> broadcast::Receiver<Event>;

    /// Close all connections.
    async fn close(&self);
}
