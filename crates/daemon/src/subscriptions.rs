//! Subscription manager: one consolidated relay subscription for the
//! whole daemon, demultiplexed into per-project inboxes.
//!
//! The transport reader never blocks: each project inbox is a bounded
//! ring that drops its oldest un-routed event on overflow.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};

use tenex_domain::event::Event;
use tenex_domain::{kind, Result};
use tenex_relay::{Filter, RelayClient};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounded per-project event queue. `push` never blocks; overflow drops
/// the oldest entry.
pub struct Inbox {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue an event; returns `false` when an older event was
    /// dropped to make room.
    pub fn push(&self, event: Event) -> bool {
        let dropped = {
            let mut queue = self.queue.lock();
            let mut dropped = false;
            while queue.len() >= self.capacity {
                queue.pop_front();
                dropped = true;
            }
            queue.push_back(event);
            dropped
        };
        self.notify.notify_one();
        !dropped
    }

    /// Wait for the next event.
    pub async fn pop(&self) -> Event {
        loop {
            if let Some(event) = self.queue.lock().pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    /// Drain without waiting.
    pub fn try_pop(&self) -> Option<Event> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SubscriptionManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ProjectRoute {
    agent_pubkeys: HashSet<String>,
    inbox: Arc<Inbox>,
}

/// Daemon-scoped owner of the relay subscription. Project runtimes
/// register their address, agent set, and inbox; the manager recomputes
/// the union filter set on every change and re-issues one subscription.
pub struct SubscriptionManager {
    relay: Arc<dyn RelayClient>,
    whitelist: Vec<String>,
    routes: RwLock<HashMap<String, ProjectRoute>>,
    /// Whitelisted project-definition events, for daemon-level
    /// activation of projects that are not loaded yet.
    activations: mpsc::Sender<Event>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SubscriptionManager {
    pub fn new(
        relay: Arc<dyn RelayClient>,
        whitelist: Vec<String>,
        activations: mpsc::Sender<Event>,
    ) -> Arc<Self> {
        Arc::new(Self {
            relay,
            whitelist,
            routes: RwLock::new(HashMap::new()),
            activations,
            reader: Mutex::new(None),
        })
    }

    /// Spawn the transport reader loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut reader = self.reader.lock();
        if reader.is_some() {
            return;
        }
        let manager = self.clone();
        let mut incoming = self.relay.incoming();
        *reader = Some(tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(event) => manager.route(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "transport reader lagged, events skipped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        tracing::info!("relay event stream closed, reader exiting");
                        return;
                    }
                }
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    /// Register (or re-register) a project's routing entry and re-issue
    /// the consolidated subscription.
    pub async fn register_project(
        &self,
        project_id: &str,
        agent_pubkeys: HashSet<String>,
        inbox: Arc<Inbox>,
    ) -> Result<()> {
        self.routes.write().insert(
            project_id.to_string(),
            ProjectRoute {
                agent_pubkeys,
                inbox,
            },
        );
        self.resubscribe().await
    }

    pub async fn unregister_project(&self, project_id: &str) -> Result<()> {
        self.routes.write().remove(project_id);
        self.resubscribe().await
    }

    /// Re-issue the consolidated subscription from current state (used
    /// at boot, before any project registers).
    pub async fn refresh(&self) -> Result<()> {
        self.resubscribe().await
    }

    async fn resubscribe(&self) -> Result<()> {
        let filters = self.compute_filters();
        tracing::debug!(filters = filters.len(), "re-issuing consolidated subscription");
        self.relay.update_subscription(filters).await
    }

    /// The union filter set for everything the daemon must see:
    /// 1. whitelisted authors' project definitions,
    /// 2. events tagging any loaded project's address,
    /// 3. events p-tagging any loaded agent,
    /// 4. lessons authored by any loaded agent,
    /// 5. replies addressed at specification documents.
    pub fn compute_filters(&self) -> Vec<Filter> {
        let routes = self.routes.read();
        let project_ids: Vec<String> = routes.keys().cloned().collect();
        let mut agent_pubkeys: Vec<String> = routes
            .values()
            .flat_map(|r| r.agent_pubkeys.iter().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        agent_pubkeys.sort();

        let mut filters = Vec::new();
        if !self.whitelist.is_empty() {
            filters.push(
                Filter::new()
                    .authors(self.whitelist.clone())
                    .kinds([kind::PROJECT_DEF]),
            );
        }
        if !project_ids.is_empty() {
            filters.push(Filter::new().a_tags(project_ids));
        }
        if !agent_pubkeys.is_empty() {
            filters.push(Filter::new().p_tags(agent_pubkeys.clone()));
            filters.push(
                Filter::new()
                    .authors(agent_pubkeys)
                    .kinds([kind::AGENT_LESSON]),
            );
        }
        filters.push(
            Filter::new()
                .kinds([kind::GENERIC_REPLY, kind::SPEC_REPLY])
                .k_tags([kind::SPEC_DOC.to_string()]),
        );
        filters
    }

    /// Dispatch one inbound event. An event may fan to several projects
    /// and is delivered to each independently.
    fn route(&self, event: Event) {
        // Whitelisted project definitions activate projects at the
        // daemon level, before any route exists for them.
        if event.kind == kind::PROJECT_DEF && self.whitelist.contains(&event.pubkey) {
            if let Err(e) = self.activations.try_send(event.clone()) {
                tracing::warn!(error = %e, "activation channel full, dropping project definition");
            }
        }

        let routes = self.routes.read();
        let mut delivered: HashSet<&str> = HashSet::new();

        // (a) addressable reference first.
        if let Some(addr) = event.a_tag() {
            if let Some((project_id, route)) = routes.get_key_value(addr) {
                if !route.inbox.push(event.clone()) {
                    tracing::warn!(project_id = %project_id, "project inbox overflow, dropped oldest event");
                }
                delivered.insert(project_id.as_str());
            }
        }

        // (b) p-tagged agents' projects.
        let p_tags: Vec<&str> = event.p_tags();
        if !p_tags.is_empty() {
            for (project_id, route) in routes.iter() {
                if delivered.contains(project_id.as_str()) {
                    continue;
                }
                if p_tags.iter().any(|p| route.agent_pubkeys.contains(*p)) {
                    if !route.inbox.push(event.clone()) {
                        tracing::warn!(project_id = %project_id, "project inbox overflow, dropped oldest event");
                    }
                    delivered.insert(project_id.as_str());
                }
            }
        }

        if delivered.is_empty() && event.kind != kind::PROJECT_DEF {
            tracing::trace!(event_id = %event.id, kind = event.kind, "no route for event");
        }
    }
}
