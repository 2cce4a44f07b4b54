//! Project runtime: one supervised lifecycle owning everything scoped
//! to a single project — conversation store, processed-event cache,
//! delegation registry, operations registry, agent roster, status
//! heartbeat, and the inbox loop.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use tenex_conversations::{ConversationStore, EventRouter};
use tenex_domain::agent::{AgentDefinition, ProjectDefinition};
use tenex_domain::config::Config;
use tenex_domain::event::Event;
use tenex_domain::{Error, Result};
use tenex_providers::ProviderRegistry;
use tenex_relay::RelayClient;
use tenex_tools::ToolRegistry;

use crate::agents::AgentStore;
use crate::delegation::DelegationRegistry;
use crate::handler;
use crate::operations::{OperationsRegistry, RecentReplyIndex};
use crate::publisher::AgentPublisher;
use crate::status;
use crate::subscriptions::{Inbox, SubscriptionManager};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AgentHandle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An executable agent within a project: its effective definition plus
/// the publisher wrapping its signer.
#[derive(Clone)]
pub struct AgentHandle {
    pub definition: AgentDefinition,
    pub publisher: Arc<AgentPublisher>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProjectContext
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared state threaded through the handler, executor, and status
/// publisher of one project.
pub struct ProjectContext {
    /// Addressable project id (`kind:owner:d-tag`).
    pub project_id: String,
    pub config: Arc<Config>,
    pub relay: Arc<dyn RelayClient>,
    pub providers: Arc<ProviderRegistry>,
    pub conversations: Arc<ConversationStore>,
    pub event_router: EventRouter,
    pub delegations: Arc<DelegationRegistry>,
    pub operations: Arc<OperationsRegistry>,
    pub recent_replies: RecentReplyIndex,
    pub tools: Arc<ToolRegistry>,
    pub agent_store: Arc<AgentStore>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub inbox: Arc<Inbox>,
    /// Directory file tools operate in.
    pub workspace_dir: PathBuf,
    lessons_path: PathBuf,
    project: RwLock<ProjectDefinition>,
    roster: RwLock<Vec<AgentHandle>>,
}

impl ProjectContext {
    pub fn project(&self) -> ProjectDefinition {
        self.project.read().clone()
    }

    /// Effective definitions of every executable agent.
    pub fn roster(&self) -> Vec<AgentHandle> {
        self.roster.read().clone()
    }

    pub fn roster_definitions(&self) -> Vec<AgentDefinition> {
        self.roster.read().iter().map(|h| h.definition.clone()).collect()
    }

    pub fn agent_by_pubkey(&self, pubkey: &str) -> Option<AgentHandle> {
        self.roster
            .read()
            .iter()
            .find(|h| h.definition.pubkey == pubkey)
            .cloned()
    }

    pub fn agent_by_slug(&self, slug: &str) -> Option<AgentHandle> {
        self.roster
            .read()
            .iter()
            .find(|h| h.definition.slug == slug)
            .cloned()
    }

    pub fn pm(&self) -> Option<AgentHandle> {
        self.roster.read().iter().find(|h| h.definition.is_pm).cloned()
    }

    /// Replace the project definition and rebuild the roster from the
    /// agent store. Returns the new agent pubkey set for filter
    /// recomputation.
    pub fn reload_definition(&self, definition: ProjectDefinition) -> HashSet<String> {
        let pubkeys: HashSet<String> = definition.agents.iter().cloned().collect();
        *self.project.write() = definition;
        self.rebuild_roster();
        pubkeys
    }

    /// Rebuild the roster from the agent store: local definitions win,
    /// the project's PM marker overrides the stored flag, and the PM is
    /// granted the `delegate` tool.
    pub fn rebuild_roster(&self) {
        let project = self.project();
        let mut roster = Vec::new();
        for pubkey in &project.agents {
            let Some(stored) = self.agent_store.get(pubkey) else {
                tracing::warn!(pubkey = %pubkey, "project references unknown agent");
                continue;
            };
            let Some(signer) = self.agent_store.signer(pubkey) else {
                tracing::debug!(
                    pubkey = %pubkey,
                    slug = %stored.definition.slug,
                    "agent has no local key material, not executable here"
                );
                continue;
            };
            let mut definition = stored.definition;
            definition.is_pm = project.pm.as_deref() == Some(pubkey.as_str());
            if definition.is_pm {
                definition.tools.insert("delegate".to_string());
            }
            roster.push(AgentHandle {
                definition,
                publisher: Arc::new(AgentPublisher::new(self.relay.clone(), signer)),
            });
        }
        if !roster.iter().any(|h| h.definition.is_pm) {
            tracing::warn!(project_id = %self.project_id, "project has no executable PM");
        }
        *self.roster.write() = roster;
    }

    /// Append an agent lesson to the project's lesson log.
    pub fn record_lesson(&self, event: &Event) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "unserializable lesson event");
                return;
            }
        };
        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.lessons_path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            tracing::warn!(path = %self.lessons_path.display(), error = %e, "lesson append failed");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProjectRuntime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dependencies shared by every project runtime, owned by the daemon.
#[derive(Clone)]
pub struct SharedDeps {
    pub config: Arc<Config>,
    pub relay: Arc<dyn RelayClient>,
    pub providers: Arc<ProviderRegistry>,
    pub agent_store: Arc<AgentStore>,
    pub subscriptions: Arc<SubscriptionManager>,
}

pub struct ProjectRuntime {
    pub ctx: Arc<ProjectContext>,
    inbox_task: tokio::task::JoinHandle<()>,
    status_task: tokio::task::JoinHandle<()>,
}

impl ProjectRuntime {
    /// Start sequence: persist the definition, resolve the agent set
    /// (local first, relay for the rest), load the stores, register
    /// with the subscription manager, then start the heartbeat and the
    /// inbox loop.
    pub async fn start(definition: ProjectDefinition, deps: SharedDeps) -> Result<Self> {
        let project_id = definition.address();
        let project_dir = deps.config.data.project_dir(&project_id);
        std::fs::create_dir_all(&project_dir).map_err(Error::Io)?;
        persist_definition(&project_dir, &definition)?;

        deps.agent_store
            .fetch_missing(deps.relay.as_ref(), &definition.agents)
            .await?;

        let conversations = Arc::new(ConversationStore::new(&project_dir)?);
        conversations.load_all()?;
        let event_router = EventRouter::load(
            &project_dir,
            Duration::from_millis(deps.config.runtime.persist_debounce_ms),
        )?;

        let workspace_dir = project_dir.join("workspace");
        std::fs::create_dir_all(&workspace_dir).map_err(Error::Io)?;

        let inbox = Arc::new(Inbox::new(deps.config.runtime.inbox_capacity));
        let ctx = Arc::new(ProjectContext {
            project_id: project_id.clone(),
            config: deps.config.clone(),
            relay: deps.relay.clone(),
            providers: deps.providers.clone(),
            conversations,
            event_router,
            delegations: Arc::new(DelegationRegistry::new()),
            operations: Arc::new(OperationsRegistry::new()),
            recent_replies: RecentReplyIndex::new(1024),
            tools: Arc::new(ToolRegistry::builtin()),
            agent_store: deps.agent_store.clone(),
            subscriptions: deps.subscriptions.clone(),
            inbox: inbox.clone(),
            workspace_dir,
            lessons_path: project_dir.join("lessons.jsonl"),
            project: RwLock::new(definition.clone()),
            roster: RwLock::new(Vec::new()),
        });
        ctx.rebuild_roster();

        deps.subscriptions
            .register_project(
                &project_id,
                definition.agents.iter().cloned().collect(),
                inbox.clone(),
            )
            .await?;

        let status_task = status::spawn_heartbeat(ctx.clone());

        let inbox_ctx = ctx.clone();
        let inbox_task = tokio::spawn(async move {
            loop {
                let event = inbox_ctx.inbox.pop().await;
                handler::handle_event(inbox_ctx.clone(), event).await;
            }
        });

        tracing::info!(
            project_id = %project_id,
            agents = ctx.roster().len(),
            "project runtime started"
        );
        Ok(Self {
            ctx,
            inbox_task,
            status_task,
        })
    }

    /// Stop sequence, reverse of start: stop the heartbeat and inbox
    /// loop, cancel in-flight operations and grant them a bounded grace
    /// period, then unregister and flush state.
    pub async fn stop(self) {
        self.status_task.abort();
        self.inbox_task.abort();

        let cancelled = self.ctx.operations.cancel_all();
        if cancelled > 0 {
            let grace = Duration::from_millis(self.ctx.config.runtime.shutdown_grace_ms);
            let deadline = tokio::time::Instant::now() + grace;
            while !self.ctx.operations.is_empty() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if !self.ctx.operations.is_empty() {
                tracing::warn!(
                    remaining = self.ctx.operations.len(),
                    "operations still running after grace period, terminating"
                );
            }
        }

        if let Err(e) = self
            .ctx
            .subscriptions
            .unregister_project(&self.ctx.project_id)
            .await
        {
            tracing::warn!(error = %e, "unregister failed during shutdown");
        }
        self.ctx.event_router.flush();
        for id in self.ctx.conversations.ids() {
            self.ctx.conversations.persist(&id);
        }
        tracing::info!(project_id = %self.ctx.project_id, "project runtime stopped");
    }
}

fn persist_definition(project_dir: &std::path::Path, definition: &ProjectDefinition) -> Result<()> {
    let path = project_dir.join("project.json");
    let tmp = project_dir.join("project.json.tmp");
    let raw = serde_json::to_vec_pretty(definition)?;
    std::fs::write(&tmp, raw).map_err(Error::Io)?;
    std::fs::rename(&tmp, &path).map_err(Error::Io)?;
    Ok(())
}

/// Load a previously persisted project definition.
pub fn load_definition(project_dir: &std::path::Path) -> Result<ProjectDefinition> {
    let raw = std::fs::read_to_string(project_dir.join("project.json")).map_err(Error::Io)?;
    serde_json::from_str(&raw).map_err(Error::Json)
}
