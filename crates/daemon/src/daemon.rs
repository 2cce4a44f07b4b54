//! The daemon: owns the relay client, the subscription manager, and the
//! set of project runtimes. Projects activate from disk at boot and
//! from whitelisted project-definition events at runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tenex_domain::agent::ProjectDefinition;
use tenex_domain::config::Config;
use tenex_domain::event::Event;
use tenex_domain::{kind, Error, Result};
use tenex_providers::ProviderRegistry;
use tenex_relay::{Filter, RelayClient};

use crate::agents::AgentStore;
use crate::project::{self, ProjectRuntime, SharedDeps};
use crate::subscriptions::SubscriptionManager;

pub struct Daemon {
    deps: SharedDeps,
    runtimes: HashMap<String, ProjectRuntime>,
    activations: mpsc::Receiver<Event>,
}

impl Daemon {
    /// Wire up the shared services. `whitelist_override` (from the CLI)
    /// replaces the configured whitelist when present.
    pub fn new(
        config: Arc<Config>,
        relay: Arc<dyn RelayClient>,
        whitelist_override: Option<Vec<String>>,
    ) -> Result<Self> {
        let issues = config.validate();
        for issue in &issues {
            match issue.severity {
                tenex_domain::config::ConfigSeverity::Warning => {
                    tracing::warn!("config: {issue}")
                }
                tenex_domain::config::ConfigSeverity::Error => {
                    tracing::error!("config: {issue}")
                }
            }
        }
        if issues
            .iter()
            .any(|i| i.severity == tenex_domain::config::ConfigSeverity::Error)
        {
            return Err(Error::Config("configuration validation failed".into()));
        }

        let whitelist = whitelist_override.unwrap_or_else(|| config.relays.whitelist.clone());
        let agent_store = Arc::new(AgentStore::open(&config.data.agents_dir())?);
        let providers = Arc::new(ProviderRegistry::from_config(&config.llm));
        if providers.is_empty() {
            tracing::warn!("no LLM providers configured; agents cannot respond until `tenex setup` is run");
        }

        let (activations_tx, activations) = mpsc::channel(64);
        let subscriptions =
            SubscriptionManager::new(relay.clone(), whitelist, activations_tx);

        Ok(Self {
            deps: SharedDeps {
                config,
                relay,
                providers,
                agent_store,
                subscriptions,
            },
            runtimes: HashMap::new(),
            activations,
        })
    }

    pub fn deps(&self) -> &SharedDeps {
        &self.deps
    }

    /// Boot: start the transport reader, re-activate persisted projects,
    /// then refresh definitions from the relays.
    pub async fn start(&mut self) -> Result<()> {
        self.deps.subscriptions.start();
        // Issue the base subscription before any project loads, so
        // whitelisted activations arrive.
        self.deps.subscriptions.refresh().await?;

        for definition in self.persisted_definitions() {
            self.activate(definition).await;
        }
        for definition in self.remote_definitions().await {
            self.activate(definition).await;
        }
        tracing::info!(projects = self.runtimes.len(), "daemon started");
        Ok(())
    }

    /// Main loop: process activations until interrupted.
    pub async fn run(mut self) -> Result<()> {
        self.start().await?;
        loop {
            let next = tokio::select! {
                event = self.activations.recv() => event,
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "signal listener failed");
                    }
                    tracing::info!("interrupt received, shutting down");
                    None
                }
            };
            let Some(event) = next else { break };
            match ProjectDefinition::from_event(&event) {
                Ok(definition) => self.activate(definition).await,
                Err(e) => tracing::warn!(error = %e, "invalid project definition event"),
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Start a runtime for the definition, or apply it to the running
    /// one when the project is already live.
    pub async fn activate(&mut self, definition: ProjectDefinition) {
        let project_id = definition.address();
        if let Some(runtime) = self.runtimes.get(&project_id) {
            tracing::info!(project_id = %project_id, "reloading live project definition");
            let pubkeys = runtime.ctx.reload_definition(definition);
            if let Err(e) = self
                .deps
                .subscriptions
                .register_project(&project_id, pubkeys, runtime.ctx.inbox.clone())
                .await
            {
                tracing::warn!(error = %e, "subscription update failed on reload");
            }
            return;
        }

        match ProjectRuntime::start(definition, self.deps.clone()).await {
            Ok(runtime) => {
                self.runtimes.insert(project_id, runtime);
            }
            Err(e) => {
                // A bad project never takes the daemon down.
                tracing::error!(project_id = %project_id, error = %e, "project runtime failed to start");
            }
        }
    }

    pub async fn shutdown(self) {
        for (project_id, runtime) in self.runtimes {
            tracing::info!(project_id = %project_id, "stopping project");
            runtime.stop().await;
        }
        self.deps.subscriptions.stop().await;
        self.deps.relay.close().await;
    }

    pub fn project_ids(&self) -> Vec<String> {
        self.runtimes.keys().cloned().collect()
    }

    fn persisted_definitions(&self) -> Vec<ProjectDefinition> {
        let projects_dir = self.deps.config.data.root.join("projects");
        let Ok(entries) = std::fs::read_dir(&projects_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| match project::load_definition(&entry.path()) {
                Ok(definition) => Some(definition),
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "skipping unreadable project dir");
                    None
                }
            })
            .collect()
    }

    async fn remote_definitions(&self) -> Vec<ProjectDefinition> {
        let whitelist = self.deps.config.relays.whitelist.clone();
        if whitelist.is_empty() {
            return Vec::new();
        }
        let events = match self
            .deps
            .relay
            .fetch(
                vec![Filter::new().authors(whitelist).kinds([kind::PROJECT_DEF])],
                Duration::from_secs(10),
            )
            .await
        {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, "project definition fetch failed at boot");
                return Vec::new();
            }
        };

        // Replaceable events: keep the newest per (author, d-tag).
        let mut newest: HashMap<(String, String), Event> = HashMap::new();
        for event in events {
            let Some(d_tag) = event.d_tag().map(str::to_string) else {
                continue;
            };
            let key = (event.pubkey.clone(), d_tag);
            let replace = newest
                .get(&key)
                .map_or(true, |existing| existing.created_at < event.created_at);
            if replace {
                newest.insert(key, event);
            }
        }
        newest
            .into_values()
            .filter_map(|event| ProjectDefinition::from_event(&event).ok())
            .collect()
    }
}
