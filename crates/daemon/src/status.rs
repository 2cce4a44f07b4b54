//! Status publishing: the periodic project heartbeat and the
//! operations-status broadcast. Both are ephemeral events signed by the
//! PM's key.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tenex_domain::event::EventDraft;
use tenex_domain::kind;
use tenex_tools::ToolRegistry;

use crate::project::ProjectContext;

/// Spawn the heartbeat loop for one project.
pub fn spawn_heartbeat(ctx: Arc<ProjectContext>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(
            ctx.config.runtime.status_interval_ms,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            publish_status(&ctx).await;
        }
    })
}

/// One heartbeat: the project's live agents, their models, and their
/// tools. System tools (the delegation primitives and core agent tools)
/// are not enumerated.
pub async fn publish_status(ctx: &Arc<ProjectContext>) {
    let Some(pm) = ctx.pm() else {
        tracing::debug!(project_id = %ctx.project_id, "no PM, skipping status heartbeat");
        return;
    };
    let project = ctx.project();
    let roster = ctx.roster();

    let mut draft = EventDraft::new(kind::STATUS_EPHEMERAL, "")
        .tag(["a", ctx.project_id.as_str()])
        .tag(["p", project.owner_pubkey.as_str()]);

    // agent tags: [agent, pubkey, slug, ("pm")].
    for handle in &roster {
        let def = &handle.definition;
        if def.is_pm {
            draft = draft.tag(["agent", def.pubkey.as_str(), def.slug.as_str(), "pm"]);
        } else {
            draft = draft.tag(["agent", def.pubkey.as_str(), def.slug.as_str()]);
        }
    }

    // model tags: [model, configSlug, agent-slug…] grouped by config.
    let mut by_model: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for handle in &roster {
        let slug = handle
            .definition
            .llm_config
            .clone()
            .unwrap_or_else(|| "default".to_string());
        by_model
            .entry(slug)
            .or_default()
            .push(handle.definition.slug.clone());
    }
    for (model, agents) in by_model {
        let mut tuple = vec!["model".to_string(), model];
        tuple.extend(agents);
        draft = draft.tag(tuple);
    }

    // tool tags: [tool, toolName, agent-slug…], system tools excluded.
    let mut by_tool: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for handle in &roster {
        for name in ctx.tools.names_for_agent(&handle.definition.tools) {
            if ToolRegistry::is_core(&name) {
                continue;
            }
            by_tool
                .entry(name)
                .or_default()
                .push(handle.definition.slug.clone());
        }
    }
    for (tool, agents) in by_tool {
        let mut tuple = vec!["tool".to_string(), tool];
        tuple.extend(agents);
        draft = draft.tag(tuple);
    }

    if let Err(e) = pm.publisher.publish_draft(draft, None).await {
        tracing::warn!(project_id = %ctx.project_id, error = %e, "status heartbeat publish failed");
    }
}

/// Broadcast the in-flight operation set; fired when operations start
/// and finish. One `["operation", opId, agentSlug, conversationId]` tag
/// per in-flight operation.
pub async fn publish_operations_status(ctx: &Arc<ProjectContext>) {
    let Some(pm) = ctx.pm() else {
        return;
    };
    let mut draft = EventDraft::new(kind::OPERATIONS_STATUS_EPHEMERAL, "")
        .tag(["a", ctx.project_id.as_str()]);
    for op in ctx.operations.snapshot() {
        draft = draft.tag([
            "operation",
            op.id.as_str(),
            op.agent_slug.as_str(),
            op.conversation_id.as_str(),
        ]);
    }
    if let Err(e) = pm.publisher.publish_draft(draft, None).await {
        tracing::debug!(error = %e, "operations status publish failed");
    }
}
