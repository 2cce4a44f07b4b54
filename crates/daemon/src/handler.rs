//! Per-project event pipeline: ignore → dedup → delegation matching →
//! conversation resolution → append → kind dispatch.
//!
//! Every step is idempotent on event id; re-delivery of a processed
//! event is a no-op end to end.

use std::sync::Arc;
use std::time::Duration;

use tenex_domain::agent::ProjectDefinition;
use tenex_domain::conversation::Conversation;
use tenex_domain::event::Event;
use tenex_domain::kind;
use tenex_relay::Filter;

use crate::delegation::ResponseOutcome;
use crate::executor;
use crate::project::ProjectContext;
use crate::resolver;

pub async fn handle_event(ctx: Arc<ProjectContext>, event: Event) {
    // 1. Ignored kinds never enter the pipeline.
    if kind::is_ignored(event.kind) {
        return;
    }
    // Malformed events are dropped without touching the dedup cache.
    if event.id.is_empty() || event.pubkey.is_empty() {
        tracing::debug!("dropping malformed event without id or signer");
        return;
    }

    // 2. Deduplication.
    if ctx.event_router.seen(&event.id) {
        tracing::trace!(event_id = %event.id, "duplicate event, dropped");
        return;
    }
    ctx.event_router.mark_processed(&event.id);

    tracing::debug!(
        event_id = %event.id,
        kind = event.kind,
        pubkey = %event.pubkey,
        project_id = %ctx.project_id,
        "handling event"
    );

    // 3. Delegation responses are matched by the registry, which owns
    //    re-activation of the waiting delegator; no agent dispatch here.
    if event
        .e_tags()
        .iter()
        .any(|r| ctx.delegations.is_task(&r.id))
    {
        handle_delegation_response(&ctx, event).await;
        return;
    }

    // Lessons are recorded, never routed to executors; they join a
    // conversation's history only when one is already resolvable.
    if event.kind == kind::AGENT_LESSON {
        if let Some(conversation) = find_conversation_for(&ctx, &event) {
            let _ = ctx.conversations.append_event(&conversation.id, event.clone());
            ctx.conversations.persist(&conversation.id);
        }
        ctx.record_lesson(&event);
        return;
    }

    // 4. Conversation resolution.
    let Some(conversation) = resolve_conversation(&ctx, &event).await else {
        tracing::warn!(event_id = %event.id, "event could not be resolved to a conversation");
        return;
    };

    // 5. Append (no-op when the event is the conversation root).
    if let Err(e) = ctx.conversations.append_event(&conversation.id, event.clone()) {
        tracing::warn!(error = %e, "append failed");
        return;
    }

    // 6. Kind dispatch.
    match event.kind {
        kind::PROJECT_DEF => handle_project_update(&ctx, &event).await,
        kind::AGENT_CONFIG_UPDATE => {
            if let Err(e) = ctx.agent_store.apply_config_update(&event) {
                tracing::warn!(error = %e, "agent config update rejected");
            } else {
                ctx.rebuild_roster();
            }
        }
        kind::METADATA_REPLY => handle_metadata_reply(&ctx, &conversation.id, &event),
        kind::STOP_REQUEST => handle_stop_request(&ctx, &conversation.id, &event),
        _ if resolver::is_dispatchable(&event) => {
            let roster = ctx.roster_definitions();
            let targets: Vec<String> = resolver::resolve_targets(&event, &roster)
                .into_iter()
                .map(|a| a.pubkey.clone())
                .collect();
            tracing::debug!(event_id = %event.id, targets = targets.len(), "dispatching to agents");
            for pubkey in targets {
                if let Some(agent) = ctx.agent_by_pubkey(&pubkey) {
                    executor::spawn(ctx.clone(), agent, conversation.id.clone(), event.clone());
                }
            }
        }
        other => {
            tracing::trace!(kind = other, "no dispatch for kind");
        }
    }

    ctx.conversations.persist(&conversation.id);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delegation responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_delegation_response(ctx: &Arc<ProjectContext>, event: Event) {
    let outcome = ctx.delegations.record_response(&event);

    // The response belongs in history whatever the registry decided.
    if let Some(conversation) = find_conversation_for(ctx, &event) {
        let _ = ctx.conversations.append_event(&conversation.id, event.clone());
        ctx.conversations.persist(&conversation.id);
    }

    match outcome {
        ResponseOutcome::Completed {
            batch_id,
            delegator,
            conversation_id,
        } => {
            tracing::info!(
                batch_id = %batch_id,
                delegator = %delegator,
                conversation_id = %conversation_id,
                "delegation batch complete, re-activating delegator"
            );
            let Some(agent) = ctx.agent_by_pubkey(&delegator) else {
                tracing::warn!(delegator = %delegator, "completed batch has no local delegator");
                return;
            };
            // The delegator is no longer dormant.
            let mut state = ctx
                .conversations
                .agent_state(&conversation_id, &agent.definition.slug);
            state.pending_delegation = None;
            let _ = ctx
                .conversations
                .set_agent_state(&conversation_id, &agent.definition.slug, state);
            executor::spawn(ctx.clone(), agent, conversation_id, event);
        }
        ResponseOutcome::Recorded => {}
        ResponseOutcome::Duplicate => {
            tracing::debug!(event_id = %event.id, "duplicate delegation response, first one stands");
        }
        ResponseOutcome::Late => {
            tracing::debug!(event_id = %event.id, "late delegation response, batch already closed");
        }
        ResponseOutcome::WrongSigner => {
            tracing::warn!(event_id = %event.id, signer = %event.pubkey, "delegation response signer mismatch");
        }
        ResponseOutcome::UnknownTask => {
            tracing::debug!(event_id = %event.id, "response references no known task");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn find_conversation_for(ctx: &ProjectContext, event: &Event) -> Option<Conversation> {
    if let Some(conv) = ctx.conversations.get_by_any_event_id(&event.id) {
        return Some(conv);
    }
    for r in event.e_tags() {
        if let Some(conv) = ctx.conversations.get_by_any_event_id(&r.id) {
            return Some(conv);
        }
    }
    None
}

async fn resolve_conversation(ctx: &Arc<ProjectContext>, event: &Event) -> Option<Conversation> {
    // A thread root starts a fresh conversation.
    if kind::is_thread_root(event.kind) {
        return Some(ctx.conversations.create(event.clone()));
    }

    // Root-marked reference to a known conversation.
    if let Some(root_ref) = event.root_ref() {
        if let Some(conv) = ctx.conversations.get_by_any_event_id(&root_ref.id) {
            return Some(conv);
        }
        // Unknown ancestry: bounded fetch of the referenced thread.
        if let Some(conv) = fetch_orphan_thread(ctx, &root_ref.id).await {
            return Some(conv);
        }
        return Some(orphan_conversation(ctx, event));
    }

    // Spec-article threads are keyed by their addressable reference.
    if let Some(addr) = event.a_tag() {
        if addr.starts_with(&format!("{}:", kind::SPEC_DOC)) {
            return Some(ctx.conversations.create_with_id(addr, event.clone()));
        }
    }

    // Any other reference into a known conversation.
    if let Some(conv) = find_conversation_for(ctx, event) {
        return Some(conv);
    }

    Some(orphan_conversation(ctx, event))
}

fn orphan_conversation(ctx: &ProjectContext, event: &Event) -> Conversation {
    let conv = ctx.conversations.create(event.clone());
    let _ = ctx.conversations.set_metadata(&conv.id, "orphaned", "true");
    tracing::info!(conversation_id = %conv.id, "created orphan conversation");
    // Re-read so the caller sees the annotation.
    ctx.conversations.get(&conv.id).unwrap_or(conv)
}

/// Fetch an unknown root and its thread from the relays, bounded in
/// depth and time.
async fn fetch_orphan_thread(ctx: &Arc<ProjectContext>, root_id: &str) -> Option<Conversation> {
    let timeout = Duration::from_millis(ctx.config.runtime.orphan_fetch_timeout_ms);
    let depth = ctx.config.runtime.orphan_fetch_depth;
    let filters = vec![
        Filter::new().ids([root_id]),
        Filter::new().e_tags([root_id]).limit(depth),
    ];
    let events = match ctx.relay.fetch(filters, timeout).await {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!(root_id = %root_id, error = %e, "orphan thread fetch failed");
            return None;
        }
    };
    if !events.iter().any(|e| e.id == root_id) {
        return None;
    }
    let thread: Vec<Event> = events
        .into_iter()
        .filter(|e| kind::is_conversation_bearing(e.kind) || e.id == root_id)
        .collect();
    tracing::info!(root_id = %root_id, events = thread.len(), "recovered orphan thread");
    ctx.conversations.create_from_thread(thread)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Kind-specific handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_project_update(ctx: &Arc<ProjectContext>, event: &Event) {
    let project = ctx.project();
    if event.pubkey != project.owner_pubkey || event.d_tag() != Some(project.d_tag.as_str()) {
        tracing::debug!(event_id = %event.id, "project definition for another project, ignored");
        return;
    }
    let definition = match ProjectDefinition::from_event(event) {
        Ok(def) => def,
        Err(e) => {
            tracing::warn!(error = %e, "malformed project definition update");
            return;
        }
    };
    let agents_before = ctx.project().agents;
    let pubkeys = ctx.reload_definition(definition.clone());
    if agents_before != definition.agents {
        tracing::info!(
            project_id = %ctx.project_id,
            agents = definition.agents.len(),
            "project agent set changed, updating subscription"
        );
    }
    if let Err(e) = ctx
        .subscriptions
        .register_project(&ctx.project_id, pubkeys, ctx.inbox.clone())
        .await
    {
        tracing::warn!(error = %e, "subscription update failed after project reload");
    }
}

fn handle_metadata_reply(ctx: &ProjectContext, conversation_id: &str, event: &Event) {
    let title = event
        .title()
        .map(str::to_string)
        .or_else(|| {
            let content = event.content.trim();
            (!content.is_empty()).then(|| content.to_string())
        });
    if let Some(title) = title {
        let _ = ctx.conversations.set_metadata(conversation_id, "title", &title);
    }
    for topic in event.t_tags() {
        let _ = ctx
            .conversations
            .set_metadata(conversation_id, &format!("topic:{topic}"), "true");
    }
}

fn handle_stop_request(ctx: &ProjectContext, conversation_id: &str, event: &Event) {
    // A stop may be scoped to specific agents via p-tags; otherwise it
    // cancels every operation on the conversation.
    let p_tags = event.p_tags();
    let slugs: Vec<String> = p_tags
        .iter()
        .filter_map(|pk| ctx.agent_by_pubkey(pk))
        .map(|h| h.definition.slug)
        .collect();

    let cancelled = if slugs.is_empty() {
        ctx.operations.cancel_matching(conversation_id, None)
    } else {
        slugs
            .iter()
            .map(|slug| ctx.operations.cancel_matching(conversation_id, Some(slug.as_str())))
            .sum()
    };
    // Open delegation batches on the conversation stop waiting too.
    let batches = ctx.delegations.cancel_for_conversation(conversation_id);
    tracing::info!(
        conversation_id = %conversation_id,
        operations = cancelled,
        batches,
        "stop request handled"
    );
}
