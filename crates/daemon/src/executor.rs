//! Agent executor: one reason-act invocation for one (agent,
//! conversation) pair.
//!
//! Streams the LLM completion, publishes streaming frames for UI
//! consumers, dispatches tool calls, and ends the turn on the first
//! terminal tool (`complete` / `delegate` / `switch_phase`) or on plain
//! text. Cancellation is checked between stream frames and before every
//! tool dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tracing::Instrument;

use tenex_domain::conversation::Conversation;
use tenex_domain::event::Event;
use tenex_domain::stream::{StreamEvent, Usage};
use tenex_domain::tool::{Message, ToolCall};
use tenex_domain::{kind, Error, Result};
use tenex_providers::ChatRequest;
use tenex_tools::{TerminalIntent, ToolContext, ToolOutcome};

use crate::messages::MessageBuilder;
use crate::operations::CancelToken;
use crate::project::{AgentHandle, ProjectContext};
use crate::publisher::new_traceparent;
use crate::status;

/// Continuation attempts granted when the model produces nothing.
const MAX_CONTINUATIONS: u32 = 3;

/// Fire-and-forget executor invocation.
pub fn spawn(
    ctx: Arc<ProjectContext>,
    agent: AgentHandle,
    conversation_id: String,
    triggering_event: Event,
) {
    tokio::spawn(async move {
        execute(ctx, agent, conversation_id, triggering_event).await;
    });
}

/// Run one full invocation, including operation bookkeeping.
pub async fn execute(
    ctx: Arc<ProjectContext>,
    agent: AgentHandle,
    conversation_id: String,
    triggering_event: Event,
) {
    let slug = agent.definition.slug.clone();

    // Re-delivered trigger that already produced a terminal event:
    // publishing again would duplicate the observable output.
    if ctx.recent_replies.contains(&triggering_event.id, &slug) {
        tracing::debug!(
            event_id = %triggering_event.id,
            agent = %slug,
            "recent reply exists for this trigger, skipping execution"
        );
        return;
    }
    if let Some(conversation) = ctx.conversations.get(&conversation_id) {
        // The in-memory guard does not survive a restart; the persisted
        // history does. An event signed by this agent referencing the
        // trigger means the reply already went out.
        if already_replied(&conversation, &agent.definition.pubkey, &triggering_event.id) {
            tracing::debug!(
                event_id = %triggering_event.id,
                agent = %slug,
                "history already contains this agent's reply to the trigger"
            );
            ctx.recent_replies.record(&triggering_event.id, &slug);
            return;
        }
        // A delegator with an open batch is dormant until the
        // delegation registry re-activates it.
        if conversation.agent_state(&slug).pending_delegation.is_some() {
            tracing::debug!(agent = %slug, "agent is dormant awaiting delegation responses");
            return;
        }
    }

    let (op_id, token) = ctx.operations.register(&slug, &conversation_id);
    status::publish_operations_status(&ctx).await;

    let span = tracing::info_span!(
        "turn",
        agent = %slug,
        conversation_id = %conversation_id,
        operation_id = %op_id,
    );
    let result = run_invocation(&ctx, &agent, &conversation_id, &triggering_event, &token)
        .instrument(span)
        .await;

    if let Err(e) = result {
        tracing::warn!(agent = %slug, error = %e, "invocation failed");
        // The user is never left without signal: surface the failure as
        // a reply on the conversation.
        let content = match &e {
            Error::LlmTimeout(_) | Error::LlmCancelled => "No response (cancelled).".to_string(),
            _ => format!("The agent hit an internal error: {e}"),
        };
        publish_terminal_reply(&ctx, &agent, &conversation_id, &triggering_event, &content, None)
            .await;
    }

    ctx.operations.release(&op_id);
    status::publish_operations_status(&ctx).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The reason-act loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_invocation(
    ctx: &Arc<ProjectContext>,
    agent: &AgentHandle,
    conversation_id: &str,
    triggering_event: &Event,
    token: &CancelToken,
) -> Result<()> {
    let slug = &agent.definition.slug;
    let Some(conversation) = ctx.conversations.get(conversation_id) else {
        return Err(Error::ConversationNotFound(conversation_id.to_string()));
    };
    let Some(provider) = ctx
        .providers
        .resolve(agent.definition.llm_config.as_deref())
    else {
        return Err(Error::Config("no LLM provider available".into()));
    };

    let trace = new_traceparent();
    let system_prompt = compose_system_prompt(ctx, agent, &conversation);
    let roster = ctx.roster_definitions();
    let mut messages = MessageBuilder::new(
        &conversation,
        &agent.definition,
        &roster,
        &ctx.config.compression,
    )
    .build(&system_prompt, &triggering_event.id);
    let tool_defs = ctx.tools.definitions_for_agent(&agent.definition.tools);

    let soft_timeout = Duration::from_secs(ctx.config.llm.soft_timeout_secs);
    let hard_timeout = Duration::from_secs(ctx.config.llm.hard_timeout_secs);

    let mut continuations: u32 = 0;
    let mut frame_seq: u32 = 0;
    let mut last_text = String::new();
    let mut total_usage = Usage::default();

    for iteration in 0..ctx.config.runtime.max_iterations {
        if token.is_cancelled() {
            return finish_cancelled(ctx, agent, conversation_id, triggering_event, "", &trace)
                .await;
        }
        tracing::debug!(iteration, "reason-act iteration");

        let req = ChatRequest {
            messages: messages.clone(),
            tools: tool_defs.clone(),
            temperature: None,
            max_tokens: None,
            model: None,
        };

        let llm_span = tracing::info_span!(
            "llm.call",
            provider = provider.provider_id(),
            iteration,
        );
        let turn = stream_one_turn(
            agent,
            &conversation,
            provider.chat_stream(&req),
            token,
            &mut frame_seq,
            soft_timeout,
            hard_timeout,
            &trace,
        )
        .instrument(llm_span)
        .await?;

        if let Some(usage) = &turn.usage {
            total_usage.accumulate(usage);
        }

        if turn.cancelled {
            return finish_cancelled(
                ctx,
                agent,
                conversation_id,
                triggering_event,
                &turn.text,
                &trace,
            )
            .await;
        }
        if let Some(message) = turn.stream_error {
            // Mid-stream failure: surface partial text when there is
            // any, otherwise report the failure.
            tracing::warn!(error = %message, "llm stream failed");
            let content = if turn.text.trim().is_empty() {
                format!("No response (stream error: {message}).")
            } else {
                turn.text.clone()
            };
            publish_terminal_reply(
                ctx,
                agent,
                conversation_id,
                triggering_event,
                &content,
                Some(&trace),
            )
            .await;
            return Ok(());
        }

        last_text = turn.text.clone();

        // ── Terminal tool: execute exactly once and end the turn ─────
        if let Some(terminal_call) = turn
            .tool_calls
            .iter()
            .find(|call| {
                ctx.tools
                    .get(&call.tool_name)
                    .is_some_and(|t| t.is_terminal())
            })
            .cloned()
        {
            let extra = turn.tool_calls.len() - 1;
            if extra > 0 {
                tracing::debug!(extra, "ignoring tool calls issued alongside a terminal tool");
            }
            match run_tool(ctx, agent, &conversation, &terminal_call).await {
                Ok(ToolOutcome::Terminal(intent)) => {
                    return apply_terminal_intent(
                        ctx,
                        agent,
                        conversation_id,
                        triggering_event,
                        intent,
                        &trace,
                    )
                    .await;
                }
                Ok(ToolOutcome::Result(value)) => {
                    // A terminal tool returned a plain result; feed it
                    // back like any other tool.
                    messages.push(Message::assistant_with_tool_calls(
                        &turn.text,
                        std::slice::from_ref(&terminal_call),
                    ));
                    messages.push(Message::tool_result(
                        &terminal_call.call_id,
                        value.to_string(),
                    ));
                    continue;
                }
                Err(e) => {
                    // Structured tool failure (self-delegation, bad
                    // arguments): hand it back so the model can recover.
                    messages.push(Message::assistant_with_tool_calls(
                        &turn.text,
                        std::slice::from_ref(&terminal_call),
                    ));
                    messages.push(Message::tool_error(&terminal_call.call_id, e.to_string()));
                    continue;
                }
            }
        }

        // ── Plain text: the reply ────────────────────────────────────
        if turn.tool_calls.is_empty() {
            if !turn.text.trim().is_empty() {
                publish_terminal_reply(
                    ctx,
                    agent,
                    conversation_id,
                    triggering_event,
                    &turn.text,
                    Some(&trace),
                )
                .await;
                tracing::info!(
                    agent = %slug,
                    prompt_tokens = total_usage.prompt_tokens,
                    completion_tokens = total_usage.completion_tokens,
                    "turn complete"
                );
                return Ok(());
            }
            // Empty output: give the model a bounded number of nudges.
            continuations += 1;
            if continuations < MAX_CONTINUATIONS {
                tracing::debug!(continuations, "empty model output, injecting continuation hint");
                messages.push(Message::system(
                    "You produced no response. Produce a complete reply now.",
                ));
                continue;
            }
            publish_terminal_reply(
                ctx,
                agent,
                conversation_id,
                triggering_event,
                "No response.",
                Some(&trace),
            )
            .await;
            return Ok(());
        }

        // ── Non-terminal tools ───────────────────────────────────────
        messages.push(Message::assistant_with_tool_calls(
            &turn.text,
            &turn.tool_calls,
        ));
        if token.is_cancelled() {
            return finish_cancelled(
                ctx,
                agent,
                conversation_id,
                triggering_event,
                &turn.text,
                &trace,
            )
            .await;
        }
        let results = run_tool_batch(ctx, agent, &conversation, &turn.tool_calls).await;
        for (call, result) in turn.tool_calls.iter().zip(results) {
            match result {
                Ok(ToolOutcome::Result(value)) => {
                    messages.push(Message::tool_result(&call.call_id, value.to_string()));
                }
                Ok(ToolOutcome::Terminal(_)) => {
                    // Unreachable by construction (terminal handled
                    // above); guard anyway.
                    messages.push(Message::tool_error(
                        &call.call_id,
                        "tool unexpectedly ended the turn",
                    ));
                }
                Err(e) => {
                    messages.push(Message::tool_error(&call.call_id, e.to_string()));
                }
            }
        }
    }

    // Iteration bound reached without a terminal tool call.
    let content = if last_text.trim().is_empty() {
        "No response.".to_string()
    } else {
        last_text
    };
    publish_terminal_reply(
        ctx,
        agent,
        conversation_id,
        triggering_event,
        &content,
        Some(&trace),
    )
    .await;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming one model turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TurnOutput {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    cancelled: bool,
    stream_error: Option<String>,
}

#[allow(clippy::too_many_arguments)]
async fn stream_one_turn(
    agent: &AgentHandle,
    conversation: &Conversation,
    stream_future: impl std::future::Future<
        Output = Result<tenex_domain::stream::BoxStream<'static, Result<StreamEvent>>>,
    >,
    token: &CancelToken,
    frame_seq: &mut u32,
    soft_timeout: Duration,
    hard_timeout: Duration,
    trace: &str,
) -> Result<TurnOutput> {
    let mut stream = stream_future.await?;

    let started = tokio::time::Instant::now();
    let mut soft_warned = false;

    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut usage: Option<Usage> = None;
    let mut cancelled = false;
    let mut stream_error = None;

    // call_id → (name, accumulated argument json).
    let mut tc_bufs: BTreeMap<String, (String, String)> = BTreeMap::new();
    let mut last_started: Option<String> = None;

    loop {
        if token.is_cancelled() {
            cancelled = true;
            break;
        }
        if started.elapsed() > hard_timeout {
            return Err(Error::LlmTimeout(hard_timeout));
        }
        if !soft_warned && started.elapsed() > soft_timeout {
            soft_warned = true;
            tracing::warn!(elapsed_secs = started.elapsed().as_secs(), "llm call past soft timeout");
        }

        // Bounded poll so a cancellation interrupts a silent stream
        // promptly.
        let next = match tokio::time::timeout(Duration::from_millis(500), stream.next()).await {
            Ok(next) => next,
            Err(_) => continue,
        };
        let Some(event) = next else { break };
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                stream_error = Some(e.to_string());
                break;
            }
        };

        match event {
            StreamEvent::Token { text: chunk } => {
                text.push_str(&chunk);
                *frame_seq += 1;
                if let Err(e) = agent
                    .publisher
                    .publish_streaming_frame(&conversation.root_event_id, *frame_seq, &chunk, Some(trace))
                    .await
                {
                    tracing::debug!(error = %e, "streaming frame publish failed");
                }
            }
            StreamEvent::ToolCallStarted { call_id, tool_name } => {
                last_started = Some(call_id.clone());
                tc_bufs.insert(call_id, (tool_name, String::new()));
            }
            StreamEvent::ToolCallDelta { call_id, delta } => {
                // Providers key deltas by call id or by stream index;
                // fall back to the most recently started call.
                if let Some((_, args)) = tc_bufs.get_mut(&call_id) {
                    args.push_str(&delta);
                } else if let Some(started_id) = &last_started {
                    if let Some((_, args)) = tc_bufs.get_mut(started_id) {
                        args.push_str(&delta);
                    }
                }
            }
            StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            } => {
                tc_bufs.remove(&call_id);
                tool_calls.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                });
            }
            StreamEvent::Done {
                usage: turn_usage, ..
            } => {
                if turn_usage.is_some() {
                    usage = turn_usage;
                }
            }
            StreamEvent::Error { message } => {
                stream_error = Some(message);
                break;
            }
        }
    }

    // Calls announced via start/delta but never finished explicitly.
    for (call_id, (name, args)) in tc_bufs {
        let arguments: Value = if args.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&args).unwrap_or_else(|e| {
                tracing::warn!(call_id = %call_id, tool = %name, error = %e, "tool arguments are not valid JSON");
                Value::Object(Default::default())
            })
        };
        tool_calls.push(ToolCall {
            call_id,
            tool_name: name,
            arguments,
        });
    }

    Ok(TurnOutput {
        text,
        tool_calls,
        usage,
        cancelled,
        stream_error,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn tool_context(
    ctx: &ProjectContext,
    agent: &AgentHandle,
    conversation: &Conversation,
) -> ToolContext {
    ToolContext {
        agent_slug: agent.definition.slug.clone(),
        agent_pubkey: agent.definition.pubkey.clone(),
        conversation_id: conversation.id.clone(),
        conversation_phase: ctx
            .conversations
            .get(&conversation.id)
            .map(|c| c.phase)
            .unwrap_or(conversation.phase),
        project_agents: ctx
            .roster_definitions()
            .iter()
            .map(|a| (a.slug.clone(), a.pubkey.clone()))
            .collect(),
        workspace_root: ctx.workspace_dir.clone(),
    }
}

async fn run_tool(
    ctx: &Arc<ProjectContext>,
    agent: &AgentHandle,
    conversation: &Conversation,
    call: &ToolCall,
) -> Result<ToolOutcome> {
    let Some(tool) = ctx.tools.get(&call.tool_name) else {
        return Err(Error::Tool {
            tool: call.tool_name.clone(),
            message: "unknown tool".into(),
        });
    };
    let tool_ctx = tool_context(ctx, agent, conversation);
    let span = tracing::info_span!("tool.call", tool = %call.tool_name);
    tool.run(call.arguments.clone(), &tool_ctx)
        .instrument(span)
        .await
}

/// Execute a batch of non-terminal calls. When every call is declared
/// commutative they run concurrently; otherwise strictly in order.
/// Results come back in call order either way.
async fn run_tool_batch(
    ctx: &Arc<ProjectContext>,
    agent: &AgentHandle,
    conversation: &Conversation,
    calls: &[ToolCall],
) -> Vec<Result<ToolOutcome>> {
    let all_commutative = calls.iter().all(|call| {
        ctx.tools
            .get(&call.tool_name)
            .is_some_and(|t| t.is_commutative())
    });
    if all_commutative && calls.len() > 1 {
        let futures: Vec<_> = calls
            .iter()
            .map(|call| run_tool(ctx, agent, conversation, call))
            .collect();
        futures_util::future::join_all(futures).await
    } else {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(run_tool(ctx, agent, conversation, call).await);
        }
        results
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminal intents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn apply_terminal_intent(
    ctx: &Arc<ProjectContext>,
    agent: &AgentHandle,
    conversation_id: &str,
    triggering_event: &Event,
    intent: TerminalIntent,
    trace: &str,
) -> Result<()> {
    let slug = &agent.definition.slug;
    match intent {
        TerminalIntent::Complete { content } => {
            complete_turn(ctx, agent, conversation_id, triggering_event, &content, trace).await
        }
        TerminalIntent::Delegate {
            recipients,
            content,
        } => {
            let Some(conversation) = ctx.conversations.get(conversation_id) else {
                return Err(Error::ConversationNotFound(conversation_id.to_string()));
            };
            let tasks = agent.publisher.sign_delegation_tasks(
                &conversation,
                &recipients,
                &content,
                Some(conversation.phase),
                Some(trace),
            );

            // Register the batch and land the fan-out in the
            // conversation before any task hits the wire, so a fast
            // response always finds its batch. The relay echo
            // deduplicates on id.
            let task_ids: BTreeMap<String, String> = tasks
                .iter()
                .filter_map(|t| {
                    t.p_tags()
                        .first()
                        .map(|recipient| (recipient.to_string(), t.id.clone()))
                })
                .collect();
            let batch_id =
                ctx.delegations
                    .register(&agent.definition.pubkey, conversation_id, task_ids);
            for task in &tasks {
                let _ = ctx.conversations.append_event(conversation_id, task.clone());
            }
            for task in &tasks {
                agent.publisher.publish_signed(task.clone()).await?;
            }
            let mut state = ctx.conversations.agent_state(conversation_id, slug);
            state.pending_delegation = Some(batch_id.clone());
            state.last_seen_event_id = Some(triggering_event.id.clone());
            let _ = ctx.conversations.set_agent_state(conversation_id, slug, state);
            ctx.conversations.persist(conversation_id);
            ctx.recent_replies.record(&triggering_event.id, slug);

            tracing::info!(
                batch_id = %batch_id,
                recipients = tasks.len(),
                agent = %slug,
                "delegation fan-out published, delegator dormant"
            );
            // No reply: the delegator sleeps until the batch completes.
            Ok(())
        }
        TerminalIntent::SwitchPhase { to, reason } => {
            let Some(conversation) = ctx.conversations.get(conversation_id) else {
                return Err(Error::ConversationNotFound(conversation_id.to_string()));
            };
            let from = conversation.phase;
            let draft = tenex_domain::event::EventDraft::new(
                kind::GENERIC_REPLY,
                format!("Switching to {to}: {reason}"),
            )
            .tag(["e", conversation.root_event_id.as_str(), "", "root"])
            .tag(["t", to.as_str()]);
            let reply = agent.publisher.publish_draft(draft, Some(trace)).await?;

            let _ = ctx.conversations.append_event(conversation_id, reply.clone());
            ctx.conversations
                .update_phase(conversation_id, from, to, &reason, slug, &reply.id)?;
            finish_agent_state(ctx, conversation_id, slug, triggering_event);
            ctx.conversations.persist(conversation_id);
            ctx.recent_replies.record(&triggering_event.id, slug);
            tracing::info!(from = %from, to = %to, agent = %slug, "phase switched");
            Ok(())
        }
    }
}

/// `complete()` semantics: answer the delegation task that triggered
/// this invocation, or post a reply in the conversation.
async fn complete_turn(
    ctx: &Arc<ProjectContext>,
    agent: &AgentHandle,
    conversation_id: &str,
    triggering_event: &Event,
    content: &str,
    trace: &str,
) -> Result<()> {
    let slug = &agent.definition.slug;
    let Some(conversation) = ctx.conversations.get(conversation_id) else {
        return Err(Error::ConversationNotFound(conversation_id.to_string()));
    };

    let is_delegated_task = triggering_event.kind == kind::DELEGATION_TASK
        && triggering_event
            .p_tags()
            .contains(&agent.definition.pubkey.as_str());

    let published = if is_delegated_task {
        agent
            .publisher
            .publish_delegation_response(
                triggering_event,
                &conversation.root_event_id,
                content,
                Some(trace),
            )
            .await?
    } else {
        agent
            .publisher
            .publish_reply(
                &conversation,
                Some(triggering_event),
                content,
                &mentions_for(ctx, agent, triggering_event),
                Some(trace),
            )
            .await?
    };

    let _ = ctx.conversations.append_event(conversation_id, published);
    finish_agent_state(ctx, conversation_id, slug, triggering_event);
    ctx.conversations.persist(conversation_id);
    ctx.recent_replies.record(&triggering_event.id, slug);
    Ok(())
}

/// Publish a plain terminal reply (final text, errors, stubs).
async fn publish_terminal_reply(
    ctx: &Arc<ProjectContext>,
    agent: &AgentHandle,
    conversation_id: &str,
    triggering_event: &Event,
    content: &str,
    trace: Option<&str>,
) {
    let slug = &agent.definition.slug;
    let Some(conversation) = ctx.conversations.get(conversation_id) else {
        tracing::warn!(conversation_id = %conversation_id, "reply target conversation disappeared");
        return;
    };
    match agent
        .publisher
        .publish_reply(
            &conversation,
            Some(triggering_event),
            content,
            &mentions_for(ctx, agent, triggering_event),
            trace,
        )
        .await
    {
        Ok(published) => {
            let _ = ctx.conversations.append_event(conversation_id, published);
            finish_agent_state(ctx, conversation_id, slug, triggering_event);
            ctx.conversations.persist(conversation_id);
            ctx.recent_replies.record(&triggering_event.id, slug);
        }
        Err(e) => {
            tracing::warn!(error = %e, "reply publish failed");
        }
    }
}

async fn finish_cancelled(
    ctx: &Arc<ProjectContext>,
    agent: &AgentHandle,
    conversation_id: &str,
    triggering_event: &Event,
    partial: &str,
    trace: &str,
) -> Result<()> {
    let content = if partial.trim().is_empty() {
        "[cancelled]".to_string()
    } else {
        format!("[cancelled] partial response:\n{partial}")
    };
    publish_terminal_reply(
        ctx,
        agent,
        conversation_id,
        triggering_event,
        &content,
        Some(trace),
    )
    .await;
    tracing::info!(agent = %agent.definition.slug, "turn cancelled");
    Ok(())
}

/// Mark the trigger as seen and clear the per-task tool session.
fn finish_agent_state(
    ctx: &ProjectContext,
    conversation_id: &str,
    slug: &str,
    triggering_event: &Event,
) {
    let mut state = ctx.conversations.agent_state(conversation_id, slug);
    state.last_seen_event_id = Some(triggering_event.id.clone());
    state.tool_session_id = None;
    let _ = ctx.conversations.set_agent_state(conversation_id, slug, state);
}

/// Whether the agent already answered this trigger in a previous
/// session: replies carry the trigger in their e-tags (the root for
/// top-level replies, the parent otherwise, the task for delegation
/// responses).
fn already_replied(conversation: &Conversation, agent_pubkey: &str, trigger_id: &str) -> bool {
    conversation.history.iter().any(|e| {
        e.pubkey == agent_pubkey && e.e_tags().iter().any(|r| r.id == trigger_id)
    })
}

/// Replies notify the human that triggered them. Project agents are
/// never p-tagged back: a mention routes the reply into the mentioned
/// agent's executor, and two agents mentioning each other would ping-
/// pong forever.
fn mentions_for(
    ctx: &ProjectContext,
    agent: &AgentHandle,
    triggering_event: &Event,
) -> Vec<String> {
    let author = &triggering_event.pubkey;
    if author == &agent.definition.pubkey || ctx.agent_by_pubkey(author).is_some() {
        Vec::new()
    } else {
        vec![author.clone()]
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// System prompt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compose the compiled system prompt: identity, instructions, phase
/// context, tool catalogue, project metadata.
fn compose_system_prompt(
    ctx: &ProjectContext,
    agent: &AgentHandle,
    conversation: &Conversation,
) -> String {
    let definition = &agent.definition;
    let project = ctx.project();
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "You are {name} ({slug}), {role} on the project \"{title}\".\n",
        name = if definition.name.is_empty() {
            &definition.slug
        } else {
            &definition.name
        },
        slug = definition.slug,
        role = if definition.role.is_empty() {
            "an agent"
        } else {
            &definition.role
        },
        title = if project.title.is_empty() {
            &project.d_tag
        } else {
            &project.title
        },
    ));
    if definition.is_pm {
        prompt.push_str(
            "You are the project manager: the default recipient of new \
             threads. Delegate sub-tasks to other agents when their \
             skills fit better than yours.\n",
        );
    }
    if !definition.instructions.is_empty() {
        prompt.push_str("\n");
        prompt.push_str(&definition.instructions);
        prompt.push_str("\n");
    }
    prompt.push_str(&format!(
        "\nThe conversation is in the {} phase.\n",
        conversation.phase
    ));
    if let Some(title) = conversation.metadata.get("title") {
        prompt.push_str(&format!("Conversation topic: {title}\n"));
    }

    let tool_names = ctx.tools.names_for_agent(&definition.tools);
    if !tool_names.is_empty() {
        prompt.push_str(&format!("\nAvailable tools: {}.\n", tool_names.join(", ")));
        prompt.push_str(
            "Finish your turn with the `complete` tool when you are done \
             with a delegated task.\n",
        );
    }

    let teammates: Vec<String> = ctx
        .roster_definitions()
        .iter()
        .filter(|a| a.pubkey != definition.pubkey)
        .map(|a| format!("{} ({})", a.slug, if a.role.is_empty() { "agent" } else { &a.role }))
        .collect();
    if !teammates.is_empty() {
        prompt.push_str(&format!("\nTeammates: {}.\n", teammates.join(", ")));
    }
    prompt
}
