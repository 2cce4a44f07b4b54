//! Message builder: converts a conversation's event history into the
//! ordered, role-attributed message list one agent's LLM call sees.
//!
//! Rules:
//! - events signed by the target agent render as `assistant`;
//! - other agents render as attributed `user` messages (`[slug]: …`);
//! - humans render as plain `user` messages;
//! - delegation tasks addressed to the target render as
//!   `task from <delegator>: …`;
//! - delegation responses owed to the target are absorbed into one
//!   synthesized block at the position of the final response;
//! - a recorded `last_seen_event_id` folds the events the agent never
//!   saw into a single "while you were away" block;
//! - history order is preserved throughout.

use std::collections::HashSet;

use tenex_domain::agent::AgentDefinition;
use tenex_domain::config::CompressionConfig;
use tenex_domain::conversation::Conversation;
use tenex_domain::event::Event;
use tenex_domain::kind;
use tenex_domain::tool::Message;

/// Kinds whose content is surfaced to the model.
fn is_prompt_bearing(event_kind: u16) -> bool {
    matches!(
        event_kind,
        kind::THREAD_ROOT
            | kind::GENERIC_REPLY
            | kind::SPEC_REPLY
            | kind::DELEGATION_TASK
            | kind::DELEGATION_RESPONSE
    )
}

pub struct MessageBuilder<'a> {
    conversation: &'a Conversation,
    agent: &'a AgentDefinition,
    project_agents: &'a [AgentDefinition],
    compression: &'a CompressionConfig,
}

impl<'a> MessageBuilder<'a> {
    pub fn new(
        conversation: &'a Conversation,
        agent: &'a AgentDefinition,
        project_agents: &'a [AgentDefinition],
        compression: &'a CompressionConfig,
    ) -> Self {
        Self {
            conversation,
            agent,
            project_agents,
            compression,
        }
    }

    /// Build the full message list. `system_prompt` arrives pre-composed.
    pub fn build(&self, system_prompt: &str, triggering_event_id: &str) -> Vec<Message> {
        let history = &self.conversation.history;

        // Delegation responses owed to the target: responses whose
        // e-tagged task event was authored by the target.
        let responses_to_agent: Vec<&Event> = history
            .iter()
            .filter(|e| e.kind == kind::DELEGATION_RESPONSE)
            .filter(|e| {
                e.e_tags().iter().any(|r| {
                    history
                        .iter()
                        .any(|t| t.id == r.id && t.kind == kind::DELEGATION_TASK && t.pubkey == self.agent.pubkey)
                })
            })
            .collect();
        let absorbed_ids: HashSet<&str> =
            responses_to_agent.iter().map(|e| e.id.as_str()).collect();
        let last_response_id = responses_to_agent.last().map(|e| e.id.as_str());

        // "While you were away": everything strictly between the last
        // event the agent saw and the triggering event was never
        // surfaced to it; fold that range into one block.
        let away_range = self.away_range(triggering_event_id);

        let mut messages = vec![Message::system(system_prompt)];
        let mut away_lines: Vec<String> = Vec::new();
        let mut last_delegated_content: Option<String> = None;

        for (idx, event) in history.iter().enumerate() {
            // Flush the away block once the range ends.
            if let Some((_, end)) = away_range {
                if idx == end && !away_lines.is_empty() {
                    messages.push(away_block(&away_lines));
                    away_lines.clear();
                }
            }

            if event.id == last_response_id.unwrap_or_default() {
                messages.push(self.synthesized_responses(&responses_to_agent));
                continue;
            }
            if absorbed_ids.contains(event.id.as_str()) {
                continue;
            }

            let Some(message) = self.render_event(event, &mut last_delegated_content) else {
                continue;
            };

            if let Some((start, end)) = away_range {
                if idx >= start && idx < end {
                    away_lines.push(compact_line(&message));
                    continue;
                }
            }
            messages.push(message);
        }
        // Away range that runs to the end of history (triggering event
        // missing would be a bug upstream; fold defensively).
        if !away_lines.is_empty() {
            messages.push(away_block(&away_lines));
        }

        self.compress(messages)
    }

    /// `Some((start, end))`: history indices of the never-surfaced
    /// window, end exclusive (the triggering event's index).
    fn away_range(&self, triggering_event_id: &str) -> Option<(usize, usize)> {
        let last_seen = self
            .conversation
            .agent_state(&self.agent.slug)
            .last_seen_event_id?;
        let history = &self.conversation.history;
        let seen_idx = history.iter().position(|e| e.id == last_seen)?;
        let trigger_idx = history
            .iter()
            .position(|e| e.id == triggering_event_id)
            .unwrap_or(history.len());
        // At least two intermediate events, otherwise the plain
        // rendering is shorter than the block.
        if trigger_idx > seen_idx + 2 {
            Some((seen_idx + 1, trigger_idx))
        } else {
            None
        }
    }

    fn render_event(
        &self,
        event: &Event,
        last_delegated_content: &mut Option<String>,
    ) -> Option<Message> {
        if kind::is_ignored(event.kind) || !is_prompt_bearing(event.kind) {
            return None;
        }
        let content = event.content.trim();
        if content.is_empty() {
            return None;
        }

        if event.pubkey == self.agent.pubkey {
            if event.kind == kind::DELEGATION_TASK {
                // One delegate() call publishes one task per recipient;
                // collapse the run of identical contents to one line.
                if last_delegated_content.as_deref() == Some(content) {
                    return None;
                }
                *last_delegated_content = Some(content.to_string());
                return Some(Message::assistant(format!("[delegated] {content}")));
            }
            return Some(Message::assistant(content));
        }

        if event.kind == kind::DELEGATION_TASK {
            if !event.p_tags().contains(&self.agent.pubkey.as_str()) {
                // Another agent's assignment.
                return None;
            }
            let delegator = self.display_name(&event.pubkey);
            return Some(Message::user(format!("task from {delegator}: {content}")));
        }
        if event.kind == kind::DELEGATION_RESPONSE {
            // Plumbing between other agents.
            return None;
        }

        if let Some(slug) = self.agent_slug(&event.pubkey) {
            return Some(Message::user(format!("[{slug}]: {content}")));
        }
        Some(Message::user(content))
    }

    fn synthesized_responses(&self, responses: &[&Event]) -> Message {
        let mut block = String::from("All delegated tasks have completed. Responses:\n");
        for response in responses {
            let responder = self.display_name(&response.pubkey);
            block.push_str(&format!("\n--- {responder} ---\n{}\n", response.content.trim()));
        }
        Message::user(block)
    }

    fn agent_slug(&self, pubkey: &str) -> Option<&str> {
        self.project_agents
            .iter()
            .find(|a| a.pubkey == pubkey)
            .map(|a| a.slug.as_str())
    }

    fn display_name(&self, pubkey: &str) -> String {
        self.agent_slug(pubkey)
            .map(String::from)
            .unwrap_or_else(|| shorten(pubkey))
    }

    // ── History compression ──────────────────────────────────────────

    /// Fold older messages into a digest when the estimated size passes
    /// the configured threshold. The system message and the most recent
    /// window stay verbatim; the history itself is never rewritten.
    fn compress(&self, messages: Vec<Message>) -> Vec<Message> {
        if !self.compression.enabled {
            return messages;
        }
        let estimate =
            |msgs: &[Message]| -> usize { msgs.iter().map(|m| m.content.estimated_tokens()).sum() };
        if estimate(&messages) <= self.compression.token_threshold {
            return messages;
        }

        let mut window = self.compression.sliding_window_size.max(1);
        loop {
            let body_len = messages.len().saturating_sub(1);
            if body_len <= window {
                return messages;
            }
            let fold_end = 1 + (body_len - window);
            let mut digest = String::from("Earlier in this conversation:\n");
            for message in &messages[1..fold_end] {
                digest.push_str(&format!("- {}\n", compact_line(message)));
            }
            let mut compressed = Vec::with_capacity(window + 2);
            compressed.push(messages[0].clone());
            compressed.push(Message::user(digest));
            compressed.extend_from_slice(&messages[fold_end..]);

            if estimate(&compressed) <= self.compression.token_budget || window == 1 {
                return compressed;
            }
            window /= 2;
        }
    }
}

fn away_block(lines: &[String]) -> Message {
    let mut block = String::from("Messages while you were away:\n");
    for line in lines {
        block.push_str(&format!("- {line}\n"));
    }
    Message::user(block)
}

fn compact_line(message: &Message) -> String {
    let text = message.content.extract_all_text().replace('\n', " ");
    let mut boundary = 200.min(text.len());
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    text[..boundary].to_string()
}

fn shorten(pubkey: &str) -> String {
    if pubkey.len() > 12 {
        format!("{}…", &pubkey[..12])
    } else {
        pubkey.to_string()
    }
}
