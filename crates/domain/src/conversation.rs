//! Conversations: ordered, deduplicated event histories with phase state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::Event;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Phase
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The workflow phase a conversation occupies. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Chat,
    Brainstorm,
    Plan,
    Execute,
    Verification,
    Chores,
    Reflection,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Chat,
        Phase::Brainstorm,
        Phase::Plan,
        Phase::Execute,
        Phase::Verification,
        Phase::Chores,
        Phase::Reflection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Chat => "chat",
            Phase::Brainstorm => "brainstorm",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Verification => "verification",
            Phase::Chores => "chores",
            Phase::Reflection => "reflection",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s.to_ascii_lowercase())
            .ok_or_else(|| Error::Validation(format!("unknown phase: {s}")))
    }
}

/// A recorded phase change, always caused by an event in history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub reason: String,
    /// Slug of the agent (or `"user"`) that requested the change.
    pub by: String,
    pub by_event_id: String,
    pub at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-agent state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-(agent, conversation) scratchpad.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConversationState {
    /// Batch id of an outstanding `delegate()` call, when the agent is
    /// dormant waiting for responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_delegation: Option<String>,
    /// Identifier of a stateful external tool session, scoped to one
    /// delegation task and cleared on `complete()`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_session_id: Option<String>,
    /// Last history event the agent has been shown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_event_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The unit of coherent multi-turn state: an append-only, id-deduplicated
/// event history sorted by `(created_at, id)`, plus phase and per-agent
/// scratch state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub root_event_id: String,
    pub phase: Phase,
    pub history: Vec<Event>,
    #[serde(default)]
    pub agent_states: BTreeMap<String, AgentConversationState>,
    /// Free-form metadata: title, referenced article, voice-mode flag…
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub phase_transitions: Vec<PhaseTransition>,
}

impl Conversation {
    /// Initialize a conversation from its root event.
    pub fn from_root(root: Event) -> Self {
        let phase = if root.has_topic("brainstorm") {
            Phase::Brainstorm
        } else {
            Phase::Chat
        };
        let mut metadata = BTreeMap::new();
        if let Some(title) = root.title() {
            metadata.insert("title".to_string(), title.to_string());
        }
        Self {
            id: root.id.clone(),
            root_event_id: root.id.clone(),
            phase,
            history: vec![root],
            agent_states: BTreeMap::new(),
            metadata,
            phase_transitions: Vec::new(),
        }
    }

    /// Insert an event preserving the `(created_at, id)` ordering.
    /// Returns `false` (no-op) when the id is already present.
    pub fn insert_event(&mut self, event: Event) -> bool {
        if self.history.iter().any(|e| e.id == event.id) {
            return false;
        }
        let key = event.ordering_key();
        let pos = self
            .history
            .partition_point(|e| e.ordering_key() <= key);
        self.history.insert(pos, event);
        true
    }

    pub fn contains_event(&self, event_id: &str) -> bool {
        self.history.iter().any(|e| e.id == event_id)
    }

    /// Record a phase transition. Rejects transitions whose `from` does
    /// not match the current phase, leaving state unchanged.
    pub fn transition_phase(
        &mut self,
        from: Phase,
        to: Phase,
        reason: impl Into<String>,
        by: impl Into<String>,
        by_event_id: impl Into<String>,
    ) -> Result<()> {
        if from != self.phase {
            return Err(Error::StateInvariant {
                conversation_id: self.id.clone(),
                message: format!(
                    "phase transition from {from} rejected; current phase is {}",
                    self.phase
                ),
            });
        }
        self.phase = to;
        self.phase_transitions.push(PhaseTransition {
            from,
            to,
            reason: reason.into(),
            by: by.into(),
            by_event_id: by_event_id.into(),
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn agent_state(&self, slug: &str) -> AgentConversationState {
        self.agent_states.get(slug).cloned().unwrap_or_default()
    }

    pub fn set_agent_state(&mut self, slug: impl Into<String>, state: AgentConversationState) {
        self.agent_states.insert(slug.into(), state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, created_at: i64) -> Event {
        Event {
            id: id.into(),
            pubkey: "pk".into(),
            created_at,
            kind: crate::kind::GENERIC_REPLY,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    fn root() -> Event {
        Event {
            kind: crate::kind::THREAD_ROOT,
            ..event("root", 10)
        }
    }

    #[test]
    fn history_stays_sorted_under_out_of_order_insertion() {
        let mut conv = Conversation::from_root(root());
        conv.insert_event(event("c", 30));
        conv.insert_event(event("a", 20));
        conv.insert_event(event("b", 20));
        let ids: Vec<_> = conv.history.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["root", "a", "b", "c"]);
        for pair in conv.history.windows(2) {
            assert!(pair[0].ordering_key() <= pair[1].ordering_key());
        }
    }

    #[test]
    fn insert_is_idempotent_on_id() {
        let mut conv = Conversation::from_root(root());
        assert!(conv.insert_event(event("x", 20)));
        assert!(!conv.insert_event(event("x", 999)));
        assert_eq!(conv.history.len(), 2);
    }

    #[test]
    fn brainstorm_topic_selects_initial_phase() {
        let mut r = root();
        r.tags.push(vec!["t".into(), "brainstorm".into()]);
        let conv = Conversation::from_root(r);
        assert_eq!(conv.phase, Phase::Brainstorm);
    }

    #[test]
    fn phase_transition_rejects_stale_from() {
        let mut conv = Conversation::from_root(root());
        conv.transition_phase(Phase::Chat, Phase::Plan, "planning", "pm", "ev1")
            .unwrap();
        let err = conv
            .transition_phase(Phase::Chat, Phase::Execute, "stale", "pm", "ev2")
            .unwrap_err();
        assert!(matches!(err, Error::StateInvariant { .. }));
        assert_eq!(conv.phase, Phase::Plan);
        assert_eq!(conv.phase_transitions.len(), 1);
    }

    #[test]
    fn transitions_record_causing_event() {
        let mut conv = Conversation::from_root(root());
        conv.transition_phase(Phase::Chat, Phase::Execute, "go", "pm", "ev9")
            .unwrap();
        assert_eq!(conv.phase_transitions[0].by_event_id, "ev9");
    }

    #[test]
    fn phase_round_trips_through_str() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert!("launch".parse::<Phase>().is_err());
    }
}
