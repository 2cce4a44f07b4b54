//! Conversation store: one project's conversations, indexed by id and by
//! contained event id, persisted one JSON file per conversation.
//!
//! The in-memory state is authoritative for the session; disk writes are
//! atomic (temp-and-rename) and failures are logged, never fatal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use tenex_domain::conversation::{AgentConversationState, Conversation, Phase};
use tenex_domain::event::Event;
use tenex_domain::{Error, Result};

pub struct ConversationStore {
    dir: PathBuf,
    conversations: RwLock<HashMap<String, Conversation>>,
    /// event id → conversation id, covering every event in every history.
    event_index: RwLock<HashMap<String, String>>,
}

impl ConversationStore {
    /// Open the store at `<project_dir>/conversations/`.
    pub fn new(project_dir: &Path) -> Result<Self> {
        let dir = project_dir.join("conversations");
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;
        Ok(Self {
            dir,
            conversations: RwLock::new(HashMap::new()),
            event_index: RwLock::new(HashMap::new()),
        })
    }

    /// Load every persisted conversation. Unreadable files are skipped
    /// with a warning.
    pub fn load_all(&self) -> Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.dir).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable conversation file");
                    continue;
                }
            };
            match serde_json::from_str::<Conversation>(&raw) {
                Ok(conv) => {
                    self.index_conversation(&conv);
                    self.conversations.write().insert(conv.id.clone(), conv);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed conversation file");
                }
            }
        }
        tracing::info!(count = loaded, dir = %self.dir.display(), "conversation store loaded");
        Ok(loaded)
    }

    fn index_conversation(&self, conv: &Conversation) {
        let mut index = self.event_index.write();
        for event in &conv.history {
            index.insert(event.id.clone(), conv.id.clone());
        }
    }

    // ── Lookups ──────────────────────────────────────────────────────

    pub fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations.read().get(conversation_id).cloned()
    }

    /// The conversation whose root or any historical event has this id.
    pub fn get_by_any_event_id(&self, event_id: &str) -> Option<Conversation> {
        let conv_id = self.event_index.read().get(event_id).cloned()?;
        self.get(&conv_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.conversations.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.conversations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.read().is_empty()
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Create a conversation from its root event, or return the existing
    /// one when the root was already seen.
    pub fn create(&self, root: Event) -> Conversation {
        if let Some(existing) = self.get_by_any_event_id(&root.id) {
            return existing;
        }
        let conv = Conversation::from_root(root);
        self.index_conversation(&conv);
        self.conversations
            .write()
            .insert(conv.id.clone(), conv.clone());
        conv
    }

    /// Create a conversation whose id differs from its root event's id
    /// (used for threads keyed by an addressable reference).
    pub fn create_with_id(&self, conversation_id: &str, root: Event) -> Conversation {
        if let Some(existing) = self.get(conversation_id) {
            return existing;
        }
        let mut conv = Conversation::from_root(root);
        conv.id = conversation_id.to_string();
        self.index_conversation(&conv);
        self.conversations
            .write()
            .insert(conv.id.clone(), conv.clone());
        conv
    }

    /// Create a conversation from a recovered thread: the oldest event
    /// becomes the root, the rest are appended in order.
    pub fn create_from_thread(&self, mut events: Vec<Event>) -> Option<Conversation> {
        events.sort_by(|a, b| a.ordering_key().cmp(&b.ordering_key()));
        let mut iter = events.into_iter();
        let root = iter.next()?;
        let conv_id = self.create(root).id;
        for event in iter {
            let _ = self.append_event(&conv_id, event);
        }
        self.get(&conv_id)
    }

    /// Insert an event preserving history ordering. Returns `false`
    /// (no-op) when the event id is already present in the conversation.
    pub fn append_event(&self, conversation_id: &str, event: Event) -> Result<bool> {
        let mut conversations = self.conversations.write();
        let conv = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| Error::ConversationNotFound(conversation_id.to_string()))?;
        let event_id = event.id.clone();
        let inserted = conv.insert_event(event);
        drop(conversations);
        if inserted {
            self.event_index
                .write()
                .insert(event_id, conversation_id.to_string());
        }
        Ok(inserted)
    }

    /// Record a phase transition. Rejects the change when `from` is not
    /// the conversation's current phase.
    pub fn update_phase(
        &self,
        conversation_id: &str,
        from: Phase,
        to: Phase,
        reason: &str,
        by: &str,
        by_event_id: &str,
    ) -> Result<()> {
        let mut conversations = self.conversations.write();
        let conv = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| Error::ConversationNotFound(conversation_id.to_string()))?;
        conv.transition_phase(from, to, reason, by, by_event_id)
    }

    pub fn set_metadata(&self, conversation_id: &str, key: &str, value: &str) -> Result<()> {
        let mut conversations = self.conversations.write();
        let conv = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| Error::ConversationNotFound(conversation_id.to_string()))?;
        conv.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn agent_state(&self, conversation_id: &str, slug: &str) -> AgentConversationState {
        self.conversations
            .read()
            .get(conversation_id)
            .map(|c| c.agent_state(slug))
            .unwrap_or_default()
    }

    pub fn set_agent_state(
        &self,
        conversation_id: &str,
        slug: &str,
        state: AgentConversationState,
    ) -> Result<()> {
        let mut conversations = self.conversations.write();
        let conv = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| Error::ConversationNotFound(conversation_id.to_string()))?;
        conv.set_agent_state(slug, state);
        Ok(())
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Write one conversation to `conversations/<id>.json` atomically.
    /// Failures are logged and swallowed; memory stays authoritative.
    pub fn persist(&self, conversation_id: &str) {
        let Some(conv) = self.get(conversation_id) else {
            return;
        };
        if let Err(e) = self.write_atomic(&conv) {
            tracing::warn!(
                conversation_id = %conversation_id,
                error = %e,
                "conversation persist failed, keeping in-memory state"
            );
        }
    }

    fn write_atomic(&self, conv: &Conversation) -> Result<()> {
        let file_name = tenex_domain::config::sanitize_path_component(&conv.id);
        let final_path = self.dir.join(format!("{file_name}.json"));
        let tmp_path = self.dir.join(format!("{file_name}.json.tmp"));
        let raw = serde_json::to_vec_pretty(conv)?;
        std::fs::write(&tmp_path, raw).map_err(Error::Io)?;
        std::fs::rename(&tmp_path, &final_path).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenex_domain::kind;

    fn event(id: &str, kind: u16, created_at: i64) -> Event {
        Event {
            id: id.into(),
            pubkey: "user".into(),
            created_at,
            kind,
            tags: vec![],
            content: format!("content of {id}"),
            sig: String::new(),
        }
    }

    fn store() -> (tempfile::TempDir, ConversationStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn create_and_lookup_by_any_event_id() {
        let (_dir, store) = store();
        let conv = store.create(event("root", kind::THREAD_ROOT, 10));
        store
            .append_event(&conv.id, event("reply", kind::GENERIC_REPLY, 20))
            .unwrap();

        assert_eq!(store.get_by_any_event_id("root").unwrap().id, "root");
        assert_eq!(store.get_by_any_event_id("reply").unwrap().id, "root");
        assert!(store.get_by_any_event_id("ghost").is_none());
    }

    #[test]
    fn append_is_noop_on_duplicate_id() {
        let (_dir, store) = store();
        let conv = store.create(event("root", kind::THREAD_ROOT, 10));
        assert!(store
            .append_event(&conv.id, event("r1", kind::GENERIC_REPLY, 20))
            .unwrap());
        assert!(!store
            .append_event(&conv.id, event("r1", kind::GENERIC_REPLY, 99))
            .unwrap());
        assert_eq!(store.get(&conv.id).unwrap().history.len(), 2);
    }

    #[test]
    fn append_to_unknown_conversation_errors() {
        let (_dir, store) = store();
        let err = store
            .append_event("nope", event("r1", kind::GENERIC_REPLY, 20))
            .unwrap_err();
        assert!(matches!(err, Error::ConversationNotFound(_)));
    }

    #[test]
    fn create_is_idempotent_on_root_id() {
        let (_dir, store) = store();
        store.create(event("root", kind::THREAD_ROOT, 10));
        store.create(event("root", kind::THREAD_ROOT, 10));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn create_from_thread_picks_oldest_root() {
        let (_dir, store) = store();
        let conv = store
            .create_from_thread(vec![
                event("late", kind::GENERIC_REPLY, 30),
                event("first", kind::THREAD_ROOT, 10),
                event("mid", kind::GENERIC_REPLY, 20),
            ])
            .unwrap();
        assert_eq!(conv.root_event_id, "first");
        let ids: Vec<_> = conv.history.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "mid", "late"]);
    }

    #[test]
    fn phase_update_rejects_mismatched_from() {
        let (_dir, store) = store();
        let conv = store.create(event("root", kind::THREAD_ROOT, 10));
        store
            .update_phase(&conv.id, Phase::Chat, Phase::Plan, "plan", "pm", "e1")
            .unwrap();
        assert!(store
            .update_phase(&conv.id, Phase::Chat, Phase::Execute, "stale", "pm", "e2")
            .is_err());
        assert_eq!(store.get(&conv.id).unwrap().phase, Phase::Plan);
    }

    #[test]
    fn persist_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let original = {
            let store = ConversationStore::new(dir.path()).unwrap();
            let conv = store.create(event("root", kind::THREAD_ROOT, 10));
            store
                .append_event(&conv.id, event("reply", kind::GENERIC_REPLY, 20))
                .unwrap();
            store
                .update_phase(&conv.id, Phase::Chat, Phase::Execute, "go", "pm", "reply")
                .unwrap();
            store
                .set_agent_state(
                    &conv.id,
                    "pm",
                    AgentConversationState {
                        pending_delegation: Some("batch-1".into()),
                        tool_session_id: None,
                        last_seen_event_id: Some("reply".into()),
                    },
                )
                .unwrap();
            store.persist(&conv.id);
            store.get(&conv.id).unwrap()
        };

        let reloaded_store = ConversationStore::new(dir.path()).unwrap();
        assert_eq!(reloaded_store.load_all().unwrap(), 1);
        let reloaded = reloaded_store.get("root").unwrap();
        assert_eq!(reloaded.history, original.history);
        assert_eq!(reloaded.phase, original.phase);
        assert_eq!(reloaded.agent_states, original.agent_states);
        // The reloaded store answers event-id lookups for old events.
        assert_eq!(reloaded_store.get_by_any_event_id("reply").unwrap().id, "root");
    }

    #[test]
    fn persist_of_unknown_conversation_is_silent() {
        let (_dir, store) = store();
        store.persist("ghost");
    }
}
