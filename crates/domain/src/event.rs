//! The signed, immutable wire event and its tag conventions.
//!
//! Events arrive from the relay transport already signature-verified and
//! are never mutated. Outbound events start life as an [`EventDraft`] and
//! become an [`Event`] when a signer fills in `id`, `pubkey` and `sig`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A signed relay event.
///
/// `id` is the content hash of `[0, pubkey, created_at, kind, tags,
/// content]`; `tags` is an ordered list of string tuples whose first
/// element is the tag label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// An `e`-tag reference to another event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRef {
    pub id: String,
    pub relay: Option<String>,
    /// `"root"`, `"reply"`, or `"mention"` when present.
    pub marker: Option<String>,
}

impl Event {
    /// All values of tags with the given label (second tuple element).
    pub fn tag_values<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(label))
            .filter_map(|t| t.get(1).map(String::as_str))
    }

    /// First value of the given tag label, if any.
    pub fn first_tag<'a>(&'a self, label: &'a str) -> Option<&'a str> {
        self.tag_values(label).next()
    }

    /// All `e`-tag references, preserving order.
    pub fn e_tags(&self) -> Vec<EventRef> {
        self.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some("e"))
            .filter_map(|t| {
                t.get(1).map(|id| EventRef {
                    id: id.clone(),
                    relay: t.get(2).filter(|r| !r.is_empty()).cloned(),
                    marker: t.get(3).filter(|m| !m.is_empty()).cloned(),
                })
            })
            .collect()
    }

    /// The referenced thread root: the `e`-tag marked `"root"`, falling
    /// back to the first `e`-tag when no marker is present at all.
    pub fn root_ref(&self) -> Option<EventRef> {
        let refs = self.e_tags();
        refs.iter()
            .find(|r| r.marker.as_deref() == Some("root"))
            .cloned()
            .or_else(|| {
                if refs.iter().all(|r| r.marker.is_none()) {
                    refs.first().cloned()
                } else {
                    None
                }
            })
    }

    /// The `e`-tag marked `"reply"` (the direct parent).
    pub fn reply_ref(&self) -> Option<EventRef> {
        self.e_tags()
            .into_iter()
            .find(|r| r.marker.as_deref() == Some("reply"))
    }

    /// All `p`-tagged pubkeys.
    pub fn p_tags(&self) -> Vec<&str> {
        self.tag_values("p").collect()
    }

    /// First addressable (`a`) reference.
    pub fn a_tag(&self) -> Option<&str> {
        self.first_tag("a")
    }

    /// Replaceable-event identifier.
    pub fn d_tag(&self) -> Option<&str> {
        self.first_tag("d")
    }

    /// Kind-of-referenced-event tags.
    pub fn k_tags(&self) -> Vec<&str> {
        self.tag_values("K").collect()
    }

    /// Topical tags.
    pub fn t_tags(&self) -> Vec<&str> {
        self.tag_values("t").collect()
    }

    pub fn title(&self) -> Option<&str> {
        self.first_tag("title")
    }

    /// Whether the event carries the given topical tag.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.t_tags().iter().any(|t| *t == topic)
    }

    /// Total order used for conversation histories: `(created_at, id)`.
    pub fn ordering_key(&self) -> (i64, &str) {
        (self.created_at, self.id.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventDraft
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An unsigned event under construction.
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    pub kind: u16,
    pub created_at: i64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventDraft {
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            kind,
            created_at: chrono::Utc::now().timestamp(),
            tags: Vec::new(),
            content: content.into(),
        }
    }

    /// Append a tag tuple; empty trailing elements are trimmed.
    pub fn tag<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tuple: Vec<String> = parts.into_iter().map(Into::into).collect();
        while tuple.last().is_some_and(String::is_empty) {
            tuple.pop();
        }
        if tuple.len() >= 2 {
            self.tags.push(tuple);
        }
        self
    }

    /// Compute the canonical content hash for this draft as signed by
    /// `pubkey`: sha256 over the compact JSON serialization of
    /// `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute_id(&self, pubkey: &str) -> String {
        let canonical = serde_json::json!([
            0,
            pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content,
        ]);
        // Compact serialization of a json! value cannot fail.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with_tags(tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: "id".into(),
            pubkey: "pk".into(),
            created_at: 100,
            kind: 1111,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn root_ref_prefers_marker() {
        let ev = event_with_tags(vec![
            vec!["e", "aaa", "", "reply"],
            vec!["e", "bbb", "", "root"],
        ]);
        assert_eq!(ev.root_ref().unwrap().id, "bbb");
    }

    #[test]
    fn root_ref_falls_back_to_first_unmarked() {
        let ev = event_with_tags(vec![vec!["e", "ccc"], vec!["e", "ddd"]]);
        assert_eq!(ev.root_ref().unwrap().id, "ccc");
    }

    #[test]
    fn root_ref_absent_when_only_marked_non_root() {
        let ev = event_with_tags(vec![vec!["e", "aaa", "", "mention"]]);
        assert!(ev.root_ref().is_none());
    }

    #[test]
    fn p_tags_and_topics() {
        let ev = event_with_tags(vec![
            vec!["p", "alice"],
            vec!["p", "bob"],
            vec!["t", "brainstorm"],
        ]);
        assert_eq!(ev.p_tags(), vec!["alice", "bob"]);
        assert!(ev.has_topic("brainstorm"));
        assert!(!ev.has_topic("plan"));
    }

    #[test]
    fn draft_tag_trims_empty_trailing() {
        let draft = EventDraft::new(1111, "hi").tag(["e", "root-id", "", ""]);
        assert_eq!(draft.tags, vec![vec!["e".to_string(), "root-id".to_string()]]);
    }

    #[test]
    fn compute_id_is_deterministic_and_pubkey_sensitive() {
        let mut draft = EventDraft::new(11, "hello");
        draft.created_at = 1_700_000_000;
        let a = draft.compute_id("alice");
        let b = draft.compute_id("alice");
        let c = draft.compute_id("bob");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn ordering_key_breaks_ties_by_id() {
        let mut a = event_with_tags(vec![]);
        let mut b = event_with_tags(vec![]);
        a.id = "aaa".into();
        b.id = "bbb".into();
        assert!(a.ordering_key() < b.ordering_key());
    }
}
