//! Operations registry: in-flight LLM calls, their cancellation tokens,
//! and the observability snapshot behind the operations-status events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CancelToken
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A cancellation token checked by the reason-act loop between stream
/// frames and before each tool dispatch.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// OperationsRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Observable description of one in-flight operation.
#[derive(Debug, Clone)]
pub struct OperationInfo {
    pub id: String,
    pub agent_slug: String,
    pub conversation_id: String,
    pub started_at: DateTime<Utc>,
}

struct Entry {
    info: OperationInfo,
    token: CancelToken,
}

/// Per-project registry of in-flight executor invocations.
#[derive(Default)]
pub struct OperationsRegistry {
    ops: Mutex<HashMap<String, Entry>>,
}

impl OperationsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new operation; returns its id and cancel token.
    pub fn register(&self, agent_slug: &str, conversation_id: &str) -> (String, CancelToken) {
        let id = uuid::Uuid::new_v4().to_string();
        let token = CancelToken::new();
        self.ops.lock().insert(
            id.clone(),
            Entry {
                info: OperationInfo {
                    id: id.clone(),
                    agent_slug: agent_slug.to_string(),
                    conversation_id: conversation_id.to_string(),
                    started_at: Utc::now(),
                },
                token: token.clone(),
            },
        );
        (id, token)
    }

    /// Remove a finished operation. Idempotent.
    pub fn release(&self, operation_id: &str) {
        self.ops.lock().remove(operation_id);
    }

    /// Cancel one operation by id. Returns whether it was found.
    pub fn cancel(&self, operation_id: &str) -> bool {
        match self.ops.lock().get(operation_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every operation on a conversation, optionally narrowed to
    /// one agent. Returns the number of tokens fired.
    pub fn cancel_matching(&self, conversation_id: &str, agent_slug: Option<&str>) -> usize {
        let ops = self.ops.lock();
        let mut cancelled = 0;
        for entry in ops.values() {
            if entry.info.conversation_id != conversation_id {
                continue;
            }
            if let Some(slug) = agent_slug {
                if entry.info.agent_slug != slug {
                    continue;
                }
            }
            entry.token.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// Cancel everything (project shutdown).
    pub fn cancel_all(&self) -> usize {
        let ops = self.ops.lock();
        for entry in ops.values() {
            entry.token.cancel();
        }
        ops.len()
    }

    pub fn snapshot(&self) -> Vec<OperationInfo> {
        let mut infos: Vec<_> = self.ops.lock().values().map(|e| e.info.clone()).collect();
        infos.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        infos
    }

    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recent-reply guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Short-term index of `(triggering_event_id, agent_slug)` pairs that
/// already produced a terminal event. Guards against duplicate outbound
/// replies when the transport re-delivers an event whose processed-cache
/// flush did not survive a crash.
pub struct RecentReplyIndex {
    inner: Mutex<RecentInner>,
    cap: usize,
}

struct RecentInner {
    order: std::collections::VecDeque<(String, String)>,
    set: std::collections::HashSet<(String, String)>,
}

impl RecentReplyIndex {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(RecentInner {
                order: Default::default(),
                set: Default::default(),
            }),
            cap,
        }
    }

    pub fn contains(&self, triggering_event_id: &str, agent_slug: &str) -> bool {
        self.inner
            .lock()
            .set
            .contains(&(triggering_event_id.to_string(), agent_slug.to_string()))
    }

    pub fn record(&self, triggering_event_id: &str, agent_slug: &str) {
        let key = (triggering_event_id.to_string(), agent_slug.to_string());
        let mut inner = self.inner.lock();
        if !inner.set.insert(key.clone()) {
            return;
        }
        inner.order.push_back(key);
        while inner.order.len() > self.cap {
            if let Some(old) = inner.order.pop_front() {
                inner.set.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        // Clones share state.
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn register_cancel_release() {
        let registry = OperationsRegistry::new();
        let (id, token) = registry.register("pm", "conv-1");
        assert!(!token.is_cancelled());
        assert!(registry.cancel(&id));
        assert!(token.is_cancelled());
        registry.release(&id);
        assert!(!registry.cancel(&id));
        registry.release(&id);
    }

    #[test]
    fn cancel_matching_narrows_by_agent() {
        let registry = OperationsRegistry::new();
        let (_, t1) = registry.register("pm", "conv-1");
        let (_, t2) = registry.register("dev", "conv-1");
        let (_, t3) = registry.register("pm", "conv-2");

        assert_eq!(registry.cancel_matching("conv-1", Some("pm")), 1);
        assert!(t1.is_cancelled());
        assert!(!t2.is_cancelled());
        assert!(!t3.is_cancelled());

        assert_eq!(registry.cancel_matching("conv-1", None), 2);
        assert!(t2.is_cancelled());
    }

    #[test]
    fn snapshot_reports_in_flight_ops() {
        let registry = OperationsRegistry::new();
        let (id, _) = registry.register("pm", "conv-1");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);
        assert_eq!(snapshot[0].agent_slug, "pm");
    }

    #[test]
    fn recent_reply_index_is_bounded() {
        let index = RecentReplyIndex::new(2);
        index.record("e1", "pm");
        index.record("e2", "pm");
        index.record("e3", "pm");
        assert!(!index.contains("e1", "pm"));
        assert!(index.contains("e2", "pm"));
        assert!(index.contains("e3", "pm"));
        assert!(!index.contains("e3", "dev"));
    }
}
