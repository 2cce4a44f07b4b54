//! Delegation registry: matches delegation responses to the batches
//! that await them and signals completion exactly once per batch.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use parking_lot::Mutex;

use tenex_domain::delegation::{BatchState, DelegationBatch, DelegationResponse};
use tenex_domain::event::Event;

/// What happened to an inbound delegation-response event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Recorded; other recipients are still pending.
    Recorded,
    /// Recorded, and this response completed the batch. The delegator
    /// must be re-activated exactly once, now.
    Completed {
        batch_id: String,
        delegator: String,
        conversation_id: String,
    },
    /// The responder already answered; the first response stands.
    Duplicate,
    /// The batch is already cancelled or complete; nothing to signal.
    Late,
    /// The signer does not match the task's addressee.
    WrongSigner,
    /// No known task matches the event's references.
    UnknownTask,
}

#[derive(Default)]
struct Inner {
    /// batch id → batch.
    batches: HashMap<String, DelegationBatch>,
    /// task event id → batch id.
    task_index: HashMap<String, String>,
}

/// Per-project delegation state. Small; all operations take one mutex.
#[derive(Default)]
pub struct DelegationRegistry {
    inner: Mutex<Inner>,
}

impl DelegationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch created by a `delegate()` call.
    /// `task_ids` maps recipient pubkey → published task event id.
    pub fn register(
        &self,
        delegator: &str,
        conversation_id: &str,
        task_ids: BTreeMap<String, String>,
    ) -> String {
        let batch = DelegationBatch::new(delegator, conversation_id, task_ids);
        let batch_id = batch.batch_id.clone();
        let mut inner = self.inner.lock();
        for task_id in batch.task_ids.values() {
            inner.task_index.insert(task_id.clone(), batch_id.clone());
        }
        inner.batches.insert(batch_id.clone(), batch);
        batch_id
    }

    pub fn batch(&self, batch_id: &str) -> Option<DelegationBatch> {
        self.inner.lock().batches.get(batch_id).cloned()
    }

    /// Whether an event id is a known delegation task.
    pub fn is_task(&self, event_id: &str) -> bool {
        self.inner.lock().task_index.contains_key(event_id)
    }

    /// Match a delegation-response event against its batch.
    ///
    /// The response must e-tag a known task event and be signed by that
    /// task's addressee. Duplicate responses keep the first; responses
    /// after cancellation are recorded in conversation history by the
    /// caller but never re-signal.
    pub fn record_response(&self, event: &Event) -> ResponseOutcome {
        let mut inner = self.inner.lock();

        let Some((task_id, batch_id)) = event.e_tags().into_iter().find_map(|r| {
            inner
                .task_index
                .get(&r.id)
                .map(|batch_id| (r.id.clone(), batch_id.clone()))
        }) else {
            return ResponseOutcome::UnknownTask;
        };

        let Some(batch) = inner.batches.get_mut(&batch_id) else {
            return ResponseOutcome::UnknownTask;
        };

        // The task was addressed to exactly one recipient; only that
        // recipient's signature counts.
        let Some(recipient) = batch
            .task_ids
            .iter()
            .find(|(_, tid)| **tid == task_id)
            .map(|(recipient, _)| recipient.clone())
        else {
            return ResponseOutcome::UnknownTask;
        };
        if recipient != event.pubkey {
            return ResponseOutcome::WrongSigner;
        }

        match batch.state {
            BatchState::Cancelled | BatchState::Complete => return ResponseOutcome::Late,
            BatchState::Open => {}
        }

        if batch.responses.contains_key(&recipient) {
            return ResponseOutcome::Duplicate;
        }
        batch.responses.insert(
            recipient,
            DelegationResponse {
                event_id: event.id.clone(),
                content: event.content.clone(),
                received_at: Utc::now(),
            },
        );

        if batch.all_responded() {
            batch.state = BatchState::Complete;
            ResponseOutcome::Completed {
                batch_id: batch.batch_id.clone(),
                delegator: batch.delegator.clone(),
                conversation_id: batch.conversation_id.clone(),
            }
        } else {
            ResponseOutcome::Recorded
        }
    }

    /// Cancel every open batch on a conversation. Late responses will
    /// be recorded in history but never re-activate the delegator.
    pub fn cancel_for_conversation(&self, conversation_id: &str) -> usize {
        let mut inner = self.inner.lock();
        let mut cancelled = 0;
        for batch in inner.batches.values_mut() {
            if batch.conversation_id == conversation_id && batch.is_open() {
                batch.state = BatchState::Cancelled;
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Batches are retained for audit after completion; this lists them.
    pub fn batches_for_conversation(&self, conversation_id: &str) -> Vec<DelegationBatch> {
        self.inner
            .lock()
            .batches
            .values()
            .filter(|b| b.conversation_id == conversation_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenex_domain::kind;

    fn response(id: &str, task_id: &str, signer: &str) -> Event {
        Event {
            id: id.into(),
            pubkey: signer.into(),
            created_at: 100,
            kind: kind::DELEGATION_RESPONSE,
            tags: vec![
                vec!["e".into(), task_id.into()],
                vec!["p".into(), "pm-pk".into()],
            ],
            content: format!("answer from {signer}"),
            sig: String::new(),
        }
    }

    fn fan_out(registry: &DelegationRegistry) -> String {
        registry.register(
            "pm-pk",
            "conv-1",
            BTreeMap::from([
                ("r1".to_string(), "task-1".to_string()),
                ("r2".to_string(), "task-2".to_string()),
            ]),
        )
    }

    #[test]
    fn completion_fires_once_when_all_respond() {
        let registry = DelegationRegistry::new();
        let batch_id = fan_out(&registry);

        assert_eq!(
            registry.record_response(&response("a", "task-1", "r1")),
            ResponseOutcome::Recorded
        );
        match registry.record_response(&response("b", "task-2", "r2")) {
            ResponseOutcome::Completed {
                batch_id: completed,
                delegator,
                conversation_id,
            } => {
                assert_eq!(completed, batch_id);
                assert_eq!(delegator, "pm-pk");
                assert_eq!(conversation_id, "conv-1");
            }
            other => panic!("expected completion, got {other:?}"),
        }

        let batch = registry.batch(&batch_id).unwrap();
        assert_eq!(batch.state, BatchState::Complete);
        assert_eq!(batch.responses.len(), batch.task_ids.len());
        assert!(batch.task_ids.keys().eq(batch.responses.keys()));
    }

    #[test]
    fn duplicate_response_keeps_the_first() {
        let registry = DelegationRegistry::new();
        let batch_id = fan_out(&registry);
        registry.record_response(&response("a", "task-1", "r1"));
        assert_eq!(
            registry.record_response(&response("a2", "task-1", "r1")),
            ResponseOutcome::Duplicate
        );
        let batch = registry.batch(&batch_id).unwrap();
        assert_eq!(batch.responses["r1"].event_id, "a");
    }

    #[test]
    fn wrong_signer_is_rejected() {
        let registry = DelegationRegistry::new();
        fan_out(&registry);
        assert_eq!(
            registry.record_response(&response("a", "task-1", "impostor")),
            ResponseOutcome::WrongSigner
        );
    }

    #[test]
    fn late_response_after_cancellation_never_signals() {
        let registry = DelegationRegistry::new();
        fan_out(&registry);
        registry.record_response(&response("a", "task-1", "r1"));
        assert_eq!(registry.cancel_for_conversation("conv-1"), 1);
        assert_eq!(
            registry.record_response(&response("b", "task-2", "r2")),
            ResponseOutcome::Late
        );
    }

    #[test]
    fn response_after_completion_is_late() {
        let registry = DelegationRegistry::new();
        fan_out(&registry);
        registry.record_response(&response("a", "task-1", "r1"));
        registry.record_response(&response("b", "task-2", "r2"));
        // A different event id from an already-complete batch's
        // recipient: recorded in history only.
        assert_eq!(
            registry.record_response(&response("c", "task-2", "r2")),
            ResponseOutcome::Late
        );
    }

    #[test]
    fn unknown_task_is_reported() {
        let registry = DelegationRegistry::new();
        fan_out(&registry);
        assert_eq!(
            registry.record_response(&response("a", "task-99", "r1")),
            ResponseOutcome::UnknownTask
        );
    }

    #[test]
    fn single_recipient_batch_completes_immediately() {
        let registry = DelegationRegistry::new();
        registry.register(
            "pm-pk",
            "conv-1",
            BTreeMap::from([("r1".to_string(), "task-1".to_string())]),
        );
        assert!(matches!(
            registry.record_response(&response("a", "task-1", "r1")),
            ResponseOutcome::Completed { .. }
        ));
    }
}
