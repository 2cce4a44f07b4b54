//! Delegation batches: the record of one `delegate()` fan-out.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a delegation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    Open,
    Complete,
    Cancelled,
}

/// One response received from a delegation recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelegationResponse {
    pub event_id: String,
    pub content: String,
    pub received_at: DateTime<Utc>,
}

/// Tracks one `delegate()` invocation: the task event published to each
/// recipient and the responses collected so far. Terminal once
/// [`BatchState::Complete`] or [`BatchState::Cancelled`]; retained for
/// audit afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationBatch {
    pub batch_id: String,
    /// Pubkey of the delegating agent.
    pub delegator: String,
    pub conversation_id: String,
    /// recipient pubkey → the task event addressed to them.
    pub task_ids: BTreeMap<String, String>,
    /// recipient pubkey → their first response.
    pub responses: BTreeMap<String, DelegationResponse>,
    pub state: BatchState,
    pub created_at: DateTime<Utc>,
}

impl DelegationBatch {
    pub fn new(
        delegator: impl Into<String>,
        conversation_id: impl Into<String>,
        task_ids: BTreeMap<String, String>,
    ) -> Self {
        Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            delegator: delegator.into(),
            conversation_id: conversation_id.into(),
            task_ids,
            responses: BTreeMap::new(),
            state: BatchState::Open,
            created_at: Utc::now(),
        }
    }

    /// Whether every recipient has responded.
    pub fn all_responded(&self) -> bool {
        self.task_ids
            .keys()
            .all(|recipient| self.responses.contains_key(recipient))
    }

    pub fn is_open(&self) -> bool {
        self.state == BatchState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_requires_every_recipient() {
        let mut batch = DelegationBatch::new(
            "pm",
            "conv",
            BTreeMap::from([
                ("r1".to_string(), "t1".to_string()),
                ("r2".to_string(), "t2".to_string()),
            ]),
        );
        assert!(!batch.all_responded());
        batch.responses.insert(
            "r1".into(),
            DelegationResponse {
                event_id: "e1".into(),
                content: "done".into(),
                received_at: Utc::now(),
            },
        );
        assert!(!batch.all_responded());
        batch.responses.insert(
            "r2".into(),
            DelegationResponse {
                event_id: "e2".into(),
                content: "done".into(),
                received_at: Utc::now(),
            },
        );
        assert!(batch.all_responded());
    }
}
