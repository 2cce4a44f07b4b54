//! Agent publisher: the single place outbound events are constructed,
//! signed, and handed to the relay.
//!
//! One publisher per agent; it owns that agent's signer and never sees
//! another agent's key.

use std::sync::Arc;

use tenex_domain::conversation::{Conversation, Phase};
use tenex_domain::event::{Event, EventDraft};
use tenex_domain::{kind, Result};
use tenex_relay::{EventSigner, RelayClient};

/// A W3C traceparent carried on outbound events when a request is
/// being traced.
pub fn new_traceparent() -> String {
    let trace_id = uuid::Uuid::new_v4().simple().to_string();
    let span_id = &uuid::Uuid::new_v4().simple().to_string()[..16];
    format!("00-{trace_id}-{span_id}-01")
}

pub struct AgentPublisher {
    relay: Arc<dyn RelayClient>,
    signer: Arc<dyn EventSigner>,
}

impl AgentPublisher {
    pub fn new(relay: Arc<dyn RelayClient>, signer: Arc<dyn EventSigner>) -> Self {
        Self { relay, signer }
    }

    pub fn pubkey(&self) -> &str {
        self.signer.pubkey()
    }

    /// Sign and publish a draft, returning the signed event.
    pub async fn publish_draft(&self, mut draft: EventDraft, trace: Option<&str>) -> Result<Event> {
        if let Some(traceparent) = trace {
            draft = draft.tag(["trace_context", traceparent]);
        }
        let event = self.signer.sign(draft);
        self.relay.publish(event.clone()).await?;
        Ok(event)
    }

    /// A reply in a conversation: e-tags the root (and the parent when
    /// replying mid-thread), p-tags any mentions.
    pub async fn publish_reply(
        &self,
        conversation: &Conversation,
        parent: Option<&Event>,
        content: &str,
        mentions: &[String],
        trace: Option<&str>,
    ) -> Result<Event> {
        let mut draft = EventDraft::new(kind::GENERIC_REPLY, content)
            .tag(["e", conversation.root_event_id.as_str(), "", "root"]);
        if let Some(parent) = parent {
            if parent.id != conversation.root_event_id {
                draft = draft.tag(["e", parent.id.as_str(), "", "reply"]);
            }
        }
        for mention in mentions {
            draft = draft.tag(["p", mention.as_str()]);
        }
        self.publish_draft(draft, trace).await
    }

    /// Sign one delegation task per recipient, each p-tagged to exactly
    /// one agent and e-tagged to the conversation root. Publication is
    /// separate ([`Self::publish_signed`]) so the caller can register
    /// the batch before the first task can possibly echo back.
    pub fn sign_delegation_tasks(
        &self,
        conversation: &Conversation,
        recipients: &[String],
        content: &str,
        phase: Option<Phase>,
        trace: Option<&str>,
    ) -> Vec<Event> {
        recipients
            .iter()
            .map(|recipient| {
                let mut draft = EventDraft::new(kind::DELEGATION_TASK, content)
                    .tag(["e", conversation.root_event_id.as_str(), "", "root"])
                    .tag(["p", recipient.as_str()]);
                if let Some(phase) = phase {
                    draft = draft.tag(["t", phase.as_str()]);
                }
                if let Some(traceparent) = trace {
                    draft = draft.tag(["trace_context", traceparent]);
                }
                self.signer.sign(draft)
            })
            .collect()
    }

    /// Publish an already-signed event.
    pub async fn publish_signed(&self, event: Event) -> Result<()> {
        self.relay.publish(event).await
    }

    /// The answer to a delegation task: e-tags the task, p-tags the
    /// delegator (the task's signer).
    pub async fn publish_delegation_response(
        &self,
        task: &Event,
        conversation_root: &str,
        content: &str,
        trace: Option<&str>,
    ) -> Result<Event> {
        let draft = EventDraft::new(kind::DELEGATION_RESPONSE, content)
            .tag(["e", task.id.as_str()])
            .tag(["e", conversation_root, "", "root"])
            .tag(["p", task.pubkey.as_str()]);
        self.publish_draft(draft, trace).await
    }

    /// A streamed partial-response frame for UI consumers. Ephemeral:
    /// never lands in conversation history.
    pub async fn publish_streaming_frame(
        &self,
        conversation_root: &str,
        sequence: u32,
        text: &str,
        trace: Option<&str>,
    ) -> Result<Event> {
        let draft = EventDraft::new(kind::STREAMING_EPHEMERAL, text)
            .tag(["e", conversation_root, "", "root"])
            .tag(["seq", sequence.to_string().as_str()]);
        self.publish_draft(draft, trace).await
    }
}
