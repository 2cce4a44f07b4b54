//! The canonical event-kind table.
//!
//! Numeric kinds are a wire convention shared with every other client on
//! the relay network; this module is the single place they are defined.

/// Profile metadata (ignored by the runtime).
pub const METADATA: u16 = 0;
/// Contact list (ignored).
pub const CONTACTS: u16 = 3;
/// Root event of a new conversation thread.
pub const THREAD_ROOT: u16 = 11;
/// Conversation metadata update (title, topics).
pub const METADATA_REPLY: u16 = 513;
/// A reply within an existing conversation.
pub const GENERIC_REPLY: u16 = 1111;
/// A reply addressed at a published specification document.
pub const SPEC_REPLY: u16 = 1121;
/// A sub-task assigned by one agent to exactly one other agent.
pub const DELEGATION_TASK: u16 = 1934;
/// The assignee's answer to a delegation task.
pub const DELEGATION_RESPONSE: u16 = 1935;
/// A learning recorded by an agent.
pub const AGENT_LESSON: u16 = 4129;
/// Replaceable agent definition update.
pub const AGENT_CONFIG_UPDATE: u16 = 4199;
/// Streamed partial-response frame (ephemeral).
pub const STREAMING_EPHEMERAL: u16 = 21111;
/// Project status heartbeat (ephemeral).
pub const STATUS_EPHEMERAL: u16 = 24010;
/// Typing indicator (ephemeral, ignored).
pub const TYPING_EPHEMERAL: u16 = 24111;
/// Enumeration of in-flight operations (ephemeral).
pub const OPERATIONS_STATUS_EPHEMERAL: u16 = 24133;
/// Request to cancel in-flight work.
pub const STOP_REQUEST: u16 = 24134;
/// Long-form specification document (addressable).
pub const SPEC_DOC: u16 = 30023;
/// Replaceable project definition (addressable).
pub const PROJECT_DEF: u16 = 31933;

/// Kinds the runtime never routes to agents or conversations.
pub fn is_ignored(kind: u16) -> bool {
    matches!(
        kind,
        METADATA
            | CONTACTS
            | TYPING_EPHEMERAL
            | STREAMING_EPHEMERAL
            | STATUS_EPHEMERAL
            | OPERATIONS_STATUS_EPHEMERAL
    )
}

/// Kinds that belong in a conversation's history.
pub fn is_conversation_bearing(kind: u16) -> bool {
    matches!(
        kind,
        THREAD_ROOT
            | GENERIC_REPLY
            | METADATA_REPLY
            | SPEC_REPLY
            | STOP_REQUEST
            | AGENT_CONFIG_UPDATE
            | PROJECT_DEF
            | DELEGATION_TASK
            | DELEGATION_RESPONSE
            | AGENT_LESSON
    )
}

/// Kinds that start a new conversation.
pub fn is_thread_root(kind: u16) -> bool {
    kind == THREAD_ROOT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignored_and_conversation_bearing_are_disjoint() {
        for kind in [
            METADATA,
            CONTACTS,
            THREAD_ROOT,
            METADATA_REPLY,
            GENERIC_REPLY,
            SPEC_REPLY,
            DELEGATION_TASK,
            DELEGATION_RESPONSE,
            AGENT_LESSON,
            AGENT_CONFIG_UPDATE,
            STREAMING_EPHEMERAL,
            STATUS_EPHEMERAL,
            TYPING_EPHEMERAL,
            OPERATIONS_STATUS_EPHEMERAL,
            STOP_REQUEST,
            SPEC_DOC,
            PROJECT_DEF,
        ] {
            assert!(
                !(is_ignored(kind) && is_conversation_bearing(kind)),
                "kind {kind} is both ignored and conversation-bearing"
            );
        }
    }

    #[test]
    fn ephemeral_frames_are_ignored() {
        assert!(is_ignored(STREAMING_EPHEMERAL));
        assert!(is_ignored(STATUS_EPHEMERAL));
        assert!(is_ignored(OPERATIONS_STATUS_EPHEMERAL));
        assert!(!is_ignored(STOP_REQUEST));
    }
}
