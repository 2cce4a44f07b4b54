/// Shared error type used across all TENEX crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("invalid event: {0}")]
    Validation(String),

    #[error("state invariant violated in conversation {conversation_id}: {message}")]
    StateInvariant {
        conversation_id: String,
        message: String,
    },

    #[error("conversation not found for event {0}")]
    ConversationNotFound(String),

    #[error("LLM call timed out after {0:?}")]
    LlmTimeout(std::time::Duration),

    #[error("LLM call cancelled")]
    LlmCancelled,

    #[error("LLM stream: {0}")]
    LlmStream(String),

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("an agent cannot delegate to itself")]
    DelegationSelfTarget,

    #[error("persistence: {0}")]
    Persistence(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
