//! Shared domain types for the TENEX runtime.
//!
//! Everything that crosses a crate boundary lives here: the wire event
//! model, the kind table, conversations and phases, agent and project
//! definitions, delegation batches, configuration, and the provider-
//! agnostic LLM message/stream types.

pub mod agent;
pub mod config;
pub mod conversation;
pub mod delegation;
pub mod error;
pub mod event;
pub mod kind;
pub mod stream;
pub mod tool;

pub use error::{Error, Result};
pub use event::{Event, EventDraft, EventRef};
