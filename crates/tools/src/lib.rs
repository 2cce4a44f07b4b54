//! Agent tools.
//!
//! A tool is a pure async function over `(arguments, context)` returning
//! a structured outcome. Tools never publish relay events themselves:
//! terminal tools (`complete`, `delegate`, `switch_phase`) return an
//! intent the executor hands to the publisher, everything else returns a
//! JSON value fed back to the model as a tool-role message.

pub mod core;
pub mod fs;
pub mod registry;
pub mod shell;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

use tenex_domain::conversation::Phase;
use tenex_domain::Result;

pub use registry::ToolRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context & outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a tool may read about its invocation site.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub agent_slug: String,
    pub agent_pubkey: String,
    pub conversation_id: String,
    pub conversation_phase: Phase,
    /// slug → pubkey for every agent in the project, for recipient
    /// resolution.
    pub project_agents: BTreeMap<String, String>,
    /// Root directory file tools are confined to.
    pub workspace_root: PathBuf,
}

/// What a tool produced.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// Structured result returned to the model.
    Result(Value),
    /// Terminal intent; ends the agent's turn.
    Terminal(TerminalIntent),
}

/// Side effects that conclude a turn. The executor executes the intent
/// exactly once and never follows it with another model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalIntent {
    /// Final answer for the current task or conversation.
    Complete { content: String },
    /// Fan a sub-task out to other agents and go dormant.
    Delegate {
        /// Recipient pubkeys, resolved and validated.
        recipients: Vec<String>,
        content: String,
    },
    /// Move the conversation to another phase.
    SwitchPhase { to: Phase, reason: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the tool's arguments.
    fn parameters(&self) -> Value;
    /// Terminal tools conclude the turn (see [`TerminalIntent`]).
    fn is_terminal(&self) -> bool {
        false
    }
    /// Commutative tools may execute concurrently with one another
    /// within a single model turn.
    fn is_commutative(&self) -> bool {
        false
    }
    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome>;
}

#[cfg(test)]
pub(crate) fn test_context(workspace_root: PathBuf) -> ToolContext {
    ToolContext {
        agent_slug: "pm".into(),
        agent_pubkey: "pm-pubkey".into(),
        conversation_id: "conv".into(),
        conversation_phase: Phase::Chat,
        project_agents: BTreeMap::from([
            ("pm".to_string(), "pm-pubkey".to_string()),
            ("dev".to_string(), "dev-pubkey".to_string()),
        ]),
        workspace_root,
    }
}
