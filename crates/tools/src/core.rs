//! Core agent tools: the terminal trio every agent carries.

use serde::Deserialize;
use serde_json::Value;

use tenex_domain::conversation::Phase;
use tenex_domain::{Error, Result};

use crate::{TerminalIntent, Tool, ToolContext, ToolOutcome};

fn bad_args(tool: &str, e: impl std::fmt::Display) -> Error {
    Error::Tool {
        tool: tool.to_string(),
        message: format!("invalid arguments: {e}"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// complete
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CompleteTool;

#[async_trait::async_trait]
impl Tool for CompleteTool {
    fn name(&self) -> &str {
        "complete"
    }
    fn description(&self) -> &str {
        "Finish the current task with a final answer. When working on a \
         delegated task, the answer is returned to the delegating agent; \
         otherwise it is posted as a reply in the conversation."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The complete final answer."
                }
            },
            "required": ["content"]
        })
    }
    fn is_terminal(&self) -> bool {
        true
    }
    async fn run(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutcome> {
        #[derive(Deserialize)]
        struct Args {
            content: String,
        }
        let args: Args = serde_json::from_value(args).map_err(|e| bad_args("complete", e))?;
        Ok(ToolOutcome::Terminal(TerminalIntent::Complete {
            content: args.content,
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// delegate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DelegateTool;

#[async_trait::async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }
    fn description(&self) -> &str {
        "Assign a sub-task to one or more other agents and wait for all \
         of their answers. Recipients are agent slugs or pubkeys."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "recipients": {
                    "type": "array",
                    "items": {"type": "string"},
                    "minItems": 1,
                    "description": "Agents to assign the task to."
                },
                "content": {
                    "type": "string",
                    "description": "The task description sent to each recipient."
                }
            },
            "required": ["recipients", "content"]
        })
    }
    fn is_terminal(&self) -> bool {
        true
    }
    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        #[derive(Deserialize)]
        struct Args {
            recipients: Vec<String>,
            content: String,
        }
        let args: Args = serde_json::from_value(args).map_err(|e| bad_args("delegate", e))?;
        if args.recipients.is_empty() {
            return Err(bad_args("delegate", "recipients must not be empty"));
        }

        // Resolve slugs to pubkeys; unknown names pass through as-is so
        // cross-project pubkeys keep working.
        let mut recipients = Vec::new();
        for recipient in &args.recipients {
            let pubkey = ctx
                .project_agents
                .get(recipient)
                .cloned()
                .unwrap_or_else(|| recipient.clone());
            if pubkey == ctx.agent_pubkey {
                return Err(Error::DelegationSelfTarget);
            }
            if !recipients.contains(&pubkey) {
                recipients.push(pubkey);
            }
        }

        Ok(ToolOutcome::Terminal(TerminalIntent::Delegate {
            recipients,
            content: args.content,
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// switch_phase
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SwitchPhaseTool;

#[async_trait::async_trait]
impl Tool for SwitchPhaseTool {
    fn name(&self) -> &str {
        "switch_phase"
    }
    fn description(&self) -> &str {
        "Move the conversation to a different workflow phase \
         (chat, brainstorm, plan, execute, verification, chores, reflection)."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "phase": {
                    "type": "string",
                    "enum": ["chat", "brainstorm", "plan", "execute", "verification", "chores", "reflection"]
                },
                "reason": {
                    "type": "string",
                    "description": "Why the phase is changing."
                }
            },
            "required": ["phase", "reason"]
        })
    }
    fn is_terminal(&self) -> bool {
        true
    }
    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        #[derive(Deserialize)]
        struct Args {
            phase: String,
            reason: String,
        }
        let args: Args = serde_json::from_value(args).map_err(|e| bad_args("switch_phase", e))?;
        let to: Phase = args
            .phase
            .parse()
            .map_err(|e| bad_args("switch_phase", e))?;
        if to == ctx.conversation_phase {
            return Err(Error::Tool {
                tool: "switch_phase".into(),
                message: format!("conversation is already in phase {to}"),
            });
        }
        Ok(ToolOutcome::Terminal(TerminalIntent::SwitchPhase {
            to,
            reason: args.reason,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_context;

    #[tokio::test]
    async fn complete_returns_terminal_intent() {
        let ctx = test_context(std::env::temp_dir());
        let outcome = CompleteTool
            .run(serde_json::json!({"content": "done"}), &ctx)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ToolOutcome::Terminal(TerminalIntent::Complete { content }) if content == "done"
        ));
    }

    #[tokio::test]
    async fn delegate_resolves_slugs_and_dedupes() {
        let ctx = test_context(std::env::temp_dir());
        let outcome = DelegateTool
            .run(
                serde_json::json!({
                    "recipients": ["dev", "dev-pubkey", "external-pubkey"],
                    "content": "summarize"
                }),
                &ctx,
            )
            .await
            .unwrap();
        match outcome {
            ToolOutcome::Terminal(TerminalIntent::Delegate { recipients, .. }) => {
                assert_eq!(recipients, vec!["dev-pubkey", "external-pubkey"]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delegate_to_self_is_rejected() {
        let ctx = test_context(std::env::temp_dir());
        let err = DelegateTool
            .run(
                serde_json::json!({"recipients": ["pm"], "content": "x"}),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DelegationSelfTarget));
    }

    #[tokio::test]
    async fn delegate_requires_recipients() {
        let ctx = test_context(std::env::temp_dir());
        assert!(DelegateTool
            .run(serde_json::json!({"recipients": [], "content": "x"}), &ctx)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn switch_phase_parses_and_rejects_noop() {
        let ctx = test_context(std::env::temp_dir());
        let outcome = SwitchPhaseTool
            .run(
                serde_json::json!({"phase": "plan", "reason": "time to plan"}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ToolOutcome::Terminal(TerminalIntent::SwitchPhase { to: Phase::Plan, .. })
        ));

        // ctx is in chat already.
        assert!(SwitchPhaseTool
            .run(serde_json::json!({"phase": "chat", "reason": "stay"}), &ctx)
            .await
            .is_err());
    }
}
