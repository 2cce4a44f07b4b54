//! Shell tool: run a command in the project workspace with a timeout,
//! an output cap, and a denied-pattern set checked before execution.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use tenex_domain::{Error, Result};

use crate::{Tool, ToolContext, ToolOutcome};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_TIMEOUT_SECS: u64 = 600;
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Commands that are never run, regardless of agent configuration.
const DENIED_PATTERNS: &[&str] = &[
    r"(^|\s)rm\s+(-[a-zA-Z]*\s+)*/(\s|$)",
    r"(^|\s)mkfs(\.|\s)",
    r"(^|\s)dd\s+.*of=/dev/",
    r":\(\)\s*\{.*\};\s*:",
    r"(^|\s)shutdown(\s|$)",
    r"(^|\s)reboot(\s|$)",
];

pub struct ShellTool {
    denied: regex::RegexSet,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellTool {
    pub fn new() -> Self {
        // Patterns are compile-time constants; a failure here is a bug.
        let denied = regex::RegexSet::new(DENIED_PATTERNS).expect("denied patterns are valid");
        Self { denied }
    }
}

fn cap_output(raw: Vec<u8>) -> (String, bool) {
    let text = String::from_utf8_lossy(&raw).into_owned();
    if text.len() <= MAX_OUTPUT_BYTES {
        return (text, false);
    }
    let mut boundary = MAX_OUTPUT_BYTES;
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    (text[..boundary].to_string(), true)
}

#[async_trait::async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }
    fn description(&self) -> &str {
        "Run a shell command in the project workspace. Output is captured \
         and truncated past 64 KiB; commands are killed after the timeout."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "timeout_secs": {
                    "type": "integer",
                    "description": "Seconds before the command is killed (default 60, max 600)."
                }
            },
            "required": ["command"]
        })
    }
    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        #[derive(Deserialize)]
        struct Args {
            command: String,
            timeout_secs: Option<u64>,
        }
        let args: Args = serde_json::from_value(args).map_err(|e| Error::Tool {
            tool: "shell".into(),
            message: format!("invalid arguments: {e}"),
        })?;

        if self.denied.is_match(&args.command) {
            return Err(Error::Tool {
                tool: "shell".into(),
                message: "command matches a denied pattern".into(),
            });
        }

        let timeout = Duration::from_secs(
            args.timeout_secs
                .unwrap_or(DEFAULT_TIMEOUT_SECS)
                .min(MAX_TIMEOUT_SECS),
        );
        tracing::debug!(command = %args.command, timeout_secs = timeout.as_secs(), "running shell command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&args.command)
            .current_dir(&ctx.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Tool {
                tool: "shell".into(),
                message: format!("spawn failed: {e}"),
            })?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let read_output = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            if let Some(s) = stdout.as_mut() {
                let _ = s.read_to_end(&mut out).await;
            }
            if let Some(s) = stderr.as_mut() {
                let _ = s.read_to_end(&mut err).await;
            }
            let status = child.wait().await;
            (out, err, status)
        };

        match tokio::time::timeout(timeout, read_output).await {
            Ok((out, err, status)) => {
                let (stdout_text, stdout_truncated) = cap_output(out);
                let (stderr_text, stderr_truncated) = cap_output(err);
                let exit_code = status.ok().and_then(|s| s.code());
                Ok(ToolOutcome::Result(serde_json::json!({
                    "exit_code": exit_code,
                    "stdout": stdout_text,
                    "stderr": stderr_text,
                    "truncated": stdout_truncated || stderr_truncated,
                })))
            }
            Err(_) => Err(Error::Tool {
                tool: "shell".into(),
                message: format!("command timed out after {}s", timeout.as_secs()),
            }),
        }
    }
}
