//! File tools: safe, auditable file I/O constrained to the project's
//! workspace root. Paths resolving outside the root are rejected.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tokio::fs;

use tenex_domain::{Error, Result};

use crate::{Tool, ToolContext, ToolOutcome};

/// Hard cap on content returned from a single read.
const MAX_READ_BYTES: usize = 256 * 1024;

fn tool_err(tool: &str, message: impl Into<String>) -> Error {
    Error::Tool {
        tool: tool.to_string(),
        message: message.into(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Path validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate and resolve a requested path within the workspace root.
///
/// Rejects absolute paths and `..` components up front, then checks the
/// canonicalized result is still contained in the root.
pub fn validate_path(workspace_root: &Path, requested: &str) -> std::result::Result<PathBuf, String> {
    let requested_path = Path::new(requested);
    if requested_path.is_absolute() {
        return Err(format!(
            "absolute paths are not allowed; use a path relative to the workspace root (got '{requested}')"
        ));
    }
    for component in requested_path.components() {
        if matches!(component, Component::ParentDir) {
            return Err("path must not contain '..' components".to_owned());
        }
    }

    let canonical_root = workspace_root.canonicalize().map_err(|e| {
        format!(
            "cannot resolve workspace root '{}': {e}",
            workspace_root.display()
        )
    })?;
    let candidate = canonical_root.join(requested_path);

    let resolved = if candidate.exists() {
        candidate
            .canonicalize()
            .map_err(|e| format!("cannot resolve path '{}': {e}", candidate.display()))?
    } else {
        // Target does not exist yet (writes): containment is implied by
        // the component checks above.
        candidate
    };

    if !resolved.starts_with(&canonical_root) {
        return Err(format!("path '{requested}' escapes the workspace root"));
    }
    Ok(resolved)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// read_file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ReadFileTool;

#[async_trait::async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "Read a text file from the project workspace."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path relative to the workspace root."}
            },
            "required": ["path"]
        })
    }
    fn is_commutative(&self) -> bool {
        true
    }
    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        #[derive(Deserialize)]
        struct Args {
            path: String,
        }
        let args: Args =
            serde_json::from_value(args).map_err(|e| tool_err("read_file", e.to_string()))?;
        let path = validate_path(&ctx.workspace_root, &args.path)
            .map_err(|e| tool_err("read_file", e))?;
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| tool_err("read_file", format!("{}: {e}", args.path)))?;
        let truncated = content.len() > MAX_READ_BYTES;
        let content = if truncated {
            // Back off to a char boundary to avoid splitting a
            // multi-byte character.
            let mut boundary = MAX_READ_BYTES;
            while boundary > 0 && !content.is_char_boundary(boundary) {
                boundary -= 1;
            }
            content[..boundary].to_string()
        } else {
            content
        };
        Ok(ToolOutcome::Result(serde_json::json!({
            "path": args.path,
            "content": content,
            "truncated": truncated,
        })))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// write_file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WriteFileTool;

#[async_trait::async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }
    fn description(&self) -> &str {
        "Write a text file inside the project workspace, creating parent directories as needed."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["path", "content"]
        })
    }
    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        #[derive(Deserialize)]
        struct Args {
            path: String,
            content: String,
        }
        let args: Args =
            serde_json::from_value(args).map_err(|e| tool_err("write_file", e.to_string()))?;
        let path = validate_path(&ctx.workspace_root, &args.path)
            .map_err(|e| tool_err("write_file", e))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| tool_err("write_file", e.to_string()))?;
        }
        let bytes = args.content.len();
        fs::write(&path, args.content)
            .await
            .map_err(|e| tool_err("write_file", format!("{}: {e}", args.path)))?;
        Ok(ToolOutcome::Result(serde_json::json!({
            "path": args.path,
            "bytes_written": bytes,
        })))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// list_files
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ListFilesTool;

#[async_trait::async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }
    fn description(&self) -> &str {
        "List the entries of a directory in the project workspace."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory, defaults to the workspace root."}
            }
        })
    }
    fn is_commutative(&self) -> bool {
        true
    }
    async fn run(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        #[derive(Deserialize)]
        struct Args {
            #[serde(default = "default_dot")]
            path: String,
        }
        fn default_dot() -> String {
            ".".into()
        }
        let args: Args =
            serde_json::from_value(args).map_err(|e| tool_err("list_files", e.to_string()))?;
        let path = validate_path(&ctx.workspace_root, &args.path)
            .map_err(|e| tool_err("list_files", e))?;

        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(&path)
            .await
            .map_err(|e| tool_err("list_files", format!("{}: {e}", args.path)))?;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| tool_err("list_files", e.to_string()))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| tool_err("list_files", e.to_string()))?;
            entries.push(serde_json::json!({
                "name": entry.file_name().to_string_lossy(),
                "size": meta.len(),
                "is_dir": meta.is_dir(),
            }));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        Ok(ToolOutcome::Result(serde_json::json!({
            "path": args.path,
            "entries": entries,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_context;

    #[test]
    fn validate_path_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_path(dir.path(), "../outside").is_err());
        assert!(validate_path(dir.path(), "/etc/passwd").is_err());
        assert!(validate_path(dir.path(), "ok/inner.txt").is_ok());
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path().to_path_buf());

        WriteFileTool
            .run(
                serde_json::json!({"path": "notes/a.txt", "content": "hello"}),
                &ctx,
            )
            .await
            .unwrap();

        let outcome = ReadFileTool
            .run(serde_json::json!({"path": "notes/a.txt"}), &ctx)
            .await
            .unwrap();
        match outcome {
            ToolOutcome::Result(v) => assert_eq!(v["content"], "hello"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_missing_file_is_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path().to_path_buf());
        let err = ReadFileTool
            .run(serde_json::json!({"path": "missing.txt"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool { .. }));
    }

    #[tokio::test]
    async fn list_files_sorts_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let ctx = test_context(dir.path().to_path_buf());
        let outcome = ListFilesTool.run(serde_json::json!({}), &ctx).await.unwrap();
        match outcome {
            ToolOutcome::Result(v) => {
                let names: Vec<_> = v["entries"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|e| e["name"].as_str().unwrap().to_string())
                    .collect();
                assert_eq!(names, vec!["a.txt", "b.txt"]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
