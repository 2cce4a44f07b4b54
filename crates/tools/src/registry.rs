//! Tool registry: explicit construction at project start, no global
//! self-registration.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tenex_domain::tool::ToolDefinition;

use crate::core::{CompleteTool, DelegateTool, SwitchPhaseTool};
use crate::fs::{ListFilesTool, ReadFileTool, WriteFileTool};
use crate::shell::ShellTool;
use crate::Tool;

/// System tools excluded from status-event tool enumeration.
pub const CORE_TOOLS: &[&str] = &["complete", "delegate", "switch_phase"];

/// Tools every agent carries implicitly. `delegate` is deliberately not
/// implied: holding it widens an agent's routing behaviour, so it must
/// be granted per agent (the PM receives it by default).
pub const IMPLIED_TOOLS: &[&str] = &["complete", "switch_phase"];

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Registry with the full built-in tool set.
    pub fn builtin() -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
        };
        registry.register(Arc::new(CompleteTool));
        registry.register(Arc::new(DelegateTool));
        registry.register(Arc::new(SwitchPhaseTool));
        registry.register(Arc::new(ReadFileTool));
        registry.register(Arc::new(WriteFileTool));
        registry.register(Arc::new(ListFilesTool));
        registry.register(Arc::new(ShellTool::new()));
        registry
    }

    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Later registrations under the same name win (project-mounted
    /// tools may shadow built-ins).
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_core(name: &str) -> bool {
        CORE_TOOLS.contains(&name)
    }

    /// The tool names visible to an agent: its configured set plus the
    /// implied core tools, restricted to what is actually registered.
    pub fn names_for_agent(&self, configured: &BTreeSet<String>) -> Vec<String> {
        let mut names: Vec<String> = IMPLIED_TOOLS
            .iter()
            .map(|n| n.to_string())
            .chain(configured.iter().cloned())
            .filter(|n| self.tools.contains_key(n))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Definitions handed to the LLM for an agent.
    pub fn definitions_for_agent(&self, configured: &BTreeSet<String>) -> Vec<ToolDefinition> {
        self.names_for_agent(configured)
            .into_iter()
            .filter_map(|name| self.get(&name))
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_core_tools() {
        let registry = ToolRegistry::builtin();
        for name in CORE_TOOLS {
            let tool = registry.get(name).unwrap();
            assert!(tool.is_terminal(), "{name} must be terminal");
        }
    }

    #[test]
    fn agent_sees_implied_plus_configured() {
        let registry = ToolRegistry::builtin();
        let configured = BTreeSet::from(["shell".to_string(), "nonexistent".to_string()]);
        let names = registry.names_for_agent(&configured);
        assert!(names.contains(&"complete".to_string()));
        assert!(names.contains(&"shell".to_string()));
        assert!(!names.contains(&"nonexistent".to_string()));
        assert!(!names.contains(&"read_file".to_string()));
        // delegate is granted, never implied.
        assert!(!names.contains(&"delegate".to_string()));
        let with_delegate = registry.names_for_agent(&BTreeSet::from(["delegate".to_string()]));
        assert!(with_delegate.contains(&"delegate".to_string()));
    }

    #[test]
    fn definitions_match_visible_names() {
        let registry = ToolRegistry::builtin();
        let configured = BTreeSet::from(["read_file".to_string()]);
        let defs = registry.definitions_for_agent(&configured);
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"read_file"));
        assert!(names.contains(&"complete"));
        assert!(defs.iter().all(|d| d.parameters.is_object()));
    }

    #[test]
    fn registration_shadows_by_name() {
        let mut registry = ToolRegistry::builtin();
        struct Shadow;
        #[async_trait::async_trait]
        impl Tool for Shadow {
            fn name(&self) -> &str {
                "shell"
            }
            fn description(&self) -> &str {
                "shadowed"
            }
            fn parameters(&self) -> serde_json::Value {
                serde_json::json!({"type": "object"})
            }
            async fn run(
                &self,
                _args: serde_json::Value,
                _ctx: &crate::ToolContext,
            ) -> tenex_domain::Result<crate::ToolOutcome> {
                Ok(crate::ToolOutcome::Result(serde_json::json!({})))
            }
        }
        registry.register(Arc::new(Shadow));
        assert_eq!(registry.get("shell").unwrap().description(), "shadowed");
    }
}
