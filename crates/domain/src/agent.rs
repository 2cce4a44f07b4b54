//! Agent and project identity.
//!
//! Agents are global signing principals referenced by projects; a project
//! is the addressable unit that owns conversations and a subscription
//! scope.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::kind;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent definition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An agent's role definition: identity, prompt, tool set, model binding.
///
/// The signing secret is **not** part of this type; it stays inside the
/// agent store and the signer built from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentDefinition {
    /// Short local name, unique within a project.
    pub slug: String,
    pub pubkey: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
    /// Prompt text injected into the agent's system message.
    #[serde(default)]
    pub instructions: String,
    /// Names of tools the agent may call (core agent tools are implied).
    #[serde(default)]
    pub tools: BTreeSet<String>,
    /// Slug of the LLM configuration this agent runs on.
    #[serde(default)]
    pub llm_config: Option<String>,
    #[serde(default)]
    pub is_pm: bool,
}

impl AgentDefinition {
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains(name)
    }

    /// Apply a replaceable agent-config update event to this definition.
    ///
    /// The event content is a JSON object; only recognized fields are
    /// applied, everything else is left untouched.
    pub fn apply_config_update(&mut self, event: &Event) -> Result<()> {
        if event.kind != kind::AGENT_CONFIG_UPDATE {
            return Err(Error::Validation(format!(
                "kind {} is not an agent config update",
                event.kind
            )));
        }
        #[derive(Deserialize)]
        struct Update {
            name: Option<String>,
            role: Option<String>,
            instructions: Option<String>,
            tools: Option<BTreeSet<String>>,
            llm_config: Option<String>,
        }
        let update: Update = serde_json::from_str(&event.content)
            .map_err(|e| Error::Validation(format!("agent config update: {e}")))?;
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(role) = update.role {
            self.role = role;
        }
        if let Some(instructions) = update.instructions {
            self.instructions = instructions;
        }
        if let Some(tools) = update.tools {
            self.tools = tools;
        }
        if let Some(llm_config) = update.llm_config {
            self.llm_config = Some(llm_config);
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Project definition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The addressable unit: who owns it, which agents participate, which of
/// them is the PM, and which MCP servers it mounts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectDefinition {
    /// Replaceable-event identifier (`d` tag).
    pub d_tag: String,
    pub owner_pubkey: String,
    #[serde(default)]
    pub title: String,
    /// Participating agent pubkeys, in declaration order.
    pub agents: Vec<String>,
    /// Pubkey of the agent marked as PM, when one is declared.
    #[serde(default)]
    pub pm: Option<String>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
}

impl ProjectDefinition {
    /// Parse a project definition from its replaceable relay event.
    ///
    /// Tag layout: `["d", identifier]`, one `["agent", pubkey, ("pm")]`
    /// per participant, `["mcp", url]` per server, optional
    /// `["title", name]`. At most one agent may carry the `"pm"` marker.
    pub fn from_event(event: &Event) -> Result<Self> {
        if event.kind != kind::PROJECT_DEF {
            return Err(Error::Validation(format!(
                "kind {} is not a project definition",
                event.kind
            )));
        }
        let d_tag = event
            .d_tag()
            .ok_or_else(|| Error::Validation("project definition missing d tag".into()))?
            .to_string();

        let mut agents = Vec::new();
        let mut pm = None;
        for tag in &event.tags {
            if tag.first().map(String::as_str) != Some("agent") {
                continue;
            }
            let Some(pubkey) = tag.get(1) else { continue };
            if !agents.contains(pubkey) {
                agents.push(pubkey.clone());
            }
            if tag.iter().skip(2).any(|v| v == "pm") {
                if pm.replace(pubkey.clone()).is_some_and(|prev| prev != *pubkey) {
                    return Err(Error::Validation(format!(
                        "project {d_tag} declares more than one PM"
                    )));
                }
            }
        }

        Ok(Self {
            d_tag,
            owner_pubkey: event.pubkey.clone(),
            title: event.title().unwrap_or_default().to_string(),
            agents,
            pm,
            mcp_servers: event.tag_values("mcp").map(String::from).collect(),
        })
    }

    /// Addressable id of this project: `kind:owner:d-tag`.
    pub fn address(&self) -> String {
        format!("{}:{}:{}", kind::PROJECT_DEF, self.owner_pubkey, self.d_tag)
    }

    pub fn includes_agent(&self, pubkey: &str) -> bool {
        self.agents.iter().any(|a| a == pubkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_event(tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: "pid".into(),
            pubkey: "owner".into(),
            created_at: 0,
            kind: kind::PROJECT_DEF,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn parses_agents_and_pm() {
        let ev = project_event(vec![
            vec!["d", "tenex"],
            vec!["title", "TENEX"],
            vec!["agent", "a1", "pm"],
            vec!["agent", "a2"],
            vec!["mcp", "wss://mcp.example"],
        ]);
        let def = ProjectDefinition::from_event(&ev).unwrap();
        assert_eq!(def.d_tag, "tenex");
        assert_eq!(def.agents, vec!["a1", "a2"]);
        assert_eq!(def.pm.as_deref(), Some("a1"));
        assert_eq!(def.mcp_servers, vec!["wss://mcp.example"]);
        assert_eq!(def.address(), format!("{}:owner:tenex", kind::PROJECT_DEF));
    }

    #[test]
    fn rejects_two_pms() {
        let ev = project_event(vec![
            vec!["d", "x"],
            vec!["agent", "a1", "pm"],
            vec!["agent", "a2", "pm"],
        ]);
        assert!(ProjectDefinition::from_event(&ev).is_err());
    }

    #[test]
    fn rejects_missing_d_tag() {
        let ev = project_event(vec![vec!["agent", "a1"]]);
        assert!(ProjectDefinition::from_event(&ev).is_err());
    }

    #[test]
    fn config_update_applies_known_fields_only() {
        let mut def = AgentDefinition {
            slug: "dev".into(),
            pubkey: "a2".into(),
            name: "Dev".into(),
            role: "developer".into(),
            instructions: "old".into(),
            tools: BTreeSet::new(),
            llm_config: None,
            is_pm: false,
        };
        let ev = Event {
            id: "u1".into(),
            pubkey: "a2".into(),
            created_at: 0,
            kind: kind::AGENT_CONFIG_UPDATE,
            tags: vec![],
            content: r#"{"instructions":"new","tools":["shell"],"unknown":1}"#.into(),
            sig: String::new(),
        };
        def.apply_config_update(&ev).unwrap();
        assert_eq!(def.instructions, "new");
        assert!(def.has_tool("shell"));
        assert_eq!(def.name, "Dev");
    }
}
