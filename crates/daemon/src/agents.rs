//! Global agent store.
//!
//! `agents/<pubkey>.json` files are the source of truth for agent
//! identity and signing material. Agents are shared by reference between
//! projects; secrets never leave the signer built here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tenex_domain::agent::AgentDefinition;
use tenex_domain::event::Event;
use tenex_domain::{kind, Error, Result};
use tenex_relay::{EventSigner, Filter, KeypairSigner, RelayClient};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stored form
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// On-disk agent record. `nsec` is absent for agents whose definition
/// was fetched from the relay; those cannot sign and never execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAgent {
    #[serde(flatten)]
    pub definition: AgentDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsec: Option<String>,
}

impl StoredAgent {
    pub fn can_sign(&self) -> bool {
        self.nsec.is_some()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AgentStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AgentStore {
    dir: PathBuf,
    agents: RwLock<HashMap<String, StoredAgent>>,
    signers: RwLock<HashMap<String, Arc<KeypairSigner>>>,
}

impl AgentStore {
    pub fn open(agents_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(agents_dir).map_err(Error::Io)?;
        let store = Self {
            dir: agents_dir.to_path_buf(),
            agents: RwLock::new(HashMap::new()),
            signers: RwLock::new(HashMap::new()),
        };
        store.load_all()?;
        Ok(store)
    }

    fn load_all(&self) -> Result<()> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.dir).map_err(Error::Io)? {
            let path = entry.map_err(Error::Io)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(Error::Io)
                .and_then(|raw| serde_json::from_str::<StoredAgent>(&raw).map_err(Error::Json))
            {
                Ok(agent) => {
                    self.agents
                        .write()
                        .insert(agent.definition.pubkey.clone(), agent);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable agent file");
                }
            }
        }
        tracing::info!(count = loaded, dir = %self.dir.display(), "agent store loaded");
        Ok(())
    }

    pub fn get(&self, pubkey: &str) -> Option<StoredAgent> {
        self.agents.read().get(pubkey).cloned()
    }

    pub fn list(&self) -> Vec<StoredAgent> {
        let mut agents: Vec<_> = self.agents.read().values().cloned().collect();
        agents.sort_by(|a, b| a.definition.slug.cmp(&b.definition.slug));
        agents
    }

    /// Insert or replace an agent and persist its file.
    pub fn save(&self, agent: StoredAgent) -> Result<()> {
        let pubkey = agent.definition.pubkey.clone();
        let path = self.dir.join(format!("{pubkey}.json"));
        let tmp = self.dir.join(format!("{pubkey}.json.tmp"));
        let raw = serde_json::to_vec_pretty(&agent)?;
        std::fs::write(&tmp, raw).map_err(Error::Io)?;
        std::fs::rename(&tmp, &path).map_err(Error::Io)?;
        self.signers.write().remove(&pubkey);
        self.agents.write().insert(pubkey, agent);
        Ok(())
    }

    pub fn remove(&self, pubkey: &str) -> Result<bool> {
        let existed = self.agents.write().remove(pubkey).is_some();
        self.signers.write().remove(pubkey);
        if existed {
            let path = self.dir.join(format!("{pubkey}.json"));
            if path.exists() {
                std::fs::remove_file(&path).map_err(Error::Io)?;
            }
        }
        Ok(existed)
    }

    /// The signer for an agent that holds key material. Cached; one
    /// signer instance per pubkey.
    pub fn signer(&self, pubkey: &str) -> Option<Arc<dyn EventSigner>> {
        if let Some(signer) = self.signers.read().get(pubkey) {
            return Some(signer.clone() as Arc<dyn EventSigner>);
        }
        let agent = self.get(pubkey)?;
        let nsec = agent.nsec?;
        let signer = Arc::new(KeypairSigner::new(pubkey, &nsec));
        self.signers
            .write()
            .insert(pubkey.to_string(), signer.clone());
        Some(signer as Arc<dyn EventSigner>)
    }

    /// Apply a replaceable agent-config update to the stored definition.
    pub fn apply_config_update(&self, event: &Event) -> Result<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(&event.pubkey)
            .ok_or_else(|| Error::Validation(format!("config update for unknown agent {}", event.pubkey)))?;
        agent.definition.apply_config_update(event)?;
        let snapshot = agent.clone();
        drop(agents);
        self.save(snapshot)
    }

    /// Resolve a project's agent pubkeys: local records first, then a
    /// bounded relay fetch of replaceable definitions for the rest.
    /// Fetched agents are stored without key material.
    pub async fn fetch_missing(
        &self,
        relay: &dyn RelayClient,
        pubkeys: &[String],
    ) -> Result<()> {
        let missing: Vec<String> = pubkeys
            .iter()
            .filter(|pk| self.get(pk).is_none())
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let events = relay
            .fetch(
                vec![Filter::new()
                    .authors(missing.clone())
                    .kinds([kind::AGENT_CONFIG_UPDATE])],
                Duration::from_secs(10),
            )
            .await?;

        for pubkey in &missing {
            // Replaceable: the newest definition wins.
            let Some(event) = events
                .iter()
                .filter(|e| e.pubkey == *pubkey)
                .max_by_key(|e| e.created_at)
            else {
                tracing::warn!(pubkey = %pubkey, "agent definition not found locally or on relay");
                continue;
            };
            let mut definition = AgentDefinition {
                slug: format!("agent-{}", &pubkey[..pubkey.len().min(8)]),
                pubkey: pubkey.clone(),
                name: String::new(),
                role: String::new(),
                instructions: String::new(),
                tools: Default::default(),
                llm_config: None,
                is_pm: false,
            };
            if let Err(e) = definition.apply_config_update(event) {
                tracing::warn!(pubkey = %pubkey, error = %e, "malformed remote agent definition");
            }
            self.save(StoredAgent {
                definition,
                nsec: None,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn agent(slug: &str, pubkey: &str, nsec: Option<&str>) -> StoredAgent {
        StoredAgent {
            definition: AgentDefinition {
                slug: slug.into(),
                pubkey: pubkey.into(),
                name: slug.to_uppercase(),
                role: "helper".into(),
                instructions: "be useful".into(),
                tools: BTreeSet::new(),
                llm_config: None,
                is_pm: false,
            },
            nsec: nsec.map(String::from),
        }
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = AgentStore::open(dir.path()).unwrap();
            store.save(agent("pm", "pk1", Some("aa"))).unwrap();
            store.save(agent("dev", "pk2", None)).unwrap();
        }
        let store = AgentStore::open(dir.path()).unwrap();
        assert_eq!(store.list().len(), 2);
        assert!(store.get("pk1").unwrap().can_sign());
        assert!(!store.get("pk2").unwrap().can_sign());
    }

    #[test]
    fn signer_only_for_key_holders() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStore::open(dir.path()).unwrap();
        store.save(agent("pm", "pk1", Some("aa"))).unwrap();
        store.save(agent("dev", "pk2", None)).unwrap();
        assert!(store.signer("pk1").is_some());
        assert!(store.signer("pk2").is_none());
        assert_eq!(store.signer("pk1").unwrap().pubkey(), "pk1");
    }

    #[test]
    fn remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStore::open(dir.path()).unwrap();
        store.save(agent("pm", "pk1", Some("aa"))).unwrap();
        assert!(store.remove("pk1").unwrap());
        assert!(!store.remove("pk1").unwrap());
        assert!(!dir.path().join("pk1.json").exists());
    }

    #[tokio::test]
    async fn fetch_missing_stores_remote_definitions_without_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStore::open(dir.path()).unwrap();
        let relay = tenex_relay::InMemoryRelay::new();
        relay.inject(Event {
            id: "def1".into(),
            pubkey: "remote-pk".into(),
            created_at: 10,
            kind: kind::AGENT_CONFIG_UPDATE,
            tags: vec![],
            content: r#"{"name":"Remote","role":"specialist"}"#.into(),
            sig: String::new(),
        });

        store
            .fetch_missing(&relay, &["remote-pk".to_string()])
            .await
            .unwrap();
        let fetched = store.get("remote-pk").unwrap();
        assert_eq!(fetched.definition.name, "Remote");
        assert!(!fetched.can_sign());
    }
}
