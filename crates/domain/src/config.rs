//! Daemon configuration: typed sections deserialized from `tenex.toml`
//! with environment overrides for credentials.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub relays: RelayConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Relays
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay endpoints the daemon connects to.
    #[serde(default = "d_relay_urls")]
    pub urls: Vec<String>,
    /// Author pubkeys whose project definitions the daemon will activate.
    #[serde(default)]
    pub whitelist: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            urls: d_relay_urls(),
            whitelist: Vec::new(),
        }
    }
}

fn d_relay_urls() -> Vec<String> {
    vec!["wss://relay.damus.io".to_string()]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Data directories
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Global data directory. Per-project state lives under
    /// `<root>/projects/<projectId>/`, agent identities under
    /// `<root>/agents/`.
    #[serde(default = "d_data_root")]
    pub root: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self { root: d_data_root() }
    }
}

fn d_data_root() -> PathBuf {
    dirs_fallback().join("tenex")
}

fn dirs_fallback() -> PathBuf {
    std::env::var_os("HOME")
        .map(|h| PathBuf::from(h).join(".local/share"))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl DataConfig {
    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join("projects").join(sanitize_path_component(project_id))
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }
}

/// Replace path-hostile characters in an identifier used as a directory
/// name. Project ids contain `:` (addressable form).
pub fn sanitize_path_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    /// Named provider configurations (key = config slug referenced by
    /// agent definitions).
    #[serde(default)]
    pub configs: HashMap<String, ProviderConfig>,
    /// Config slug used when an agent does not name one.
    #[serde(default)]
    pub default: Option<String>,
    /// Soft per-call timeout in seconds.
    #[serde(default = "d_120")]
    pub soft_timeout_secs: u64,
    /// Hard per-call timeout in seconds; the stream is aborted past this.
    #[serde(default = "d_300")]
    pub hard_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// OpenAI-compatible chat completions base URL.
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key. Falls back to `api_key`.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ProviderConfig {
    /// Resolve the API key: env var first, then the inline value.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(env) = &self.api_key_env {
            if let Ok(v) = std::env::var(env) {
                if !v.is_empty() {
                    return Some(v);
                }
            }
        }
        self.api_key.clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime knobs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum reason-act iterations per invocation.
    #[serde(default = "d_10u32")]
    pub max_iterations: u32,
    /// Status heartbeat interval in milliseconds.
    #[serde(default = "d_30000")]
    pub status_interval_ms: u64,
    /// Debounce window for processed-event cache flushes, milliseconds.
    #[serde(default = "d_5000")]
    pub persist_debounce_ms: u64,
    /// Grace period granted to in-flight work on shutdown, milliseconds.
    #[serde(default = "d_5000")]
    pub shutdown_grace_ms: u64,
    /// Bounded time for fetching an orphan reply's ancestors, milliseconds.
    #[serde(default = "d_10000")]
    pub orphan_fetch_timeout_ms: u64,
    /// Bounded ancestor depth for orphan thread recovery.
    #[serde(default = "d_100u32")]
    pub orphan_fetch_depth: u32,
    /// Per-project inbox capacity; overflow drops the oldest event.
    #[serde(default = "d_1024")]
    pub inbox_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            status_interval_ms: 30_000,
            persist_debounce_ms: 5_000,
            shutdown_grace_ms: 5_000,
            orphan_fetch_timeout_ms: 10_000,
            orphan_fetch_depth: 100,
            inbox_capacity: 1024,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// History compression
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Estimated token count above which older history is folded.
    #[serde(default = "d_20000")]
    pub token_threshold: usize,
    /// Target budget for the built message list.
    #[serde(default = "d_16000")]
    pub token_budget: usize,
    /// Number of most-recent history events always kept verbatim.
    #[serde(default = "d_20usize")]
    pub sliding_window_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token_threshold: 20_000,
            token_budget: 16_000,
            sliding_window_size: 20,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

fn is_hex_pubkey(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl Config {
    /// Collect configuration problems. Errors abort daemon startup;
    /// warnings are logged and tolerated.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let mut push = |severity, message: String| {
            issues.push(ConfigIssue { severity, message });
        };

        if self.relays.urls.is_empty() {
            push(ConfigSeverity::Error, "relays.urls is empty".into());
        }
        for url in &self.relays.urls {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                push(
                    ConfigSeverity::Error,
                    format!("relay url {url} is not a websocket url"),
                );
            }
        }
        for pk in &self.relays.whitelist {
            if !is_hex_pubkey(pk) {
                push(
                    ConfigSeverity::Warning,
                    format!("whitelist entry {pk} is not a 64-char hex pubkey"),
                );
            }
        }
        if let Some(default) = &self.llm.default {
            if !self.llm.configs.contains_key(default) {
                push(
                    ConfigSeverity::Error,
                    format!("llm.default references unknown config {default}"),
                );
            }
        }
        for (slug, cfg) in &self.llm.configs {
            if cfg.resolve_api_key().is_none() {
                push(
                    ConfigSeverity::Warning,
                    format!("llm config {slug} has no API key configured"),
                );
            }
        }
        if self.llm.soft_timeout_secs > self.llm.hard_timeout_secs {
            push(
                ConfigSeverity::Error,
                "llm.soft_timeout_secs exceeds llm.hard_timeout_secs".into(),
            );
        }
        if self.compression.enabled && self.compression.token_budget > self.compression.token_threshold {
            push(
                ConfigSeverity::Warning,
                "compression.token_budget exceeds token_threshold; compression will thrash".into(),
            );
        }
        issues
    }
}

// ── serde default helpers ──────────────────────────────────────────

fn d_120() -> u64 { 120 }
fn d_300() -> u64 { 300 }
fn d_10u32() -> u32 { 10 }
fn d_100u32() -> u32 { 100 }
fn d_30000() -> u64 { 30_000 }
fn d_5000() -> u64 { 5_000 }
fn d_10000() -> u64 { 10_000 }
fn d_1024() -> usize { 1024 }
fn d_20000() -> usize { 20_000 }
fn d_16000() -> usize { 16_000 }
fn d_20usize() -> usize { 20 }
