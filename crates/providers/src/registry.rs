//! Provider registry: config slug → adapter instance.

use std::collections::HashMap;
use std::sync::Arc;

use tenex_domain::config::LlmConfig;

use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

/// All configured providers, keyed by config slug. Agents reference a
/// slug through their `llm_config` binding.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    default: Option<String>,
}

impl ProviderRegistry {
    /// Build the registry from config. Adapters that fail to construct
    /// are skipped with a warning so one bad entry does not take the
    /// daemon down.
    pub fn from_config(cfg: &LlmConfig) -> Self {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        for (slug, provider_cfg) in &cfg.configs {
            match OpenAiCompatProvider::from_config(slug, provider_cfg) {
                Ok(p) => {
                    tracing::info!(slug = %slug, model = %provider_cfg.model, "llm provider ready");
                    providers.insert(slug.clone(), Arc::new(p));
                }
                Err(e) => {
                    tracing::warn!(slug = %slug, error = %e, "skipping llm provider");
                }
            }
        }
        Self {
            providers,
            default: cfg.default.clone(),
        }
    }

    /// Registry with explicit instances (tests, custom adapters).
    pub fn with_providers(
        providers: HashMap<String, Arc<dyn LlmProvider>>,
        default: Option<String>,
    ) -> Self {
        Self { providers, default }
    }

    pub fn get(&self, slug: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(slug).cloned()
    }

    /// Resolution order: the agent's configured slug, the global
    /// default, then any available provider.
    pub fn resolve(&self, agent_config: Option<&str>) -> Option<Arc<dyn LlmProvider>> {
        if let Some(slug) = agent_config {
            if let Some(p) = self.get(slug) {
                return Some(p);
            }
            tracing::warn!(slug = %slug, "agent references unknown llm config, falling back");
        }
        if let Some(slug) = &self.default {
            if let Some(p) = self.get(slug) {
                return Some(p);
            }
        }
        self.providers.values().next().cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Registered config slugs (sorted).
    pub fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<_> = self.providers.keys().cloned().collect();
        slugs.sort();
        slugs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenex_domain::error::Result;
    use tenex_domain::stream::{BoxStream, StreamEvent};

    struct FakeProvider(String);

    #[async_trait::async_trait]
    impl LlmProvider for FakeProvider {
        async fn chat_stream(
            &self,
            _req: &crate::traits::ChatRequest,
        ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            Ok(Box::pin(futures_util::stream::empty()))
        }
        fn provider_id(&self) -> &str {
            &self.0
        }
    }

    fn registry() -> ProviderRegistry {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        providers.insert("fast".into(), Arc::new(FakeProvider("fast".into())));
        providers.insert("smart".into(), Arc::new(FakeProvider("smart".into())));
        ProviderRegistry::with_providers(providers, Some("fast".into()))
    }

    #[test]
    fn resolve_prefers_agent_config() {
        let r = registry();
        assert_eq!(r.resolve(Some("smart")).unwrap().provider_id(), "smart");
    }

    #[test]
    fn resolve_falls_back_to_default() {
        let r = registry();
        assert_eq!(r.resolve(Some("missing")).unwrap().provider_id(), "fast");
        assert_eq!(r.resolve(None).unwrap().provider_id(), "fast");
    }

    #[test]
    fn empty_registry_resolves_none() {
        let r = ProviderRegistry::with_providers(HashMap::new(), None);
        assert!(r.resolve(None).is_none());
    }
}
