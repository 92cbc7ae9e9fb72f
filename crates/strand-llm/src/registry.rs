use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use strand_core::config::ProviderConfig;
use strand_core::error::{Result, StrandError};
use strand_core::traits::{ModelProvider, ModelResolver};

use crate::openai::{OpenAiProvider, OPENAI_API_URL};

/// Default endpoint for a well-known OpenAI-compatible provider name.
pub fn preset_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some(OPENAI_API_URL),
        "ollama" => Some("http://localhost:11434/v1/chat/completions"),
        "vllm" => Some("http://localhost:8000/v1/chat/completions"),
        "groq" => Some("https://api.groq.com/openai/v1/chat/completions"),
        "openrouter" => Some("https://openrouter.ai/api/v1/chat/completions"),
        "together" => Some("https://api.together.xyz/v1/chat/completions"),
        "mistral" => Some("https://api.mistral.ai/v1/chat/completions"),
        "deepseek" => Some("https://api.deepseek.com/v1/chat/completions"),
        _ => None,
    }
}

/// Named model providers, built from `[providers.*]` config or registered directly.
///
/// Providers are shared across runs; each run picks its model per request.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn ModelProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a provider for every configured entry. Entries without a
    /// `base_url` must name a known preset.
    pub fn from_config(configs: &HashMap<String, ProviderConfig>) -> Result<Self> {
        let registry = Self::new();
        for (name, config) in configs {
            let default_url = match (config.base_url.as_deref(), preset_base_url(name)) {
                (Some(url), _) => url,
                (None, Some(url)) => url,
                (None, None) => {
                    return Err(StrandError::Config(format!(
                        "provider '{}' has no base_url and is not a known preset",
                        name
                    )))
                }
            };
            let provider = OpenAiProvider::from_config(name, config, default_url);
            registry.register(name.clone(), Arc::new(provider));
        }
        Ok(registry)
    }

    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn ModelProvider>) {
        let name = name.into();
        debug!(provider = %name, "Registered model provider");
        if let Ok(mut map) = self.providers.write() {
            map.insert(name, provider);
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl ModelResolver for ProviderRegistry {
    fn resolve(&self, provider: &str, model: &str) -> Result<Arc<dyn ModelProvider>> {
        if model.trim().is_empty() {
            return Err(StrandError::DependencyUnavailable(format!(
                "no model configured for provider '{}'",
                provider
            )));
        }

        let existing = self
            .providers
            .read()
            .map_err(|_| StrandError::DependencyUnavailable("provider registry poisoned".into()))?
            .get(provider)
            .cloned();
        if let Some(p) = existing {
            return Ok(p);
        }

        // Keyless local presets can be used without configuration.
        match provider {
            "ollama" | "vllm" => {
                let url = preset_base_url(provider).unwrap_or(OPENAI_API_URL);
                let p: Arc<dyn ModelProvider> = Arc::new(OpenAiProvider::new(provider, url));
                self.register(provider, p.clone());
                Ok(p)
            }
            _ => Err(StrandError::UnsupportedProvider(provider.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_provider_resolves() {
        let mut configs = HashMap::new();
        configs.insert(
            "groq".to_string(),
            ProviderConfig {
                base_url: None,
                api_key: Some("k".into()),
                extra_headers: HashMap::new(),
                pricing: HashMap::new(),
            },
        );
        let registry = ProviderRegistry::from_config(&configs).unwrap();
        let p = registry.resolve("groq", "llama-3.1-8b").unwrap();
        assert_eq!(p.name(), "groq");
    }

    #[test]
    fn unknown_provider_is_unsupported() {
        let registry = ProviderRegistry::new();
        let err = registry.resolve("acme", "m").err().unwrap();
        assert!(matches!(err, StrandError::UnsupportedProvider(_)));
    }

    #[test]
    fn unknown_provider_without_url_fails_config() {
        let mut configs = HashMap::new();
        configs.insert(
            "acme".to_string(),
            ProviderConfig {
                base_url: None,
                api_key: None,
                extra_headers: HashMap::new(),
                pricing: HashMap::new(),
            },
        );
        assert!(ProviderRegistry::from_config(&configs).is_err());
    }

    #[test]
    fn local_preset_resolves_lazily() {
        let registry = ProviderRegistry::new();
        assert!(registry.resolve("ollama", "llama3").is_ok());
        assert_eq!(registry.names(), vec!["ollama".to_string()]);
    }
}
