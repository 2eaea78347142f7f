use std::sync::Arc;
use tracing::info;

use crate::anthropic::AnthropicProvider;
use crate::mock::MockChatProvider;
use crate::openai::OpenAiProvider;
use crate::provider::ChatProvider;
use gantry_config::GantryConfig;
use gantry_core::{GatewayError, Result};

/// Maps provider names to their adapters. Registration order is priority
/// order and drives model lookup fallbacks.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ChatProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from config. Providers without an API key are
    /// skipped; when none qualifies, a mock provider is registered so the
    /// gateway can still serve requests in mock mode.
    pub fn from_config(config: &GantryConfig) -> Self {
        let mut registry = Self::new();

        let mut entries: Vec<_> = config.providers.iter().collect();
        entries.sort_by_key(|(name, p)| (p.priority, name.as_str().to_string()));

        for (name, provider_config) in entries {
            if provider_config.api_key.is_none() {
                continue;
            }
            let provider: Arc<dyn ChatProvider> = match name.as_str() {
                "anthropic" => Arc::new(AnthropicProvider::from_config(provider_config)),
                // Everything else is assumed to speak the OpenAI wire format.
                _ => Arc::new(OpenAiProvider::from_config(name, provider_config)),
            };
            registry.register(provider);
        }

        if registry.is_empty() {
            info!("no provider has an api_key — registering mock provider");
            registry.register(Arc::new(MockChatProvider::new("mock")));
        }

        registry
    }

    pub fn register(&mut self, provider: Arc<dyn ChatProvider>) {
        info!(provider = provider.name(), "registered provider");
        self.providers.push(provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChatProvider>> {
        self.providers
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Require a provider by name.
    pub fn expect(&self, name: &str) -> Result<Arc<dyn ChatProvider>> {
        self.get(name)
            .ok_or_else(|| GatewayError::NotFound(format!("provider {name} is not registered")))
    }

    /// First registered provider supporting the given model.
    pub fn find_for_model(&self, model: &str) -> Option<Arc<dyn ChatProvider>> {
        self.providers.iter().find(|p| p.supports(model)).cloned()
    }

    /// First registered provider — the default when the request names none.
    pub fn first(&self) -> Option<Arc<dyn ChatProvider>> {
        self.providers.first().cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ChatProvider>> {
        self.providers.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Whether the registry is serving mock mode (no real upstream).
    pub fn is_mock_mode(&self) -> bool {
        self.providers.len() == 1 && self.providers[0].info().family == "mock"
    }
}
