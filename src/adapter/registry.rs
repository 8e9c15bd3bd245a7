//! Provider registry: one `Adapter` per provider tag, looked up by the
//! relay pipeline from `channel.provider`. New providers register here
//! without the relay pipeline changing at all.

use super::Adapter;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry pre-populated with the four built-in adapters.
    pub fn with_builtin_providers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::openai::OpenAIAdapter::new()));
        registry.register(Arc::new(super::anthropic::AnthropicAdapter::new()));
        registry.register(Arc::new(super::google::GoogleAdapter::new()));
        registry.register(Arc::new(super::azure::AzureAdapter::new()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.provider_tag(), adapter);
    }

    pub fn get(&self, provider_tag: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(provider_tag).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_providers_registered() {
        let registry = AdapterRegistry::with_builtin_providers();
        assert!(registry.get("openai").is_some());
        assert!(registry.get("anthropic").is_some());
        assert!(registry.get("google").is_some());
        assert!(registry.get("azure").is_some());
        assert!(registry.get("unknown").is_none());
    }
}
