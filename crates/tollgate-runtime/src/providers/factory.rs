//! Provider factory pattern for dynamic backend registration.
//!
//! New backends register factories that build instances from JSON
//! configuration, so wiring a provider chain never requires touching an
//! enum.
//!
//! ## Usage
//!
//! ```ignore
//! let mut registry = ProviderRegistry::new();
//! registry.register(Arc::new(AnthropicProviderFactory));
//!
//! let provider = registry.create("claude", &config)?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::{Provider, ProviderError};

/// Factory for creating providers from configuration.
///
/// Each factory owns: a unique type identifier, config validation, and
/// instance construction.
pub trait ProviderFactory: Send + Sync {
    /// Unique identifier, e.g. "claude", "kimi", "europe-pmc".
    fn provider_type(&self) -> &'static str;

    /// Build a provider from JSON configuration.
    fn create(&self, config: &JsonValue) -> Result<Arc<dyn Provider>, ProviderError>;

    /// Validate configuration without building. For startup checks.
    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError>;

    /// Sensible defaults for optional fields.
    fn default_config(&self) -> JsonValue {
        serde_json::json!({})
    }

    /// Human-readable description.
    fn description(&self) -> &'static str {
        "Remote provider"
    }
}

/// Registry of available provider factories.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A factory with the same type replaces the old one.
    pub fn register(&mut self, factory: Arc<dyn ProviderFactory>) {
        self.factories
            .insert(factory.provider_type().to_string(), factory);
    }

    /// Build a provider from a type name and configuration.
    pub fn create(
        &self,
        provider_type: &str,
        config: &JsonValue,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        self.factories
            .get(provider_type)
            .ok_or_else(|| {
                ProviderError::NotConfigured(format!(
                    "Unknown provider type: '{}'. Available: {:?}",
                    provider_type,
                    self.available_types()
                ))
            })?
            .create(config)
    }

    /// Validate configuration for a provider type.
    pub fn validate(&self, provider_type: &str, config: &JsonValue) -> Result<(), ProviderError> {
        self.factories
            .get(provider_type)
            .ok_or_else(|| {
                ProviderError::NotConfigured(format!("Unknown provider type: '{}'", provider_type))
            })?
            .validate_config(config)
    }

    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_provider(&self, provider_type: &str) -> bool {
        self.factories.contains_key(provider_type)
    }

    pub fn default_config(&self, provider_type: &str) -> Option<JsonValue> {
        self.factories
            .get(provider_type)
            .map(|f| f.default_config())
    }

    /// Registry with every built-in factory the enabled features provide.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "anthropic")]
        registry.register(Arc::new(super::AnthropicProviderFactory));

        #[cfg(feature = "openai-compat")]
        {
            registry.register(Arc::new(super::OpenAiCompatFactory::KIMI));
            registry.register(Arc::new(super::OpenAiCompatFactory::QWEN));
        }

        #[cfg(feature = "europe-pmc")]
        registry.register(Arc::new(super::EuropePmcProviderFactory));

        registry
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.available_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{AttemptFailure, Invocation};
    use async_trait::async_trait;

    struct MockProvider {
        name: String,
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn invoke(
            &self,
            _operation: &str,
            _params: &JsonValue,
        ) -> Result<Invocation, AttemptFailure> {
            Ok(Invocation {
                value: serde_json::json!("mock"),
                quantity: 1,
            })
        }
    }

    struct MockProviderFactory;

    impl ProviderFactory for MockProviderFactory {
        fn provider_type(&self) -> &'static str {
            "mock"
        }

        fn create(&self, config: &JsonValue) -> Result<Arc<dyn Provider>, ProviderError> {
            let name = config["name"].as_str().unwrap_or("mock-provider").to_string();
            Ok(Arc::new(MockProvider { name }))
        }

        fn validate_config(&self, _config: &JsonValue) -> Result<(), ProviderError> {
            Ok(())
        }

        fn description(&self) -> &'static str {
            "Mock provider for testing"
        }
    }

    #[test]
    fn test_registry_register_and_create() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockProviderFactory));

        assert!(registry.has_provider("mock"));
        assert!(!registry.has_provider("unknown"));

        let config = serde_json::json!({"name": "test-mock"});
        let provider = registry.create("mock", &config).unwrap();
        assert_eq!(provider.name(), "test-mock");
    }

    #[test]
    fn test_registry_unknown_provider() {
        let registry = ProviderRegistry::new();
        let result = registry.create("unknown", &serde_json::json!({}));

        match result {
            Err(ProviderError::NotConfigured(msg)) => {
                assert!(msg.contains("Unknown provider type"));
            }
            _ => panic!("Expected NotConfigured error"),
        }
    }

    #[test]
    fn test_registry_available_types() {
        let mut registry = ProviderRegistry::new();
        assert!(registry.available_types().is_empty());

        registry.register(Arc::new(MockProviderFactory));
        assert_eq!(registry.available_types(), vec!["mock"]);
    }

    #[test]
    fn test_registry_validate() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockProviderFactory));

        assert!(registry.validate("mock", &serde_json::json!({})).is_ok());
        assert!(registry.validate("unknown", &serde_json::json!({})).is_err());
    }
}
