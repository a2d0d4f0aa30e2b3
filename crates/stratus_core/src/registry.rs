//! Provider registry keyed by type tag.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::resource::Provider;

/// A registry of provider implementations.
///
/// Declaring a resource looks up the provider for its type tag here.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Register a provider under its `type_tag()`.
    ///
    /// A provider already registered for the tag is replaced.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let type_tag = provider.type_tag().to_string();
        debug!("Registering provider: {}", type_tag);
        self.providers.insert(type_tag, provider);
    }

    /// Register a provider under a custom type tag.
    pub fn register_as(&mut self, type_tag: impl Into<String>, provider: Arc<dyn Provider>) {
        let type_tag = type_tag.into();
        debug!("Registering provider as: {}", type_tag);
        self.providers.insert(type_tag, provider);
    }

    pub fn get(&self, type_tag: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(type_tag).cloned()
    }

    /// Get a provider, failing with a declaration error if none is registered.
    pub fn get_required(&self, type_tag: &str) -> CoreResult<Arc<dyn Provider>> {
        self.get(type_tag).ok_or_else(|| {
            CoreError::Declaration(format!(
                "no provider registered for type '{}' (known: {})",
                type_tag,
                self.type_tags().join(", ")
            ))
        })
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.providers.contains_key(type_tag)
    }

    /// All registered type tags, sorted.
    pub fn type_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        tags.sort_unstable();
        tags
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::MockProvider;

    #[test]
    fn test_register_uses_type_tag() {
        let mut provider = MockProvider::new();
        provider
            .expect_type_tag()
            .return_const("network".to_string());

        let mut registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(provider));

        assert_eq!(registry.len(), 1);
        assert!(registry.contains("network"));
        assert_eq!(registry.type_tags(), vec!["network"]);
    }

    #[test]
    fn test_get_required_missing() {
        let mut registry = ProviderRegistry::new();
        registry.register_as("cluster", Arc::new(MockProvider::new()));

        assert!(registry.get_required("cluster").is_ok());
        registry.register_as("namespace", Arc::new(MockProvider::new()));
        let err = registry.get_required("ingress").err().unwrap();
        assert!(matches!(err, CoreError::Declaration(_)));
        assert!(err.to_string().contains("known: cluster, namespace"));
    }
}
