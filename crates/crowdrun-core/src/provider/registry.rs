//! Provider registry: crowd-provider implementations keyed by type tag.

use std::collections::HashMap;
use std::sync::Arc;

use super::CrowdProvider;

/// A collection of registered [`CrowdProvider`]s, keyed by
/// [`CrowdProvider::provider_type`].
///
/// Providers are handed out as `Arc`s because every live task run holds
/// on to its provider.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn CrowdProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing (and returning) any provider of the
    /// same type.
    pub fn register(&mut self, provider: impl CrowdProvider + 'static) -> Option<Arc<dyn CrowdProvider>> {
        self.register_shared(Arc::new(provider))
    }

    /// Register a provider the caller keeps a handle to.
    pub fn register_shared(
        &mut self,
        provider: Arc<dyn CrowdProvider>,
    ) -> Option<Arc<dyn CrowdProvider>> {
        let provider_type = provider.provider_type().to_owned();
        self.providers.insert(provider_type, provider)
    }

    pub fn get(&self, provider_type: &str) -> Option<Arc<dyn CrowdProvider>> {
        self.providers.get(provider_type).cloned()
    }

    /// Registered type tags, in no particular order.
    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
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
    use crate::provider::MockProvider;
    use anyhow::Result;
    use async_trait::async_trait;
    use crowdrun_db::models::{Agent as AgentRecord, Unit, Worker};

    struct Named(&'static str);

    #[async_trait]
    impl CrowdProvider for Named {
        fn provider_type(&self) -> &str {
            self.0
        }
        async fn launch_unit(&self, _unit: &Unit, _task_url: &str) -> Result<()> {
            Ok(())
        }
        async fn expire_unit(&self, _unit: &Unit) -> Result<()> {
            Ok(())
        }
        async fn block_worker(&self, _worker: &Worker, _reason: &str) -> Result<()> {
            Ok(())
        }
        async fn unblock_worker(&self, _worker: &Worker, _reason: &str) -> Result<()> {
            Ok(())
        }
        async fn approve_work(&self, _agent: &AgentRecord) -> Result<()> {
            Ok(())
        }
        async fn reject_work(&self, _agent: &AgentRecord, _reason: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn starts_empty() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get("mock").is_none());
    }

    #[test]
    fn register_and_get() {
        let mut registry = ProviderRegistry::new();
        assert!(registry.register(MockProvider::new()).is_none());
        let provider = registry.get("mock").unwrap();
        assert_eq!(provider.provider_type(), "mock");
    }

    #[test]
    fn register_replaces_same_type() {
        let mut registry = ProviderRegistry::new();
        registry.register(Named("sandbox"));
        let old = registry.register(Named("sandbox"));
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn shared_handle_is_the_registered_one() {
        let mut registry = ProviderRegistry::new();
        let mock = Arc::new(MockProvider::new());
        registry.register_shared(mock.clone());
        assert_eq!(Arc::strong_count(&mock), 2);
        let _looked_up = registry.get("mock").unwrap();
        assert_eq!(Arc::strong_count(&mock), 3);
    }

    #[test]
    fn list_and_debug_show_types() {
        let mut registry = ProviderRegistry::new();
        registry.register(Named("alpha"));
        registry.register(Named("beta"));
        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert!(format!("{registry:?}").contains("alpha"));
    }
}
