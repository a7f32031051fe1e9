//! Registry of the execution providers a session runs with

use indexmap::IndexMap;
use meridian_core::CPU_EXECUTION_PROVIDER;
use meridian_graph::Graph;

use crate::error::{BackendError, Result};
use crate::provider::ProviderRef;

/// Providers keyed by type, in registration order. Registration order is
/// priority order.
#[derive(Default)]
pub struct ExecutionProviders {
    providers: IndexMap<String, ProviderRef>,
}

impl ExecutionProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, provider: ProviderRef) -> Result<()> {
        let key = provider.provider_type().to_string();
        if self.providers.contains_key(&key) {
            return Err(BackendError::DuplicateProvider(key));
        }
        tracing::debug!(provider = %key, priority = self.providers.len(), "provider_registered");
        self.providers.insert(key, provider);
        Ok(())
    }

    pub fn get(&self, provider_type: &str) -> Option<&ProviderRef> {
        self.providers.get(provider_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderRef> {
        self.providers.values()
    }

    pub fn provider_types(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Bridge the boundaries of every non-host provider, in registration
    /// order. Returns whether any rewrite changed the graph.
    pub fn insert_copy_nodes(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        for (provider_type, provider) in &self.providers {
            if provider_type == CPU_EXECUTION_PROVIDER {
                continue;
            }
            changed |= provider.insert_copy_nodes(graph)?;
        }
        Ok(changed)
    }
}
