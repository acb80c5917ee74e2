//! Resource provider registry port.
//!
//! Workspaces declare resource providers (artifact stores, clusters,
//! registries); the `hasResourceProvider` push test queries this registry.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::ResourceProviderConfig;

/// Registry lookup errors.
#[derive(Debug, Error)]
pub enum ResourceProviderError {
    #[error("Resource provider lookup failed: {0}")]
    LookupFailed(String),
}

/// Lookup of resource providers configured for the workspace.
#[async_trait]
pub trait ResourceProviderRegistry: Send + Sync {
    /// Whether a provider of `provider_type` (and, when given, `name`)
    /// exists in the workspace.
    async fn has_provider(
        &self,
        provider_type: &str,
        name: Option<&str>,
    ) -> Result<bool, ResourceProviderError>;
}

/// Registry backed by static configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredProviders {
    providers: Vec<ResourceProviderConfig>,
}

impl ConfiguredProviders {
    pub fn new(providers: Vec<ResourceProviderConfig>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl ResourceProviderRegistry for ConfiguredProviders {
    async fn has_provider(
        &self,
        provider_type: &str,
        name: Option<&str>,
    ) -> Result<bool, ResourceProviderError> {
        Ok(self.providers.iter().any(|p| {
            p.provider_type == provider_type
                && name.is_none_or(|n| p.name.as_deref() == Some(n))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_by_type_and_name() {
        let registry = ConfiguredProviders::new(vec![ResourceProviderConfig {
            provider_type: "KubernetesClusterProvider".to_string(),
            name: Some("prod".to_string()),
        }]);

        assert!(registry
            .has_provider("KubernetesClusterProvider", None)
            .await
            .unwrap());
        assert!(registry
            .has_provider("KubernetesClusterProvider", Some("prod"))
            .await
            .unwrap());
        assert!(!registry
            .has_provider("KubernetesClusterProvider", Some("staging"))
            .await
            .unwrap());
        assert!(!registry.has_provider("DockerRegistry", None).await.unwrap());
    }
}
