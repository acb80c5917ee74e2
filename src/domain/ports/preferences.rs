//! Preferences store port.
//!
//! Scoped key/value preferences, e.g. the per-repo deploy enablement flag
//! toggled from the admin surface.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Preference access errors.
#[derive(Debug, Error)]
pub enum PreferencesError {
    #[error("Preference access failed: {0}")]
    AccessFailed(String),
}

/// Scoped key/value preferences.
#[async_trait]
pub trait PreferencesStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, PreferencesError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), PreferencesError>;
}

/// Key of the per-repo deploy enablement flag.
pub fn deploy_enabled_key(repo_slug: &str) -> String {
    format!("deploy-enabled/{repo_slug}")
}

/// In-memory preferences store for tests and local mode.
#[derive(Debug, Default)]
pub struct InMemoryPreferences {
    values: RwLock<HashMap<String, String>>,
}

impl InMemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferencesStore for InMemoryPreferences {
    async fn get(&self, key: &str) -> Result<Option<String>, PreferencesError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), PreferencesError> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trip() {
        let prefs = InMemoryPreferences::new();
        let key = deploy_enabled_key("octo/widgets");
        assert!(prefs.get(&key).await.unwrap().is_none());
        prefs.put(&key, "true").await.unwrap();
        assert_eq!(prefs.get(&key).await.unwrap().as_deref(), Some("true"));
    }
}
