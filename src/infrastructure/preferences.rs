//! File-backed preferences store.
//!
//! Persists scoped key/value preferences (deploy enablement flags) as a
//! JSON document so admin commands and the daemon share state across
//! processes.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::domain::ports::{PreferencesError, PreferencesStore};

/// Preferences persisted to a JSON file.
pub struct FilePreferences {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>, PreferencesError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| PreferencesError::AccessFailed(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(PreferencesError::AccessFailed(e.to_string())),
        }
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<(), PreferencesError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PreferencesError::AccessFailed(e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(map)
            .map_err(|e| PreferencesError::AccessFailed(e.to_string()))?;
        std::fs::write(&self.path, content)
            .map_err(|e| PreferencesError::AccessFailed(e.to_string()))
    }
}

#[async_trait]
impl PreferencesStore for FilePreferences {
    async fn get(&self, key: &str) -> Result<Option<String>, PreferencesError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_map()?.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), PreferencesError> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::deploy_enabled_key;

    #[tokio::test]
    async fn values_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.json");

        let prefs = FilePreferences::new(&path);
        let key = deploy_enabled_key("octo/widgets");
        prefs.put(&key, "true").await.unwrap();

        let reopened = FilePreferences::new(&path);
        assert_eq!(reopened.get(&key).await.unwrap().as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = FilePreferences::new(dir.path().join("nope.json"));
        assert!(prefs.get("anything").await.unwrap().is_none());
    }
}
