//! CLI command handlers.

pub mod deploy;
pub mod goal_sets;
pub mod start;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::domain::models::Config;
use crate::domain::ports::GoalStore;
use crate::infrastructure::store::HttpGoalStore;

/// Store client for admin commands; these only make sense against the
/// external store.
pub fn admin_store(config: &Config) -> Result<Arc<dyn GoalStore>> {
    let store = HttpGoalStore::from_config(&config.store)
        .context("Admin commands require store.base_url to be configured")?;
    Ok(Arc::new(store))
}

/// Default path of the file-backed preferences store.
pub fn preferences_path() -> std::path::PathBuf {
    std::path::PathBuf::from(".stevedore/preferences.json")
}
