//! Per-repository deploy enablement commands.

use anyhow::Result;

use crate::domain::ports::{deploy_enabled_key, PreferencesStore};
use crate::infrastructure::preferences::FilePreferences;

use super::preferences_path;

async fn set_flag(repo: &str, enabled: bool, json: bool) -> Result<()> {
    anyhow::ensure!(
        repo.split('/').count() == 2,
        "Repository must be given as owner/name"
    );

    let prefs = FilePreferences::new(preferences_path());
    prefs
        .put(&deploy_enabled_key(repo), if enabled { "true" } else { "false" })
        .await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "repo": repo, "deployEnabled": enabled })
        );
    } else if enabled {
        println!("Deploy goals enabled for {repo}");
    } else {
        println!("Deploy goals disabled for {repo}");
    }
    Ok(())
}

/// `stevedore deploy enable <owner/name>`
pub async fn handle_enable(repo: &str, json: bool) -> Result<()> {
    set_flag(repo, true, json).await
}

/// `stevedore deploy disable <owner/name>`
pub async fn handle_disable(repo: &str, json: bool) -> Result<()> {
    set_flag(repo, false, json).await
}
