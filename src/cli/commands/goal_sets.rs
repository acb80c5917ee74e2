//! Goal set admin commands: list and cancel.

use std::sync::Arc;

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, Cell, Table};

use crate::domain::models::Config;
use crate::services::cancellation::GoalSetCancellation;
use crate::services::event_bus::EventBus;
use crate::services::state_engine::GoalUpdater;

use super::admin_store;

fn cancellation(config: &Config) -> Result<GoalSetCancellation> {
    let store = admin_store(config)?;
    let bus = Arc::new(EventBus::default());
    let updater = Arc::new(GoalUpdater::new(
        store.clone(),
        bus,
        config.registration.clone(),
        config.version.clone(),
        config.workspace_id.clone(),
    ));
    Ok(GoalSetCancellation::new(store, updater))
}

/// `stevedore goal-sets list`
pub async fn handle_list(config: &Config, json: bool) -> Result<()> {
    let service = cancellation(config)?;
    let pending = service.list_pending().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
        return Ok(());
    }

    if pending.is_empty() {
        println!("No pending goal sets for {}", config.registration);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Goal Set", "Repository", "Branch", "SHA", "Goals", "State"]);
    for set in &pending {
        let sha_short: String = set.sha.chars().take(7).collect();
        table.add_row(vec![
            Cell::new(&set.goal_set_id),
            Cell::new(set.repo.slug()),
            Cell::new(&set.branch),
            Cell::new(sha_short),
            Cell::new(set.goals.len()),
            Cell::new(set.derived_state().to_string()),
        ]);
    }
    println!("{table}");
    Ok(())
}

/// `stevedore goal-sets cancel [--id <id> | --all]`
pub async fn handle_cancel(
    config: &Config,
    id: Option<String>,
    all: bool,
    json: bool,
) -> Result<()> {
    let service = cancellation(config)?;

    let outcomes = if all {
        service.cancel_all().await?
    } else if let Some(id) = id {
        vec![service.cancel(&id).await?]
    } else {
        anyhow::bail!("Specify --id <goal-set-id> or --all");
    };

    if json {
        let rendered: Vec<serde_json::Value> = outcomes
            .iter()
            .map(|o| {
                serde_json::json!({
                    "goalSetId": o.goal_set_id,
                    "goalsCanceled": o.goals_canceled,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rendered)?);
        return Ok(());
    }

    for outcome in &outcomes {
        println!(
            "Canceled goal set {} ({} goals moved to canceled)",
            outcome.goal_set_id, outcome.goals_canceled
        );
    }
    if outcomes.is_empty() {
        println!("Nothing to cancel");
    }
    Ok(())
}
