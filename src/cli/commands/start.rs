//! Daemon startup: assemble the delivery machine and run the event loop.
//!
//! The built-in pipeline covers the common push shapes; embedders replace
//! it through [`DeliveryMachine::builder`] with their own rules and
//! executors. Goal implementations resolve to hook scripts under
//! `.stevedore/goals/`, in the spirit of git hooks.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::domain::models::{Config, Goal, SchedulerMode};
use crate::domain::ports::{GoalStore, KubeClient};
use crate::infrastructure::kube::HttpKubeClient;
use crate::infrastructure::preferences::FilePreferences;
use crate::infrastructure::project::LocalProjectReader;
use crate::infrastructure::status::HttpStatusPublisher;
use crate::infrastructure::store::{HttpGoalStore, InMemoryGoalStore};
use crate::services::dispatcher::{ExecutionResult, GoalExecutor, GoalInvocation};
use crate::services::machine::DeliveryMachine;
use crate::services::planner::PlanRule;
use crate::services::push_test::{MaterialChange, PushTest};
use crate::services::worker::WorkerEnv;

use super::preferences_path;

/// Executes a goal by running its hook script when one exists.
struct HookScriptExecutor {
    hooks_dir: PathBuf,
}

impl HookScriptExecutor {
    fn new(hooks_dir: impl Into<PathBuf>) -> Self {
        Self {
            hooks_dir: hooks_dir.into(),
        }
    }
}

#[async_trait::async_trait]
impl GoalExecutor for HookScriptExecutor {
    async fn execute(&self, invocation: &GoalInvocation) -> Result<ExecutionResult, String> {
        let goal = &invocation.goal;
        let script = self.hooks_dir.join(format!("{}.sh", goal.unique_name));
        if !script.is_file() {
            invocation
                .progress_log
                .write(&format!("no hook script for {}; nothing to do", goal.unique_name))
                .await;
            return Ok(ExecutionResult::success()
                .with_message(format!("Complete: {} (no hook script)", goal.name)));
        }

        invocation
            .progress_log
            .write(&format!("running {}", script.display()))
            .await;

        let output = tokio::process::Command::new("sh")
            .arg(&script)
            .env("STEVEDORE_SHA", &goal.sha)
            .env("STEVEDORE_BRANCH", &goal.branch)
            .env("STEVEDORE_REPO", goal.repo.slug())
            .env("STEVEDORE_GOAL", &goal.unique_name)
            .output()
            .await
            .map_err(|e| format!("failed to run hook script: {e}"))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            invocation.progress_log.write(line).await;
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            invocation.progress_log.write(line).await;
        }

        let code = output.status.code().unwrap_or(1);
        if code == 0 {
            Ok(ExecutionResult::success())
        } else {
            Ok(ExecutionResult::failure(format!(
                "Hook script exited with code {code}"
            )))
        }
    }
}

/// The built-in pipeline: build and test on material changes, staging
/// deploy on the default branch behind the deploy-enabled flag.
fn builtin_pipeline() -> (Vec<PlanRule>, Vec<Goal>) {
    let build = Goal::new("build", "0-code")
        .with_display_name("build")
        .retryable();
    let test = Goal::new("test", "0-code")
        .with_display_name("test")
        .requires(&build)
        .retryable();
    let deploy = Goal::new("deploy-staging", "1-staging")
        .with_display_name("deploy to staging")
        .requires(&test)
        .isolate();

    let material = PushTest::IsMaterialChange(MaterialChange {
        directories: vec!["src/".to_string(), "lib/".to_string()],
        extensions: vec!["rs".to_string(), "ts".to_string(), "go".to_string()],
        files: vec!["Cargo.toml".to_string(), "package.json".to_string()],
        globs: vec![],
    });

    let rules = vec![
        PlanRule::new(
            "build-and-test",
            material,
            vec![build.clone(), test.clone()],
        ),
        PlanRule::new(
            "staging-deploy",
            PushTest::and(vec![
                PushTest::IsDefaultBranch,
                PushTest::named("deploy-enabled"),
            ]),
            vec![deploy.clone()],
        ),
    ];
    (rules, vec![build, test, deploy])
}

fn build_machine(config: Config, project_root: PathBuf) -> Result<DeliveryMachine> {
    let store: Arc<dyn GoalStore> = match HttpGoalStore::from_config(&config.store) {
        Some(http) => Arc::new(http),
        None => {
            tracing::warn!("No store.base_url configured; using the in-memory store");
            Arc::new(InMemoryGoalStore::new())
        }
    };

    let project = Arc::new(LocalProjectReader::new(project_root));
    let preferences = Arc::new(FilePreferences::new(preferences_path()));

    let (rules, goals) = builtin_pipeline();
    let executor = Arc::new(HookScriptExecutor::new(".stevedore/goals"));

    let mut builder = DeliveryMachine::builder(config.clone(), store, project)
        .with_preferences(preferences);
    for rule in rules {
        builder = builder.with_rule(rule);
    }
    for goal in &goals {
        builder = builder.with_implementation(goal, executor.clone(), vec![]);
    }
    if let Some(status) = HttpStatusPublisher::from_config(&config.status) {
        builder = builder.with_status_publisher(Arc::new(status));
    }
    if config.scheduling.mode == SchedulerMode::Kubernetes {
        let kube: Arc<dyn KubeClient> =
            Arc::new(HttpKubeClient::in_cluster().context("Failed to build cluster client")?);
        builder = builder.with_kube_client(kube);
    }

    builder.build()
}

/// `stevedore start`: run the master event loop.
pub async fn handle_start(config: Config) -> Result<()> {
    let cwd = std::env::current_dir().context("Cannot determine working directory")?;
    let machine = build_machine(config, cwd)?;
    machine.run().await;
    Ok(())
}

/// Isolated-goal worker entrypoint: fulfill exactly one goal, then exit.
pub async fn handle_isolated(config: Config, env: WorkerEnv) -> Result<i32> {
    // Workers read the repository clone the init container placed on the
    // shared home volume.
    let project_root = PathBuf::from("/atm/home");
    let project_root = if project_root.is_dir() {
        project_root
    } else {
        std::env::current_dir().context("Cannot determine working directory")?
    };

    let mut config = config;
    // The worker executes in-process regardless of the master's mode.
    config.scheduling.mode = SchedulerMode::InProcess;
    config.workspace_id = env.workspace_id.clone();
    if config.workspace_name.is_none() {
        config.workspace_name = env.workspace_name.clone();
    }

    let machine = build_machine(config, project_root)?;
    machine.run_isolated(&env).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Push, RepoRef};

    #[test]
    fn builtin_pipeline_is_acyclic_and_registered() {
        let (rules, goals) = builtin_pipeline();
        assert_eq!(rules.len(), 2);
        assert_eq!(goals.len(), 3);
        // Deploy sits downstream of test which sits downstream of build.
        let deploy = goals.iter().find(|g| g.unique_name == "deploy-staging").unwrap();
        assert_eq!(deploy.pre_conditions.len(), 1);
        assert!(deploy.isolated);
    }

    #[tokio::test]
    async fn machine_builds_with_in_memory_store() {
        let dir = tempfile::tempdir().unwrap();
        let machine = build_machine(Config::default(), dir.path().to_path_buf()).unwrap();
        // The machine accepts pushes without panicking.
        machine.observe_push(Push::new(
            RepoRef::new("octo", "widgets", "gh-1"),
            "main",
            "abc123",
        ));
        machine.drain().await;
    }
}
