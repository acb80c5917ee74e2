//! In-memory goal/job store.
//!
//! Backs tests and local mode. Mirrors the external store contract:
//! last-writer-wins upserts keyed by `(goalSetId, environment, uniqueName)`.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::models::{
    GoalEvent, GoalRef, GoalSet, GoalSetState, Job, JobTaskState, RepoRef,
};
use crate::domain::ports::{GoalStore, StoreError};

#[derive(Default)]
struct Inner {
    /// `(goal_set_id, env/unique_name)` → latest goal event.
    goals: HashMap<(String, String), GoalEvent>,
    /// `goal_set_id` → set record (goals list maintained from `goals`).
    sets: HashMap<String, GoalSet>,
    jobs: HashMap<String, Job>,
}

/// In-memory implementation of [`GoalStore`].
#[derive(Default)]
pub struct InMemoryGoalStore {
    inner: RwLock<Inner>,
}

impl InMemoryGoalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn goal_key(goal_set_id: &str, key: &GoalRef) -> (String, String) {
        (goal_set_id.to_string(), key.to_string())
    }

    /// Snapshot of every job, for assertions in tests.
    pub async fn jobs(&self) -> Vec<Job> {
        self.inner.read().await.jobs.values().cloned().collect()
    }

    fn set_with_goals(inner: &Inner, set: &GoalSet) -> GoalSet {
        let mut set = set.clone();
        set.goals = inner
            .goals
            .iter()
            .filter(|((sid, _), _)| *sid == set.goal_set_id)
            .map(|(_, g)| g.clone())
            .collect();
        // Deterministic order for callers and tests.
        set.goals.sort_by(|a, b| a.key().cmp(&b.key()));
        set
    }
}

#[async_trait]
impl GoalStore for InMemoryGoalStore {
    async fn goal_event(
        &self,
        goal_set_id: &str,
        key: &GoalRef,
    ) -> Result<Option<GoalEvent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.goals.get(&Self::goal_key(goal_set_id, key)).cloned())
    }

    async fn goal_set(&self, sha: &str, goal_set_id: &str) -> Result<Option<GoalSet>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sets
            .get(goal_set_id)
            .filter(|s| s.sha == sha)
            .map(|s| Self::set_with_goals(&inner, s)))
    }

    async fn goal_set_by_id(&self, goal_set_id: &str) -> Result<Option<GoalSet>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sets
            .get(goal_set_id)
            .map(|s| Self::set_with_goals(&inner, s)))
    }

    async fn pending_goal_sets(&self, registration: &str) -> Result<Vec<GoalSet>, StoreError> {
        let inner = self.inner.read().await;
        let mut sets: Vec<GoalSet> = inner
            .sets
            .values()
            .map(|s| Self::set_with_goals(&inner, s))
            .filter(|s| {
                s.derived_state() == GoalSetState::Pending
                    && s.goals
                        .iter()
                        .any(|g| g.provenance.iter().any(|p| p.registration == registration))
            })
            .collect();
        sets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sets)
    }

    async fn goals_for_sha(
        &self,
        repo: &RepoRef,
        sha: &str,
    ) -> Result<Vec<GoalEvent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .goals
            .values()
            .filter(|g| g.sha == sha && g.repo == *repo)
            .cloned()
            .collect())
    }

    async fn update_goal(&self, event: &GoalEvent) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .goals
            .insert(Self::goal_key(&event.goal_set_id, &event.key()), event.clone());
        Ok(())
    }

    async fn store_goal_set(&self, set: &GoalSet) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.sets.insert(set.goal_set_id.clone(), set.clone());
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.jobs.insert(job.name.clone(), job.clone());
        Ok(())
    }

    async fn job(&self, name: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.read().await.jobs.get(name).cloned())
    }

    async fn set_job_task_state(
        &self,
        job_name: &str,
        task_name: &str,
        state: JobTaskState,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_name)
            .ok_or_else(|| StoreError::GoalSetNotFound(job_name.to_string()))?;
        if let Some(task) = job.tasks.iter_mut().find(|t| t.name == task_name) {
            task.state = state;
            task.message = Some(message.to_string());
        }
        Ok(())
    }
}
