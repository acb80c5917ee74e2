//! Push domain model.
//!
//! A push is an atomic update to a branch in a repository, identified by
//! before/after SHAs. Pushes are the sole input of the goal planner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Repository coordinates within a source-control workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
    /// Provider id of the source-control system hosting the repository.
    pub provider_id: String,
}

impl RepoRef {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            provider_id: provider_id.into(),
        }
    }

    /// `owner/name` form used in display and preference keys.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.name, self.provider_id)
    }
}

/// Identity of the person who performed the push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Committer {
    pub login: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A single commit carried by a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
}

/// Snapshot of a source-control push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Push {
    pub repo: RepoRef,
    pub branch: String,
    /// SHA the branch pointed at before the push. Absent on the first push
    /// to a repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    /// SHA the branch points at after the push.
    pub after: String,
    /// The repository default branch, when the provider reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub commits: Vec<CommitInfo>,
    /// Paths touched by this push, as reported by the provider. Empty when
    /// the provider did not include a diff summary.
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committer: Option<Committer>,
    pub timestamp: DateTime<Utc>,
}

impl Push {
    pub fn new(repo: RepoRef, branch: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            repo,
            branch: branch.into(),
            before: None,
            after: after.into(),
            default_branch: None,
            commits: Vec::new(),
            changed_files: Vec::new(),
            committer: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_changed_files(mut self, files: Vec<String>) -> Self {
        self.changed_files = files;
        self
    }

    pub fn with_before(mut self, sha: impl Into<String>) -> Self {
        self.before = Some(sha.into());
        self
    }

    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = Some(branch.into());
        self
    }

    pub fn with_commit(mut self, sha: impl Into<String>, message: impl Into<String>) -> Self {
        self.commits.push(CommitInfo {
            sha: sha.into(),
            message: message.into(),
        });
        self
    }

    /// Whether the push targets the repository default branch.
    ///
    /// False when the provider did not report a default branch.
    pub fn on_default_branch(&self) -> bool {
        self.default_branch
            .as_deref()
            .is_some_and(|d| d == self.branch)
    }
}

/// The push-listener invocation: a push plus the workspace coordinates the
/// evaluator and planner operate under.
#[derive(Debug, Clone)]
pub struct PushContext {
    pub push: Push,
    /// Workspace this registration runs in.
    pub workspace_id: String,
    /// This SDM's registration name; used for relevance filtering.
    pub registration: String,
}

impl PushContext {
    pub fn new(
        push: Push,
        workspace_id: impl Into<String>,
        registration: impl Into<String>,
    ) -> Self {
        Self {
            push,
            workspace_id: workspace_id.into(),
            registration: registration.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_ref_display_includes_provider() {
        let repo = RepoRef::new("octo", "widgets", "gh-1");
        assert_eq!(repo.to_string(), "octo/widgets/gh-1");
        assert_eq!(repo.slug(), "octo/widgets");
    }

    #[test]
    fn default_branch_detection() {
        let repo = RepoRef::new("octo", "widgets", "gh-1");
        let push = Push::new(repo.clone(), "main", "abc123").with_default_branch("main");
        assert!(push.on_default_branch());

        let push = Push::new(repo.clone(), "feature", "abc123").with_default_branch("main");
        assert!(!push.on_default_branch());

        // No default branch reported: never considered the default branch.
        let push = Push::new(repo, "main", "abc123");
        assert!(!push.on_default_branch());
    }

    #[test]
    fn push_serialization_uses_camel_case() {
        let repo = RepoRef::new("octo", "widgets", "gh-1");
        let push = Push::new(repo, "main", "abc").with_default_branch("main");
        let json = serde_json::to_string(&push).unwrap();
        assert!(json.contains("\"defaultBranch\""));
        assert!(json.contains("\"providerId\""));
    }
}
