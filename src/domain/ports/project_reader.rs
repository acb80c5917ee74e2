//! Working-tree access port for push-test predicates.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::Push;

/// Project access errors.
///
/// Transient I/O failures surface as errors, never as a `false` predicate
/// result; the planner retries the whole evaluation.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("Failed to read project for {repo}: {reason}")]
    ReadFailed { repo: String, reason: String },

    #[error("Invalid glob pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Read-only view of the working tree and change set of a push.
#[async_trait]
pub trait ProjectReader: Send + Sync {
    /// Paths in the working tree matching any of the glob patterns.
    async fn files_matching(
        &self,
        push: &Push,
        globs: &[String],
    ) -> Result<Vec<String>, ProjectError>;

    /// Content of one file, or `None` when it does not exist.
    async fn file_content(&self, push: &Push, path: &str)
        -> Result<Option<String>, ProjectError>;

    /// Paths changed between `before` and `after`. An absent `before`
    /// (first push) yields every path in the tree.
    async fn changed_files(&self, push: &Push) -> Result<Vec<String>, ProjectError>;
}
