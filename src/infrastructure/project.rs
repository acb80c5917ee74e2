//! Local working-tree project reader.
//!
//! Backs push-test predicates against a checked-out repository on disk:
//! the shared `/atm/home` clone inside a worker, or any local checkout in
//! tests and local mode.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::domain::models::Push;
use crate::domain::ports::{ProjectError, ProjectReader};

/// Reads a working tree rooted at a local directory.
pub struct LocalProjectReader {
    root: PathBuf,
}

impl LocalProjectReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_error(&self, push: &Push, e: impl std::fmt::Display) -> ProjectError {
        ProjectError::ReadFailed {
            repo: push.repo.to_string(),
            reason: e.to_string(),
        }
    }

    fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(".git") {
                continue;
            }
            if path.is_dir() {
                Self::walk(&path, root, out)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }

    fn all_files(&self, push: &Push) -> Result<Vec<String>, ProjectError> {
        let mut files = Vec::new();
        Self::walk(&self.root, &self.root, &mut files).map_err(|e| self.read_error(push, e))?;
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl ProjectReader for LocalProjectReader {
    async fn files_matching(
        &self,
        push: &Push,
        globs: &[String],
    ) -> Result<Vec<String>, ProjectError> {
        let patterns: Vec<glob::Pattern> = globs
            .iter()
            .map(|g| {
                glob::Pattern::new(g).map_err(|e| ProjectError::InvalidPattern {
                    pattern: g.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(self
            .all_files(push)?
            .into_iter()
            .filter(|path| patterns.iter().any(|p| p.matches(path)))
            .collect())
    }

    async fn file_content(
        &self,
        push: &Push,
        path: &str,
    ) -> Result<Option<String>, ProjectError> {
        let full = self.root.join(path);
        if !full.starts_with(&self.root) || !full.is_file() {
            return Ok(None);
        }
        std::fs::read_to_string(&full)
            .map(Some)
            .map_err(|e| self.read_error(push, e))
    }

    async fn changed_files(&self, push: &Push) -> Result<Vec<String>, ProjectError> {
        // A first push, or a push without a provider diff summary, changes
        // the whole tree.
        if push.before.is_none() || push.changed_files.is_empty() {
            return self.all_files(push);
        }
        let mut changed = push.changed_files.clone();
        changed.sort();
        changed.dedup();
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::RepoRef;

    fn fixture_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("k8s")).unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"x\"").unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join("k8s/deploy.yaml"), "kind: Deployment").unwrap();
        dir
    }

    fn push() -> Push {
        Push::new(RepoRef::new("octo", "widgets", "gh-1"), "main", "abc123")
    }

    #[tokio::test]
    async fn glob_matching_finds_files() {
        let dir = fixture_tree();
        let reader = LocalProjectReader::new(dir.path());

        let matches = reader
            .files_matching(&push(), &["**/*.yaml".to_string()])
            .await
            .unwrap();
        assert_eq!(matches, vec!["k8s/deploy.yaml".to_string()]);

        let none = reader
            .files_matching(&push(), &["*.lock".to_string()])
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn file_content_reads_existing_files() {
        let dir = fixture_tree();
        let reader = LocalProjectReader::new(dir.path());

        let content = reader.file_content(&push(), "Cargo.toml").await.unwrap();
        assert!(content.unwrap().contains("[package]"));
        assert!(reader
            .file_content(&push(), "missing.txt")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn first_push_changes_everything() {
        let dir = fixture_tree();
        let reader = LocalProjectReader::new(dir.path());

        let changed = reader.changed_files(&push()).await.unwrap();
        assert_eq!(changed.len(), 3);
        assert!(changed.contains(&"src/main.rs".to_string()));
    }

    #[tokio::test]
    async fn provider_diff_summary_wins_over_tree_walk() {
        let dir = fixture_tree();
        let reader = LocalProjectReader::new(dir.path());

        let push = push()
            .with_before("000111")
            .with_changed_files(vec!["src/main.rs".to_string(), "src/main.rs".to_string()]);
        let changed = reader.changed_files(&push).await.unwrap();
        assert_eq!(changed, vec!["src/main.rs".to_string()]);
    }

    #[tokio::test]
    async fn invalid_glob_is_an_error() {
        let dir = fixture_tree();
        let reader = LocalProjectReader::new(dir.path());
        let result = reader
            .files_matching(&push(), &["[".to_string()])
            .await;
        assert!(matches!(result, Err(ProjectError::InvalidPattern { .. })));
    }
}
