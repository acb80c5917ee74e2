//! Filesystem artifact cache.
//!
//! Stores gzip-compressed tar archives at
//! `<root>/<classifier>/<sha>-cache.tar.gz` so goals can reuse build
//! outputs across processes (master and isolated workers share the root).

use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::domain::models::CacheConfig;

/// Cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("No cache entry for {classifier}/{sha}")]
    Miss { classifier: String, sha: String },
}

/// Filesystem-backed artifact cache.
pub struct FileSystemCache {
    root: PathBuf,
}

impl FileSystemCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        config.enabled.then(|| Self::new(config.root.clone()))
    }

    /// Archive path for a `(classifier, sha)` pair.
    pub fn archive_path(&self, classifier: &str, sha: &str) -> PathBuf {
        self.root.join(classifier).join(format!("{sha}-cache.tar.gz"))
    }

    /// Archive `source` under the classifier for this SHA.
    pub fn store(&self, classifier: &str, sha: &str, source: &Path) -> Result<(), CacheError> {
        let archive = self.archive_path(classifier, sha);
        if let Some(parent) = archive.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::File::create(&archive)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", source)?;
        builder.into_inner()?.finish()?;

        tracing::debug!(classifier, sha, path = %archive.display(), "Stored cache archive");
        Ok(())
    }

    /// Extract the cached archive into `target`.
    pub fn retrieve(&self, classifier: &str, sha: &str, target: &Path) -> Result<(), CacheError> {
        let path = self.archive_path(classifier, sha);
        if !path.is_file() {
            return Err(CacheError::Miss {
                classifier: classifier.to_string(),
                sha: sha.to_string(),
            });
        }

        let file = std::fs::File::open(&path)?;
        let decoder = GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        std::fs::create_dir_all(target)?;
        archive.unpack(target)?;
        Ok(())
    }

    /// Remove the cache entry, if present.
    pub fn remove(&self, classifier: &str, sha: &str) -> Result<bool, CacheError> {
        let path = self.archive_path(classifier, sha);
        if path.is_file() {
            std::fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
