use std::path::PathBuf;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::safepath::{self, PathError};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid source path: {0}")]
    Path(#[from] PathError),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("source does not support revision diffs")]
    VersionedDiffUnsupported,
}

/// What happened to a file, as classified by the source or the diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
    Renamed,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub path: String,
    pub hash: String,
    pub blob: bool,
}

/// One entry of a revision-to-revision diff. `previous_path` is set on
/// renames only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedChange {
    pub action: ChangeAction,
    pub path: String,
    pub previous_path: Option<String>,
}

#[async_trait]
pub trait Source: Send + Sync {
    /// Whether the source can answer `compare_revisions`.
    fn versioned(&self) -> bool;

    async fn latest_rev(&self) -> Result<String, SourceError>;

    async fn list_tree(&self, rev: Option<&str>) -> Result<Vec<SourceEntry>, SourceError>;

    async fn compare_revisions(
        &self,
        previous: &str,
        current: &str,
    ) -> Result<Vec<VersionedChange>, SourceError>;

    async fn read_file(&self, path: &str, rev: Option<&str>) -> Result<Vec<u8>, SourceError>;
}

pub(crate) fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// A plain directory on disk, e.g. a checkout kept current by an external
/// puller. It has no revision history of its own; `latest_rev` is a hash over
/// the listing, which is enough to tell whether anything changed.
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn absolute_path(&self, rel: &str) -> Result<PathBuf, SourceError> {
        safepath::validate(rel)?;
        let mut out = self.root.clone();
        for segment in safepath::split(rel) {
            out.push(segment);
        }
        Ok(out)
    }
}

#[async_trait]
impl Source for LocalSource {
    fn versioned(&self) -> bool {
        false
    }

    async fn latest_rev(&self) -> Result<String, SourceError> {
        let entries = self.list_tree(None).await?;
        let mut hasher = Sha256::new();
        for entry in &entries {
            hasher.update(entry.path.as_bytes());
            hasher.update(b":");
            hasher.update(entry.hash.as_bytes());
            hasher.update(b"\n");
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    async fn list_tree(&self, _rev: Option<&str>) -> Result<Vec<SourceEntry>, SourceError> {
        let mut entries = Vec::new();
        let mut pending: Vec<String> = vec![String::new()];
        while let Some(dir) = pending.pop() {
            let mut abs = self.root.clone();
            for segment in safepath::split(&dir) {
                abs.push(segment);
            }
            let mut read_dir = tokio::fs::read_dir(&abs).await?;
            while let Some(dirent) = read_dir.next_entry().await? {
                let name = dirent.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                let file_type = dirent.file_type().await?;
                if file_type.is_dir() {
                    let Ok(rel) = safepath::join(&dir, &format!("{name}/")) else {
                        continue;
                    };
                    entries.push(SourceEntry {
                        path: rel.clone(),
                        hash: String::new(),
                        blob: false,
                    });
                    pending.push(rel);
                } else if file_type.is_file() {
                    let Ok(rel) = safepath::join(&dir, name) else {
                        continue;
                    };
                    let bytes = tokio::fs::read(dirent.path()).await?;
                    entries.push(SourceEntry {
                        path: rel,
                        hash: content_hash(&bytes),
                        blob: true,
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn compare_revisions(
        &self,
        _previous: &str,
        _current: &str,
    ) -> Result<Vec<VersionedChange>, SourceError> {
        Err(SourceError::VersionedDiffUnsupported)
    }

    async fn read_file(&self, path: &str, _rev: Option<&str>) -> Result<Vec<u8>, SourceError> {
        let abs = self.absolute_path(path)?;
        match tokio::fs::read(&abs).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SourceError::NotFound(path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sample_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/sub")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("a/b.json"), b"{\"kind\":\"report\"}").unwrap();
        fs::write(dir.path().join("a/sub/c.json"), b"{}").unwrap();
        fs::write(dir.path().join("a/notes.txt"), b"plain").unwrap();
        fs::write(dir.path().join(".git/config"), b"secret").unwrap();
        dir
    }

    #[tokio::test]
    async fn lists_tree_with_hashes_and_skips_hidden() {
        let dir = sample_tree();
        let source = LocalSource::new(dir.path());
        let entries = source.list_tree(None).await.unwrap();

        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["a/", "a/b.json", "a/notes.txt", "a/sub/", "a/sub/c.json"]
        );
        let blob = entries.iter().find(|e| e.path == "a/b.json").unwrap();
        assert!(blob.blob);
        assert_eq!(blob.hash, content_hash(b"{\"kind\":\"report\"}"));
        let folder = entries.iter().find(|e| e.path == "a/").unwrap();
        assert!(!folder.blob);
        assert!(folder.hash.is_empty());
    }

    #[tokio::test]
    async fn latest_rev_tracks_content() {
        let dir = sample_tree();
        let source = LocalSource::new(dir.path());
        let first = source.latest_rev().await.unwrap();
        let again = source.latest_rev().await.unwrap();
        assert_eq!(first, again);

        fs::write(dir.path().join("a/b.json"), b"{\"kind\":\"chart\"}").unwrap();
        let changed = source.latest_rev().await.unwrap();
        assert_ne!(first, changed);
    }

    #[tokio::test]
    async fn read_file_round_trips_and_rejects_traversal() {
        let dir = sample_tree();
        let source = LocalSource::new(dir.path());

        let bytes = source.read_file("a/b.json", None).await.unwrap();
        assert_eq!(bytes, b"{\"kind\":\"report\"}");

        assert!(matches!(
            source.read_file("missing.json", None).await,
            Err(SourceError::NotFound(_))
        ));
        assert!(matches!(
            source.read_file("../escape.json", None).await,
            Err(SourceError::Path(PathError::Traversal))
        ));
        assert!(matches!(
            source.read_file(".git/config", None).await,
            Err(SourceError::Path(PathError::Hidden))
        ));
    }

    #[tokio::test]
    async fn revision_diffs_are_unsupported() {
        let dir = sample_tree();
        let source = LocalSource::new(dir.path());
        assert!(!source.versioned());
        assert!(matches!(
            source.compare_revisions("a", "b").await,
            Err(SourceError::VersionedDiffUnsupported)
        ));
    }
}
