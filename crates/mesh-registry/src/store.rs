//! Artifact stores
//!
//! An artifact store holds deployable service archives named
//! `group_name-version.tar.gz`. The registry only needs listing and
//! copying; anything fancier lives behind the trait.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use crate::error::Result;

/// Source of deployable service artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync + fmt::Debug {
    /// Name of this store, used in logs and for equality
    fn name(&self) -> &str;

    /// File names of all artifacts currently present
    async fn list(&self) -> Result<Vec<String>>;

    /// Whether the named artifact exists
    async fn exists(&self, artifact: &str) -> Result<bool>;

    /// Copy the named artifact to a local path
    async fn copy_to(&self, artifact: &str, destination: &Path) -> Result<()>;

    /// Delete the named artifact; `false` when it was not there
    async fn remove(&self, artifact: &str) -> Result<bool>;
}

/// Artifact store backed by a local directory
#[derive(Debug)]
pub struct FsArtifactStore {
    name: String,
    root: PathBuf,
}

impl FsArtifactStore {
    /// Open a directory as an artifact store, creating it when missing
    pub async fn open(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        async_fs::create_dir_all(&root).await?;
        Ok(Self {
            name: name.into(),
            root,
        })
    }

    /// Directory this store reads from
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, artifact: &str) -> PathBuf {
        self.root.join(artifact)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = async_fs::read_dir(&self.root).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            let file_type = entry.file_type().await?;
            if !file_type.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn exists(&self, artifact: &str) -> Result<bool> {
        Ok(async_fs::metadata(self.path_of(artifact)).await.is_ok())
    }

    async fn copy_to(&self, artifact: &str, destination: &Path) -> Result<()> {
        let source = self.path_of(artifact);
        debug!("Copying artifact {} to {}", source.display(), destination.display());
        async_fs::copy(&source, destination).await?;
        Ok(())
    }

    async fn remove(&self, artifact: &str) -> Result<bool> {
        let path = self.path_of(artifact);
        match async_fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed artifact {}", path.display());
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Reference to one artifact within a store
#[derive(Clone)]
pub struct ArtifactRef {
    /// Store the artifact lives in
    pub store: Arc<dyn ArtifactStore>,
    /// File name within the store
    pub name: String,
}

impl ArtifactRef {
    /// Create a reference to `name` inside `store`
    pub fn new(store: Arc<dyn ArtifactStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }
}

impl PartialEq for ArtifactRef {
    fn eq(&self, other: &Self) -> bool {
        self.store.name() == other.store.name() && self.name == other.name
    }
}

impl Eq for ArtifactRef {}

impl fmt::Debug for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.store.name(), self.name)
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.store.name(), self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[smol_potat::test]
    async fn lists_only_archives() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("metrics-1.2.tar.gz"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let store = FsArtifactStore::open("artifacts", dir.path()).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["metrics-1.2.tar.gz"]);
        assert!(store.exists("metrics-1.2.tar.gz").await.unwrap());
        assert!(!store.exists("missing.tar.gz").await.unwrap());
    }

    #[smol_potat::test]
    async fn copies_artifacts_out() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("metrics-1.2.tar.gz"), b"payload").unwrap();
        let store = FsArtifactStore::open("artifacts", dir.path()).await.unwrap();

        let dest_dir = tempfile::tempdir().unwrap();
        let dest = dest_dir.path().join("metrics-1.2.tar.gz");
        store.copy_to("metrics-1.2.tar.gz", &dest).await.unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"payload");
    }

    #[smol_potat::test]
    async fn removes_artifacts_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("metrics-1.2.tar.gz"), b"x").unwrap();
        let store = FsArtifactStore::open("artifacts", dir.path()).await.unwrap();

        assert!(store.remove("metrics-1.2.tar.gz").await.unwrap());
        assert!(!store.exists("metrics-1.2.tar.gz").await.unwrap());
        assert!(!store.remove("metrics-1.2.tar.gz").await.unwrap());
    }
}
