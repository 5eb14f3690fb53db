//! Descriptors: stable identity plus a recipe for building a loading unit.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::error::ContextBuildError;
use crate::files::{FileManagerClient, FileVersion, FileVersionId};
use crate::loader::unit::LoadingUnit;

/// Describes one child context of the code-context tree.
#[async_trait]
pub trait ContextDescriptor: Send + Sync {
    /// Key of the child context under its parent.
    fn id(&self) -> &str;

    /// Whether a cached unit for this id is stale regardless of version.
    fn requires_reload(&self) -> bool;

    /// Version of the backing artifact, if it has one.
    ///
    /// A context built from an older version is rebuilt.
    fn version(&self) -> Option<i64> {
        None
    }

    /// Build a fresh unit below `parent`.
    async fn build(&self, parent: Arc<LoadingUnit>) -> Result<LoadingUnit, ContextBuildError>;
}

/// A context backed by a distributed file or directory.
///
/// The artifact is resolved through the file cache on construction. The
/// context is rebuilt when the resolved version is newer than the one it
/// was built from.
#[derive(Debug, Clone)]
pub struct RemoteArtifactDescriptor {
    file: FileVersion,
}

impl RemoteArtifactDescriptor {
    pub async fn fetch(
        client: &FileManagerClient,
        version: &FileVersionId,
    ) -> Result<Self, ContextBuildError> {
        let file = client
            .request_file_version(version)
            .await
            .map_err(|source| ContextBuildError::Artifact {
                id: version.id.clone(),
                source,
            })?;
        Ok(Self { file })
    }

    pub fn file(&self) -> &FileVersion {
        &self.file
    }
}

#[async_trait]
impl ContextDescriptor for RemoteArtifactDescriptor {
    fn id(&self) -> &str {
        &self.file.version_id.id
    }

    fn requires_reload(&self) -> bool {
        false
    }

    fn version(&self) -> Option<i64> {
        Some(self.file.version_id.version)
    }

    async fn build(&self, parent: Arc<LoadingUnit>) -> Result<LoadingUnit, ContextBuildError> {
        if !self.file.file.exists() {
            return Err(ContextBuildError::Build {
                id: self.id().to_string(),
                reason: format!("artifact {} is missing", self.file.file.display()),
            });
        }
        tracing::debug!(context = %self.id(), version = self.file.version_id.version, "Building artifact context");
        Ok(LoadingUnit::child(
            self.id(),
            parent,
            vec![self.file.file.clone()],
        ))
    }
}

/// A context whose roots are the entries of a local folder. Never reloads.
#[derive(Debug, Clone)]
pub struct LocalFolderDescriptor {
    id: String,
    folder: PathBuf,
}

impl LocalFolderDescriptor {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        let folder = folder.into();
        Self {
            id: folder.to_string_lossy().into_owned(),
            folder,
        }
    }
}

#[async_trait]
impl ContextDescriptor for LocalFolderDescriptor {
    fn id(&self) -> &str {
        &self.id
    }

    fn requires_reload(&self) -> bool {
        false
    }

    async fn build(&self, parent: Arc<LoadingUnit>) -> Result<LoadingUnit, ContextBuildError> {
        if !self.folder.is_dir() {
            return Err(ContextBuildError::Build {
                id: self.id.clone(),
                reason: format!("{} is not a directory", self.folder.display()),
            });
        }

        let mut roots = vec![self.folder.clone()];
        for entry in WalkDir::new(&self.folder)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file() {
                roots.push(entry.into_path());
            }
        }
        Ok(LoadingUnit::child(self.id.clone(), parent, roots))
    }
}
