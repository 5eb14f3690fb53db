//! Provider side of file distribution: a registry of shippable paths.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::FileProviderError;
use crate::files::archive::zip_directory;
use crate::files::version::{FilePayload, FileVersionId, last_modified};

/// Source of file content for the client-side cache.
#[async_trait]
pub trait FileProvider: Send + Sync {
    /// Fetch the current content behind `version.id`.
    async fn fetch(&self, version: &FileVersionId) -> Result<FilePayload, FileProviderError>;
}

#[derive(Default)]
struct Registry {
    by_path: HashMap<PathBuf, String>,
    by_handle: HashMap<String, PathBuf>,
}

/// Maps opaque handles to absolute source paths. Entries live for the
/// lifetime of the server.
#[derive(Default)]
pub struct FileServer {
    registry: Mutex<Registry>,
}

impl FileServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `path` for distribution and return its current version.
    ///
    /// Registering the same path again yields the same handle. Fails fast
    /// when the source does not exist or cannot be read.
    pub fn register_file(&self, path: &Path) -> Result<FileVersionId, FileProviderError> {
        let absolute = path.canonicalize().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FileProviderError::NotFound(path.to_path_buf()),
            _ => FileProviderError::Unreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            },
        })?;
        check_readable(&absolute)?;
        let version = last_modified(&absolute)?;

        let mut registry = self.registry.lock();
        let handle = match registry.by_path.get(&absolute) {
            Some(handle) => handle.clone(),
            None => {
                let handle = Uuid::new_v4().to_string();
                registry.by_path.insert(absolute.clone(), handle.clone());
                registry.by_handle.insert(handle.clone(), absolute.clone());
                tracing::info!(handle = %handle, path = %absolute.display(), "Registered file");
                handle
            }
        };

        Ok(FileVersionId::new(handle, version))
    }

    /// Source path registered under `handle`.
    pub fn registered_path(&self, handle: &str) -> Option<PathBuf> {
        self.registry.lock().by_handle.get(handle).cloned()
    }

    /// Raw bytes of a file, or a zip archive for a directory.
    pub async fn get_content(&self, handle: &str) -> Result<FilePayload, FileProviderError> {
        let path = self
            .registered_path(handle)
            .ok_or_else(|| FileProviderError::UnknownHandle(handle.to_string()))?;

        tokio::task::spawn_blocking(move || read_payload(&path))
            .await
            .map_err(|e| FileProviderError::Transfer {
                content_id: handle.to_string(),
                reason: e.to_string(),
            })?
    }
}

#[async_trait]
impl FileProvider for FileServer {
    async fn fetch(&self, version: &FileVersionId) -> Result<FilePayload, FileProviderError> {
        self.get_content(&version.id).await
    }
}

fn check_readable(path: &Path) -> Result<(), FileProviderError> {
    let result = if path.is_dir() {
        std::fs::read_dir(path).map(|_| ())
    } else {
        std::fs::File::open(path).map(|_| ())
    };
    result.map_err(|e| FileProviderError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn read_payload(path: &Path) -> Result<FilePayload, FileProviderError> {
    if !path.exists() {
        return Err(FileProviderError::NotFound(path.to_path_buf()));
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let is_directory = path.is_dir();
    let bytes = if is_directory {
        zip_directory(path)?
    } else {
        std::fs::read(path)?
    };
    Ok(FilePayload {
        name,
        is_directory,
        bytes,
    })
}
