//! Consumer side of file distribution: a versioned local cache.
//!
//! Each content id has its own async lock, created atomically on first use,
//! so the check/fetch/update sequence is serialized per id while unrelated
//! ids proceed in parallel. Fetched content is written to a temporary
//! directory and renamed into place, so a reader never sees a partial file.
//! A published version directory is never replaced or removed; superseded
//! versions are left on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::FileProviderError;
use crate::files::archive::unzip_into;
use crate::files::server::FileProvider;
use crate::files::version::{FilePayload, FileVersion, FileVersionId};

type Entry = Arc<tokio::sync::Mutex<Option<FileVersion>>>;

/// Client-side cache of distributed files.
pub struct FileManagerClient {
    cache_dir: PathBuf,
    provider: Arc<dyn FileProvider>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl FileManagerClient {
    pub fn new(cache_dir: impl Into<PathBuf>, provider: Arc<dyn FileProvider>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            provider,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Resolve `requested` to a local file, fetching it only when the cache
    /// holds nothing for the id or an older version.
    pub async fn request_file_version(
        &self,
        requested: &FileVersionId,
    ) -> Result<FileVersion, FileProviderError> {
        let entry = self.entry(&requested.id);
        let mut cached = entry.lock().await;

        if let Some(current) = cached.as_ref()
            && requested.version <= current.version_id.version
        {
            tracing::debug!(content_id = %requested.id, version = current.version_id.version, "File cache hit");
            return Ok(FileVersion {
                changed: false,
                ..current.clone()
            });
        }

        tracing::debug!(content_id = %requested.id, version = requested.version, "Fetching file content");
        let payload = self.provider.fetch(requested).await?;
        let is_directory = payload.is_directory;

        let target = self.version_dir(requested);
        let content_id = requested.id.clone();
        let file = tokio::task::spawn_blocking(move || publish(&target, payload))
            .await
            .map_err(|e| FileProviderError::Transfer {
                content_id,
                reason: e.to_string(),
            })??;

        let version = FileVersion {
            version_id: requested.clone(),
            file,
            is_directory,
            changed: false,
        };
        *cached = Some(version.clone());
        tracing::info!(content_id = %requested.id, version = requested.version, path = %version.file.display(), "File cached");

        Ok(FileVersion {
            changed: true,
            ..version
        })
    }

    /// Currently cached version of `content_id`, without fetching.
    pub async fn cached(&self, content_id: &str) -> Option<FileVersion> {
        let entry = self.entries.lock().get(content_id).cloned()?;
        let cached = entry.lock().await;
        cached.clone()
    }

    fn entry(&self, content_id: &str) -> Entry {
        self.entries
            .lock()
            .entry(content_id.to_string())
            .or_default()
            .clone()
    }

    fn version_dir(&self, version: &FileVersionId) -> PathBuf {
        self.cache_dir
            .join(entry_dir_name(&version.id))
            .join(version.version.to_string())
    }
}

/// Readable directory name for a content id, made unique by a digest of
/// the raw id.
fn entry_dir_name(id: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(id.as_bytes()));
    format!("{}-{}", sanitize(id), &digest[..12])
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Write `payload` below a fresh temporary directory, then rename it to
/// `target`. Returns the path of the published file or directory.
///
/// An already published `target` holds the same version and is kept as is.
fn publish(target: &Path, payload: FilePayload) -> Result<PathBuf, FileProviderError> {
    let published = target.join(&payload.name);
    if target.exists() {
        tracing::debug!(path = %published.display(), "Version already published");
        return Ok(published);
    }
    let parent = target
        .parent()
        .ok_or_else(|| FileProviderError::NotFound(target.to_path_buf()))?;
    std::fs::create_dir_all(parent)?;

    let staging = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&staging)?;
    let staged = staging.join(&payload.name);

    let written = if payload.is_directory {
        unzip_into(&payload.bytes, &staged)
    } else {
        std::fs::write(&staged, &payload.bytes).map_err(FileProviderError::from)
    };
    if let Err(e) = written {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    if let Err(e) = std::fs::rename(&staging, target) {
        let _ = std::fs::remove_dir_all(&staging);
        // Lost a race against another publisher of the same version.
        if !target.exists() {
            return Err(e.into());
        }
    }
    Ok(published)
}
