//! File version identifiers and transfer payloads.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// Suffix of the property carrying a file handle.
pub const ID_SUFFIX: &str = ".id";

/// Suffix of the property carrying a file version stamp.
pub const VERSION_SUFFIX: &str = ".version";

/// Identifies one version of a distributed file: the content handle plus its
/// last-modified stamp in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileVersionId {
    pub id: String,
    pub version: i64,
}

impl FileVersionId {
    pub fn new(id: impl Into<String>, version: i64) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }

    /// Read `<name>.id` / `<name>.version` from a property map.
    pub fn from_properties(name: &str, properties: &HashMap<String, String>) -> Option<Self> {
        let id = properties.get(&format!("{name}{ID_SUFFIX}"))?;
        let version = properties
            .get(&format!("{name}{VERSION_SUFFIX}"))
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        Some(Self::new(id.clone(), version))
    }

    /// Write `<name>.id` / `<name>.version` into a property map.
    pub fn to_properties(&self, name: &str, properties: &mut HashMap<String, String>) {
        properties.insert(format!("{name}{ID_SUFFIX}"), self.id.clone());
        properties.insert(format!("{name}{VERSION_SUFFIX}"), self.version.to_string());
    }
}

impl fmt::Display for FileVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// A file or directory resolved in the local cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVersion {
    pub version_id: FileVersionId,
    pub file: PathBuf,
    pub is_directory: bool,
    /// Whether this request replaced the previously cached content.
    pub changed: bool,
}

/// Content shipped from provider to consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePayload {
    pub name: String,
    pub is_directory: bool,
    /// Raw file bytes, or a zip archive of the directory tree.
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

/// Last-modified stamp of a file, or the newest entry of a directory tree.
pub fn last_modified(path: &Path) -> io::Result<i64> {
    let metadata = std::fs::metadata(path)?;
    let mut newest = stamp(&metadata)?;
    if metadata.is_dir() {
        for entry in WalkDir::new(path).min_depth(1) {
            let entry = entry.map_err(io::Error::from)?;
            newest = newest.max(stamp(&entry.metadata().map_err(io::Error::from)?)?);
        }
    }
    Ok(newest)
}

fn stamp(metadata: &std::fs::Metadata) -> io::Result<i64> {
    let modified: DateTime<Utc> = metadata.modified()?.into();
    Ok(modified.timestamp_millis())
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}
