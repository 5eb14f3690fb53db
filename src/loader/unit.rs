//! Code-loading units and the ambient unit of the running invocation.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Id of the process-wide bootstrap unit.
pub const BOOTSTRAP_UNIT: &str = "bootstrap";

tokio::task_local! {
    static CURRENT_UNIT: Arc<LoadingUnit>;
}

/// An isolated namespace of code and resources.
///
/// Resources resolve parent first, then through this unit's own roots. A root
/// is either a directory, searched by relative path, or a single file, which
/// resolves under its own file name.
#[derive(Debug)]
pub struct LoadingUnit {
    id: String,
    parent: Option<Arc<LoadingUnit>>,
    roots: Vec<PathBuf>,
}

impl LoadingUnit {
    /// The root unit of a worker process.
    pub fn bootstrap(roots: Vec<PathBuf>) -> Self {
        Self {
            id: BOOTSTRAP_UNIT.to_string(),
            parent: None,
            roots,
        }
    }

    pub fn child(id: impl Into<String>, parent: Arc<LoadingUnit>, roots: Vec<PathBuf>) -> Self {
        Self {
            id: id.into(),
            parent: Some(parent),
            roots,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<&Arc<LoadingUnit>> {
        self.parent.as_ref()
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Locate `resource` in this unit or its ancestors.
    pub fn resolve(&self, resource: &str) -> Option<PathBuf> {
        if let Some(found) = self.parent.as_ref().and_then(|p| p.resolve(resource)) {
            return Some(found);
        }
        self.roots.iter().find_map(|root| resolve_in(root, resource))
    }

    /// Ids from the root down to this unit.
    pub fn lineage(&self) -> Vec<String> {
        let mut ids = self
            .parent
            .as_ref()
            .map(|p| p.lineage())
            .unwrap_or_default();
        ids.push(self.id.clone());
        ids
    }
}

fn resolve_in(root: &Path, resource: &str) -> Option<PathBuf> {
    if root.is_dir() {
        let candidate = root.join(resource);
        return candidate.exists().then_some(candidate);
    }
    let name = root.file_name()?.to_str()?;
    (name == resource).then(|| root.to_path_buf())
}

/// Unit installed for the current task, if any.
pub fn current_unit() -> Option<Arc<LoadingUnit>> {
    CURRENT_UNIT.try_with(Arc::clone).ok()
}

/// Run `work` with `unit` as the ambient unit. The previous unit is restored
/// when `work` completes, fails, or is dropped.
pub async fn scope<F: Future>(unit: Arc<LoadingUnit>, work: F) -> F::Output {
    CURRENT_UNIT.scope(unit, work).await
}
