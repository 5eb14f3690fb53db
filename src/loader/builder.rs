//! Code-context tree: cached, hot-reloadable loading units.
//!
//! Children are keyed by descriptor id under their parent and created on
//! first use. A rebuild produces a complete new unit and swaps it in
//! together with an empty object map, so readers see either the old state
//! or the new one. Builds are serialized by one lock per builder.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};

use crate::error::ContextBuildError;
use crate::loader::descriptor::ContextDescriptor;
use crate::loader::unit::{self, LoadingUnit};

type Object = Arc<dyn Any + Send + Sync>;

/// A unit, the artifact version it was built from and the objects derived
/// from it. Replaced as a whole on rebuild.
struct Loaded {
    unit: Arc<LoadingUnit>,
    version: Option<i64>,
    objects: Mutex<HashMap<String, Object>>,
}

impl Loaded {
    fn new(unit: Arc<LoadingUnit>, version: Option<i64>) -> Self {
        Self {
            unit,
            version,
            objects: Mutex::new(HashMap::new()),
        }
    }
}

/// One node of the code-context tree.
pub struct CodeContext {
    id: String,
    loaded: ArcSwap<Loaded>,
    children: RwLock<HashMap<String, Arc<CodeContext>>>,
}

impl CodeContext {
    fn new(id: impl Into<String>, unit: Arc<LoadingUnit>, version: Option<i64>) -> Self {
        Self {
            id: id.into(),
            loaded: ArcSwap::from_pointee(Loaded::new(unit, version)),
            children: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current loading unit of this context.
    pub fn unit(&self) -> Arc<LoadingUnit> {
        Arc::clone(&self.loaded.load().unit)
    }

    /// Artifact version the current unit was built from.
    pub fn version(&self) -> Option<i64> {
        self.loaded.load().version
    }

    /// Object stored under `key`, if present and of type `T`.
    pub fn object<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let loaded = self.loaded.load();
        let object = loaded.objects.lock().get(key).cloned()?;
        object.downcast::<T>().ok()
    }

    /// Object stored under `key`, created by `init` if absent.
    ///
    /// Objects live until the context's unit is rebuilt.
    pub fn object_or_insert_with<T, F>(&self, key: &str, init: F) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let loaded = self.loaded.load();
        let mut objects = loaded.objects.lock();
        let object = objects
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(init()) as Object)
            .clone();
        object.downcast::<T>().ok()
    }

    pub fn object_count(&self) -> usize {
        self.loaded.load().objects.lock().len()
    }

    pub fn child(&self, id: &str) -> Option<Arc<CodeContext>> {
        self.children.read().get(id).cloned()
    }

    fn replace_unit(&self, unit: Arc<LoadingUnit>, version: Option<i64>) {
        self.loaded.store(Arc::new(Loaded::new(unit, version)));
    }

    /// Whether `descriptor` asks for a different unit than the current one.
    fn is_stale_for(&self, descriptor: &dyn ContextDescriptor) -> bool {
        descriptor.requires_reload() || descriptor.version() > self.version()
    }
}

impl std::fmt::Debug for CodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeContext")
            .field("id", &self.id)
            .field("unit", &self.loaded.load().unit.id())
            .field("children", &self.children.read().len())
            .finish()
    }
}

/// Owner of the code-context tree of one worker process.
pub struct ContextBuilder {
    root: Arc<CodeContext>,
    build_lock: tokio::sync::Mutex<()>,
}

impl ContextBuilder {
    pub fn new(bootstrap: LoadingUnit) -> Self {
        let unit = Arc::new(bootstrap);
        Self {
            root: Arc::new(CodeContext::new(unit.id().to_string(), unit, None)),
            build_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Arc<CodeContext> {
        &self.root
    }

    /// Child of `parent` for `descriptor`, built, rebuilt or reused as needed.
    pub async fn push_context(
        &self,
        parent: &Arc<CodeContext>,
        descriptor: &dyn ContextDescriptor,
    ) -> Result<Arc<CodeContext>, ContextBuildError> {
        let id = descriptor.id();

        if let Some(existing) = parent.child(id)
            && !existing.is_stale_for(descriptor)
        {
            tracing::debug!(context = %id, "Reusing cached context");
            return Ok(existing);
        }

        // Staleness is checked again under the lock: a concurrent push may
        // already have rebuilt the child.
        let _guard = self.build_lock.lock().await;
        let version = descriptor.version();
        match parent.child(id) {
            Some(existing) if !existing.is_stale_for(descriptor) => Ok(existing),
            Some(existing) => {
                let unit = descriptor.build(parent.unit()).await?;
                existing.replace_unit(Arc::new(unit), version);
                tracing::info!(context = %id, parent = %parent.id(), ?version, "Rebuilt context");
                Ok(existing)
            }
            None => {
                let unit = descriptor.build(parent.unit()).await?;
                let child = Arc::new(CodeContext::new(id, Arc::new(unit), version));
                parent
                    .children
                    .write()
                    .insert(id.to_string(), Arc::clone(&child));
                tracing::info!(context = %id, parent = %parent.id(), "Created context");
                Ok(child)
            }
        }
    }
}

/// Context position of one invocation. Not shared between invocations.
pub struct ContextSession {
    builder: Arc<ContextBuilder>,
    current: Arc<CodeContext>,
}

impl ContextSession {
    /// A session positioned at the root context.
    pub fn new(builder: Arc<ContextBuilder>) -> Self {
        let current = Arc::clone(builder.root());
        Self { builder, current }
    }

    pub fn current(&self) -> &Arc<CodeContext> {
        &self.current
    }

    /// Descend into the child for `descriptor` under the current context.
    ///
    /// On failure the session stays where it was.
    pub async fn push_context(
        &mut self,
        descriptor: &dyn ContextDescriptor,
    ) -> Result<Arc<CodeContext>, ContextBuildError> {
        let child = self.builder.push_context(&self.current, descriptor).await?;
        self.current = Arc::clone(&child);
        Ok(child)
    }

    pub fn reset_context(&mut self) {
        self.current = Arc::clone(self.builder.root());
    }

    /// Run `work` with the current context's unit installed as ambient unit.
    pub async fn run_in_context<F: Future>(&self, work: F) -> F::Output {
        unit::scope(self.current.unit(), work).await
    }
}
