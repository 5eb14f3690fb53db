//! Worker-side function handlers and what they get to work with.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::error::{ContextBuildError, FileProviderError};
use crate::files::{FileManagerClient, FileVersion, FileVersionId};
use crate::functions::model::{InputMessage, OutputMessage};
use crate::grid::TokenId;
use crate::loader::{CodeContext, ContextDescriptor, ContextSession, RemoteArtifactDescriptor, unit};

/// Name of the built-in handler that answers with its input payload.
pub const ECHO_HANDLER: &str = "echo";

/// Resources tied to a token reservation. Dropped when the session ends.
#[derive(Default)]
pub struct AgentSession {
    resources: Mutex<Vec<Box<dyn Any + Send + Sync>>>,
}

impl AgentSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `resource` alive until the session ends.
    pub fn register<T: Any + Send + Sync>(&self, resource: T) {
        self.resources.lock().push(Box::new(resource));
    }

    pub fn resource_count(&self) -> usize {
        self.resources.lock().len()
    }
}

/// Everything a handler can reach during one invocation.
pub struct HandlerContext {
    token_id: TokenId,
    properties: HashMap<String, String>,
    session: Arc<AgentSession>,
    contexts: tokio::sync::Mutex<ContextSession>,
    files: Option<Arc<FileManagerClient>>,
}

impl HandlerContext {
    pub(crate) fn new(
        token_id: TokenId,
        properties: HashMap<String, String>,
        session: Arc<AgentSession>,
        contexts: ContextSession,
        files: Option<Arc<FileManagerClient>>,
    ) -> Self {
        Self {
            token_id,
            properties,
            session,
            contexts: tokio::sync::Mutex::new(contexts),
            files,
        }
    }

    pub fn token_id(&self) -> &TokenId {
        &self.token_id
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn session(&self) -> &Arc<AgentSession> {
        &self.session
    }

    /// Resolve a distributed file through the agent's cache.
    pub async fn retrieve_file(
        &self,
        version: &FileVersionId,
    ) -> Result<FileVersion, FileProviderError> {
        self.file_manager(&version.id)?
            .request_file_version(version)
            .await
    }

    /// Resolve the file referenced by the `<name>.id` / `<name>.version`
    /// properties of the input, if present.
    pub async fn retrieve_property_file(
        &self,
        name: &str,
    ) -> Result<Option<FileVersion>, FileProviderError> {
        match FileVersionId::from_properties(name, &self.properties) {
            Some(version) => self.retrieve_file(&version).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn current_context(&self) -> Arc<CodeContext> {
        Arc::clone(self.contexts.lock().await.current())
    }

    pub async fn push_context(
        &self,
        descriptor: &dyn ContextDescriptor,
    ) -> Result<Arc<CodeContext>, ContextBuildError> {
        self.contexts.lock().await.push_context(descriptor).await
    }

    /// Push the context of a distributed artifact.
    pub async fn push_remote_context(
        &self,
        version: &FileVersionId,
    ) -> Result<Arc<CodeContext>, ContextBuildError> {
        let files = self
            .file_manager(&version.id)
            .map_err(|source| ContextBuildError::Artifact {
                id: version.id.clone(),
                source,
            })?;
        let descriptor = RemoteArtifactDescriptor::fetch(files, version).await?;
        self.push_context(&descriptor).await
    }

    /// Run `work` with the current context's unit as ambient unit.
    pub async fn run_in_context<F: Future>(&self, work: F) -> F::Output {
        let unit = self.current_context().await.unit();
        unit::scope(unit, work).await
    }

    fn file_manager(&self, content_id: &str) -> Result<&FileManagerClient, FileProviderError> {
        self.files
            .as_deref()
            .ok_or_else(|| FileProviderError::Transfer {
                content_id: content_id.to_string(),
                reason: "agent has no file manager".to_string(),
            })
    }
}

/// A worker-side implementation of a function type.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        input: &InputMessage,
    ) -> crate::error::Result<OutputMessage>;
}

/// Answers with the input payload.
pub struct EchoHandler;

#[async_trait]
impl FunctionHandler for EchoHandler {
    async fn handle(
        &self,
        _ctx: &HandlerContext,
        input: &InputMessage,
    ) -> crate::error::Result<OutputMessage> {
        Ok(OutputMessage::ok(input.payload.clone()))
    }
}

/// Handlers by name, filled when the agent starts.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn FunctionHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// A registry holding the built-in handlers.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(ECHO_HANDLER, Arc::new(EchoHandler));
        registry
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn FunctionHandler>) {
        let name = name.into();
        self.handlers.write().insert(name.clone(), handler);
        tracing::debug!("Registered handler: {}", name);
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn FunctionHandler>> {
        self.handlers.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FunctionHandler>> {
        self.handlers.read().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
