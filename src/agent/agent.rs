//! A worker process: offers tokens to the pool and runs the calls routed to them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;

use crate::agent::handler::{AgentSession, HandlerContext, HandlerRegistry};
use crate::config::AgentConfig;
use crate::error::{AgentError, Error};
use crate::files::{FileManagerClient, FileVersionId};
use crate::functions::model::{
    ErrorKind, HANDLER_KEY, HANDLER_PACKAGE_KEY, InputMessage, Measurement, OutputMessage,
};
use crate::grid::{AgentRef, LOCAL_AGENT, Token, TokenId, TokenPool};
use crate::loader::{ContextBuilder, ContextSession, LoadingUnit};

/// Hosts tokens and executes invocations on them.
///
/// The local agent (id [`LOCAL_AGENT`]) serves tokens minted on the fly and
/// accepts any token id.
pub struct Agent {
    id: String,
    config: AgentConfig,
    handlers: Arc<HandlerRegistry>,
    contexts: Arc<ContextBuilder>,
    files: Option<Arc<FileManagerClient>>,
    tokens: Mutex<HashMap<TokenId, Token>>,
    sessions: Mutex<HashMap<TokenId, Arc<AgentSession>>>,
}

impl Agent {
    pub fn new(id: impl Into<String>, config: AgentConfig, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            id: id.into(),
            config,
            handlers,
            contexts: Arc::new(ContextBuilder::new(LoadingUnit::bootstrap(Vec::new()))),
            files: None,
            tokens: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The in-process agent serving local tokens.
    pub fn local(config: AgentConfig, handlers: Arc<HandlerRegistry>) -> Self {
        Self::new(LOCAL_AGENT, config, handlers)
    }

    pub fn with_files(mut self, files: Arc<FileManagerClient>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_context_builder(mut self, contexts: Arc<ContextBuilder>) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_ref(&self) -> AgentRef {
        AgentRef::new(self.id.clone(), "")
    }

    pub fn is_local(&self) -> bool {
        self.id == LOCAL_AGENT
    }

    pub fn contexts(&self) -> &Arc<ContextBuilder> {
        &self.contexts
    }

    /// Register the configured number of tokens with `pool`.
    pub fn offer_tokens(&self, pool: &TokenPool) -> Vec<Token> {
        let offered: Vec<Token> = (0..self.config.token_count)
            .map(|_| pool.register(self.agent_ref(), self.config.attributes.clone()))
            .collect();

        let mut tokens = self.tokens.lock();
        for token in &offered {
            tokens.insert(token.id().clone(), token.clone());
        }
        tracing::info!(agent = %self.id, count = offered.len(), "Offered tokens");
        offered
    }

    /// Refresh the keepalive of every token of this agent.
    pub fn keepalive(&self, pool: &TokenPool) {
        for id in self.tokens.lock().keys() {
            pool.keepalive(id);
        }
    }

    /// Remove this agent's tokens from `pool` and close their sessions.
    pub fn withdraw_tokens(&self, pool: &TokenPool) {
        let tokens: Vec<TokenId> = self.tokens.lock().drain().map(|(id, _)| id).collect();
        for id in &tokens {
            pool.unregister(id);
            self.sessions.lock().remove(id);
        }
        tracing::info!(agent = %self.id, count = tokens.len(), "Withdrew tokens");
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.tokens.lock().values().cloned().collect()
    }

    fn knows(&self, token_id: &TokenId) -> bool {
        self.is_local() || self.tokens.lock().contains_key(token_id)
    }

    /// Open a reservation session for `token_id`, replacing any open one.
    pub fn reserve_session(&self, token_id: &TokenId) -> Result<(), AgentError> {
        if !self.knows(token_id) {
            return Err(AgentError::UnknownToken {
                token_id: token_id.to_string(),
            });
        }
        self.sessions
            .lock()
            .insert(token_id.clone(), Arc::new(AgentSession::new()));
        tracing::debug!(agent = %self.id, token = %token_id, "Reservation session opened");
        Ok(())
    }

    /// Close the reservation session of `token_id`, dropping its resources.
    pub fn release_session(&self, token_id: &TokenId) {
        if self.sessions.lock().remove(token_id).is_some() {
            tracing::debug!(agent = %self.id, token = %token_id, "Reservation session closed");
        }
    }

    /// Open session of `token_id`, if any.
    pub fn session(&self, token_id: &TokenId) -> Option<Arc<AgentSession>> {
        self.sessions.lock().get(token_id).cloned()
    }

    /// Run one invocation. Never fails: every error becomes an error output.
    pub async fn handle(&self, token_id: &TokenId, input: InputMessage) -> OutputMessage {
        if !self.knows(token_id) {
            let error = AgentError::UnknownToken {
                token_id: token_id.to_string(),
            };
            return OutputMessage::error(ErrorKind::Technical, error.to_string());
        }

        // Calls outside a reservation get a session of their own.
        let session = self
            .session(token_id)
            .unwrap_or_else(|| Arc::new(AgentSession::new()));
        let timeout = input.call_timeout.unwrap_or(self.config.default_call_timeout);
        let function = input.function.clone();
        let begin = Utc::now();
        let started = Instant::now();

        let result = tokio::time::timeout(timeout, self.invoke(token_id, session, &input)).await;
        let elapsed = started.elapsed();

        let mut output = match result {
            Ok(Ok(output)) => {
                tracing::debug!(
                    agent = %self.id,
                    function = %function,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Invocation succeeded"
                );
                output
            }
            Ok(Err(e)) => {
                tracing::warn!(agent = %self.id, function = %function, error = %e, "Invocation failed");
                self.error_output(&function, &e)
            }
            Err(_) => {
                tracing::warn!(agent = %self.id, function = %function, ?timeout, "Invocation timed out");
                self.error_output(&function, &Error::Agent(AgentError::Timeout { timeout }))
            }
        };
        output
            .measurements
            .push(Measurement::new(function, begin, elapsed));
        output
    }

    async fn invoke(
        &self,
        token_id: &TokenId,
        session: Arc<AgentSession>,
        input: &InputMessage,
    ) -> Result<OutputMessage, Error> {
        let ctx = HandlerContext::new(
            token_id.clone(),
            input.properties.clone(),
            session,
            ContextSession::new(Arc::clone(&self.contexts)),
            self.files.clone(),
        );

        if let Some(package) = FileVersionId::from_properties(HANDLER_PACKAGE_KEY, &input.properties) {
            ctx.push_remote_context(&package).await?;
        }

        let name = input
            .properties
            .get(HANDLER_KEY)
            .ok_or_else(|| AgentError::Handler {
                name: input.function.clone(),
                reason: format!("input has no {HANDLER_KEY} property"),
            })?;
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| AgentError::UnknownHandler { name: name.clone() })?;

        ctx.run_in_context(handler.handle(&ctx, input)).await
    }

    fn error_output(&self, function: &str, error: &Error) -> OutputMessage {
        let mut output = OutputMessage::technical(error);
        if let Some(err) = output.error.as_mut() {
            err.message = format!(
                "Error in agent '{}' while executing '{}': {}",
                self.id, function, err.message
            );
        }
        output
    }
}
