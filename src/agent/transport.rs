//! Transport seam between the router and the agents hosting tokens.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::agent::agent::Agent;
use crate::error::AgentError;
use crate::functions::model::{InputMessage, OutputMessage};
use crate::grid::Token;

/// Client side of the agent protocol.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Run `input` on the agent owning `token`.
    async fn call(&self, token: &Token, input: InputMessage) -> Result<OutputMessage, AgentError>;

    /// Open a reservation session for `token` on its agent.
    async fn reserve_session(&self, token: &Token) -> Result<(), AgentError>;

    /// Close the reservation session of `token`.
    async fn release_session(&self, token: &Token) -> Result<(), AgentError>;
}

/// Delivers calls to agents living in the same process.
#[derive(Default)]
pub struct InProcessTransport {
    agents: RwLock<HashMap<String, Arc<Agent>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, agent: Arc<Agent>) {
        tracing::info!(agent = %agent.id(), "Agent connected");
        self.agents.write().insert(agent.id().to_string(), agent);
    }

    pub fn disconnect(&self, agent_id: &str) -> Option<Arc<Agent>> {
        let removed = self.agents.write().remove(agent_id);
        if removed.is_some() {
            tracing::info!(agent = %agent_id, "Agent disconnected");
        }
        removed
    }

    fn agent(&self, token: &Token) -> Result<Arc<Agent>, AgentError> {
        let agent_id = &token.agent().agent_id;
        self.agents
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| AgentError::Communication {
                agent_id: agent_id.clone(),
                reason: "agent is not connected".to_string(),
            })
    }
}

#[async_trait]
impl AgentClient for InProcessTransport {
    async fn call(&self, token: &Token, input: InputMessage) -> Result<OutputMessage, AgentError> {
        let agent = self.agent(token)?;
        Ok(agent.handle(token.id(), input).await)
    }

    async fn reserve_session(&self, token: &Token) -> Result<(), AgentError> {
        self.agent(token)?.reserve_session(token.id())
    }

    async fn release_session(&self, token: &Token) -> Result<(), AgentError> {
        self.agent(token)?.release_session(token.id());
        Ok(())
    }
}
