//! Tokens: units of execution capacity offered by agents.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Agent id used for tokens minted in-process.
pub const LOCAL_AGENT: &str = "local";

/// Unique token identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TokenId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to the worker hosting a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRef {
    pub agent_id: String,
    /// Transport address; empty for in-process agents.
    pub address: String,
}

impl AgentRef {
    pub fn new(agent_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            address: address.into(),
        }
    }

    pub fn local() -> Self {
        Self::new(LOCAL_AGENT, "")
    }

    pub fn is_local(&self) -> bool {
        self.agent_id == LOCAL_AGENT
    }
}

#[derive(Debug)]
struct TokenInner {
    id: TokenId,
    agent: AgentRef,
    attributes: BTreeMap<String, String>,
}

/// A handle on a registered token.
///
/// Cheap to clone. Identity and attributes are fixed at registration; the
/// busy/free state lives in the pool.
#[derive(Clone)]
pub struct Token {
    inner: Arc<TokenInner>,
}

impl Token {
    pub fn new(agent: AgentRef, attributes: BTreeMap<String, String>) -> Self {
        Self::with_id(TokenId::new(), agent, attributes)
    }

    pub fn with_id(id: TokenId, agent: AgentRef, attributes: BTreeMap<String, String>) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                id,
                agent,
                attributes,
            }),
        }
    }

    /// A fresh in-process token with no attributes.
    pub fn local() -> Self {
        Self::new(AgentRef::local(), BTreeMap::new())
    }

    pub fn id(&self) -> &TokenId {
        &self.inner.id
    }

    pub fn agent(&self) -> &AgentRef {
        &self.inner.agent
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.inner.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.inner.attributes.get(key).map(String::as_str)
    }

    pub fn is_local(&self) -> bool {
        self.inner.agent.is_local()
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Token {}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.inner.id)
            .field("agent", &self.inner.agent.agent_id)
            .field("attributes", &self.inner.attributes)
            .finish()
    }
}
