//! Error types for the grid.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the grid.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Agent communication error: {0}")]
    Agent(#[from] AgentError),

    #[error("File provider error: {0}")]
    FileProvider(#[from] FileProviderError),

    #[error("Context build error: {0}")]
    ContextBuild(#[from] ContextBuildError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Token selection failures.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Timeout after {waited:?} while selecting token: matching tokens exist but none became free")]
    Timeout { waited: Duration },

    #[error("No registered token matches the selection criteria {criteria}")]
    NoMatch { criteria: String },

    #[error("Token selection cancelled")]
    Cancelled,

    #[error("Unknown function type: {name}")]
    UnknownFunctionType { name: String },

    #[error("Invalid selection criterion {key}: {reason}")]
    InvalidCriteria { key: String, reason: String },
}

/// Failures talking to (or inside) the worker a token belongs to.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Communication with agent {agent_id} failed: {reason}")]
    Communication { agent_id: String, reason: String },

    #[error("No token found with id {token_id}")]
    UnknownToken { token_id: String },

    #[error("There is no handler registered under \"{name}\"")]
    UnknownHandler { name: String },

    #[error("Timeout after {timeout:?} while processing request")]
    Timeout { timeout: Duration },

    #[error("Handler {name} failed: {reason}")]
    Handler { name: String, reason: String },
}

/// File distribution errors (both provider and consumer side).
#[derive(Debug, thiserror::Error)]
pub enum FileProviderError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("File {} is not readable: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },

    #[error("Unknown file handle: {0}")]
    UnknownHandle(String),

    #[error("Transfer of {content_id} failed: {reason}")]
    Transfer { content_id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while constructing a code-loading unit.
#[derive(Debug, thiserror::Error)]
pub enum ContextBuildError {
    #[error("Artifact for context {id} could not be resolved: {source}")]
    Artifact {
        id: String,
        #[source]
        source: FileProviderError,
    },

    #[error("Building context {id} failed: {reason}")]
    Build { id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the grid.
pub type Result<T> = std::result::Result<T, Error>;
