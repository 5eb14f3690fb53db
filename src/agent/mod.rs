//! Agents: the workers hosting tokens and running handlers.

#[allow(clippy::module_inception)]
pub mod agent;
pub mod handler;
pub mod transport;

pub use agent::Agent;
pub use handler::{
    AgentSession, ECHO_HANDLER, EchoHandler, FunctionHandler, HandlerContext, HandlerRegistry,
};
pub use transport::{AgentClient, InProcessTransport};
