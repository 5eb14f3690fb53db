//! Token pool and capability matching.

pub mod interest;
pub mod pool;
pub mod token;

pub use interest::{Interest, SelectionCriteria, affinity_score};
pub use pool::{TokenPool, spawn_keepalive_sweep};
pub use token::{AgentRef, LOCAL_AGENT, Token, TokenId};
