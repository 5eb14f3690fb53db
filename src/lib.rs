//! Grid fabric: a token pool matching calls to worker capabilities, a
//! function router and executor, versioned file distribution and
//! hot-reloadable code-loading contexts.

pub mod agent;
pub mod config;
pub mod error;
pub mod files;
pub mod functions;
pub mod grid;
pub mod loader;

pub use error::{Error, Result};
