//! Isolated, hot-reloadable code-loading contexts.

pub mod builder;
pub mod descriptor;
pub mod unit;

pub use builder::{CodeContext, ContextBuilder, ContextSession};
pub use descriptor::{ContextDescriptor, LocalFolderDescriptor, RemoteArtifactDescriptor};
pub use unit::{LoadingUnit, current_unit};
