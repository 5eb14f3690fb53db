//! Versioned file distribution between providers and workers.

pub mod archive;
pub mod client;
pub mod server;
pub mod version;

pub use client::FileManagerClient;
pub use server::{FileProvider, FileServer};
pub use version::{FilePayload, FileVersion, FileVersionId};
