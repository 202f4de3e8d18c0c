//! Replication orchestrator, registry backends and settings for a dfs node.

pub mod discovery;
pub mod server;
pub mod settings;

pub use discovery::{FileRegistry, MemoryRegistry, Registry, RegistryError};
pub use server::{FileServer, FileServerOpts};
pub use settings::Settings;
