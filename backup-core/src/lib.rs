//! Backup Core Library
//!
//! Snapshot and restore engine for a supervised home-automation host:
//! archive codec, freeze/thaw protocol, exclusive job lock and the backup
//! manager that ties them together.

pub mod archive;
pub mod backup;
pub mod components;
pub mod config;
pub mod freeze;
pub mod fs;
pub mod job;
pub mod location;
pub mod manager;
pub mod options;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use backup::{Backup, BackupType, Content, Location};
pub use config::CoreConfig;
pub use freeze::CoreState;
pub use manager::{BackupManager, Collaborators, CreateRequest, RestoreRequest, Selection};
pub use utils::errors::{BackupError, Result};
