//! Utility modules shared by the backup engine and its hosts.

pub mod errors;
pub mod logger;

pub use errors::{BackupError, Result};
