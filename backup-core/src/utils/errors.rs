//! Error taxonomy for backup and restore operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("A backup or restore job is already in progress: {0}")]
    JobAlreadyInProgress(String),

    #[error("Unknown backup location: {0}")]
    UnknownLocation(String),

    #[error("Backup location is not available: {0}")]
    LocationUnavailable(String),

    #[error("Not enough free space in {path}: {available} bytes available, {required} bytes required")]
    InsufficientSpace {
        path: String,
        available: u64,
        required: u64,
    },

    #[error("Nothing selected for backup or restore")]
    EmptySelection,

    #[error("Add-on is not installed: {0}")]
    UnknownAddon(String),

    #[error("Unknown folder: {0}")]
    UnknownFolder(String),

    #[error("Archive is corrupt: {0}")]
    CorruptArchive(String),

    #[error("Invalid passphrase for protected backup {0}")]
    InvalidPassphrase(String),

    #[error("Backup not found: {0}")]
    SlugNotFound(String),

    #[error("Restore of {slug} did not complete: {reason}")]
    RestoreIncomplete { slug: String, reason: String },

    #[error("System is already frozen")]
    AlreadyFrozen,

    #[error("Invalid option: {0}")]
    InvalidOption(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Component control error: {0}")]
    Component(String),

    #[error("Options store error: {0}")]
    Options(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(e: tokio::task::JoinError) -> Self {
        BackupError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
