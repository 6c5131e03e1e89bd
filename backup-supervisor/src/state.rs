use backup_core::BackupManager;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct AppState {
    pub manager: Arc<BackupManager>,
    /// Cancelled on shutdown; running backups derive their tokens from it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(manager: Arc<BackupManager>, shutdown: CancellationToken) -> Self {
        Self { manager, shutdown }
    }
}
