//! Exclusive "backup-or-restore" job lock.
//!
//! Acquisition never waits: a second job is rejected immediately instead of
//! queueing behind a long-running one. The lock is released when the
//! returned [`JobGuard`] is dropped, so every exit path of the owning
//! operation gives it back.

use crate::utils::{BackupError, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Tracks the single running backup or restore job.
#[derive(Clone)]
pub struct JobLock {
    permits: Arc<Semaphore>,
    current: Arc<Mutex<Option<String>>>,
}

impl JobLock {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Take the lock for `job`, failing with `JobAlreadyInProgress` if held.
    pub fn try_acquire(&self, job: &str) -> Result<JobGuard> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                self.set_current(Some(job.to_string()));
                tracing::debug!(job, "Job lock acquired");
                Ok(JobGuard {
                    _permit: permit,
                    current: self.current.clone(),
                    job: job.to_string(),
                })
            }
            Err(TryAcquireError::NoPermits) => {
                let running = self.current().unwrap_or_else(|| "unknown".to_string());
                Err(BackupError::JobAlreadyInProgress(running))
            }
            Err(TryAcquireError::Closed) => {
                Err(BackupError::JobAlreadyInProgress("job lock closed".to_string()))
            }
        }
    }

    /// Name of the job currently holding the lock.
    pub fn current(&self) -> Option<String> {
        self.current.lock().ok().and_then(|c| c.clone())
    }

    pub fn is_held(&self) -> bool {
        self.permits.available_permits() == 0
    }

    fn set_current(&self, job: Option<String>) {
        if let Ok(mut current) = self.current.lock() {
            *current = job;
        }
    }
}

impl Default for JobLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of holding the job lock. Dropping it releases the lock.
pub struct JobGuard {
    _permit: OwnedSemaphorePermit,
    current: Arc<Mutex<Option<String>>>,
    job: String,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        // Clear the name before the permit is returned (fields drop after this).
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
        tracing::debug!(job = %self.job, "Job lock released");
    }
}

impl std::fmt::Debug for JobGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobGuard").field("job", &self.job).finish()
    }
}
