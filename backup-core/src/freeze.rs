//! Write-quiescing protocol with the supervised application.
//!
//! The coordinator owns the system's operating state (`Running`/`Freeze`).
//! Freezing sends "begin quiesce" and waits, bounded by a timeout, for the
//! acknowledgment; thawing sends "end quiesce" and always returns the system
//! to `Running`. Every successful [`FreezeCoordinator::freeze`] hands out a
//! [`FreezeGuard`]; awaiting [`FreezeGuard::thaw`] is the normal release, and
//! a guard dropped without it (aborted task) schedules the thaw on the
//! runtime.

use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Command channel to the supervised application.
#[async_trait]
pub trait QuiesceChannel: Send + Sync {
    /// Ask the application to stop writing; resolves once acknowledged.
    async fn begin_quiesce(&self) -> Result<()>;

    /// Let the application resume writing; resolves once acknowledged.
    async fn end_quiesce(&self) -> Result<()>;
}

/// Operating state of the supervised system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreState {
    Running,
    Freeze,
}

impl fmt::Display for CoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreState::Running => f.write_str("running"),
            CoreState::Freeze => f.write_str("freeze"),
        }
    }
}

struct Inner {
    channel: Arc<dyn QuiesceChannel>,
    state: watch::Sender<CoreState>,
    /// Serializes transitions so begin/end messages never interleave.
    transition: Mutex<()>,
    timeout: Duration,
}

/// Drives freeze/thaw against the application. Cheap to clone.
#[derive(Clone)]
pub struct FreezeCoordinator {
    inner: Arc<Inner>,
}

impl FreezeCoordinator {
    pub fn new(channel: Arc<dyn QuiesceChannel>, timeout: Duration) -> Self {
        let (state, _) = watch::channel(CoreState::Running);
        Self {
            inner: Arc::new(Inner {
                channel,
                state,
                transition: Mutex::new(()),
                timeout,
            }),
        }
    }

    pub fn state(&self) -> CoreState {
        *self.inner.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<CoreState> {
        self.inner.state.subscribe()
    }

    /// Move the system to `Freeze`.
    ///
    /// Fails with `AlreadyFrozen` if it is frozen already. A quiesce that is
    /// not acknowledged in time, or that fails, is recorded on the guard as a
    /// warning: the system is still considered frozen and must be thawed.
    pub async fn freeze(&self) -> Result<FreezeGuard> {
        let _transition = self.inner.transition.lock().await;

        let changed = self.inner.state.send_if_modified(|state| match state {
            CoreState::Running => {
                *state = CoreState::Freeze;
                true
            }
            CoreState::Freeze => false,
        });
        if !changed {
            return Err(BackupError::AlreadyFrozen);
        }

        // Armed before the first await so a cancelled freeze still thaws.
        let mut guard = FreezeGuard {
            coordinator: Some(self.clone()),
            warning: None,
        };

        info!("Freezing supervised application for backup");
        match tokio::time::timeout(self.inner.timeout, self.inner.channel.begin_quiesce()).await {
            Ok(Ok(())) => debug!("Quiesce acknowledged"),
            Ok(Err(e)) => {
                warn!("Quiesce request failed, continuing without it: {}", e);
                guard.warning = Some(format!("Application did not quiesce: {}", e));
            }
            Err(_) => {
                warn!(
                    "Quiesce not acknowledged within {}s, continuing",
                    self.inner.timeout.as_secs()
                );
                guard.warning = Some(format!(
                    "Timeout waiting for application to quiesce after {}s",
                    self.inner.timeout.as_secs()
                ));
            }
        }

        Ok(guard)
    }

    /// Return the system to `Running`. No-op when already running.
    ///
    /// Returns a warning when the application did not acknowledge the end of
    /// the quiesce; the state is `Running` either way.
    pub async fn thaw(&self) -> Option<String> {
        let _transition = self.inner.transition.lock().await;

        if self.state() == CoreState::Running {
            debug!("Thaw requested while running, nothing to do");
            return None;
        }

        info!("Thawing supervised application");
        let warning = match tokio::time::timeout(self.inner.timeout, self.inner.channel.end_quiesce()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                warn!("End of quiesce failed: {}", e);
                Some(format!("Application did not confirm end of quiesce: {}", e))
            }
            Err(_) => {
                warn!("End of quiesce not acknowledged within {}s", self.inner.timeout.as_secs());
                Some(format!(
                    "Timeout waiting for application to resume after {}s",
                    self.inner.timeout.as_secs()
                ))
            }
        };

        self.inner.state.send_replace(CoreState::Running);
        warning
    }
}

/// Scoped freeze. Release with [`FreezeGuard::thaw`].
#[must_use = "a freeze must be matched by a thaw"]
pub struct FreezeGuard {
    coordinator: Option<FreezeCoordinator>,
    warning: Option<String>,
}

impl FreezeGuard {
    /// Warning raised while freezing, if any.
    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    /// Thaw and collect every warning raised during freeze and thaw.
    pub async fn thaw(mut self) -> Vec<String> {
        let mut warnings: Vec<String> = self.warning.take().into_iter().collect();
        if let Some(coordinator) = self.coordinator.take() {
            warnings.extend(coordinator.thaw().await);
        }
        warnings
    }
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        let Some(coordinator) = self.coordinator.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Freeze guard dropped without thaw, thawing in background");
                handle.spawn(async move {
                    coordinator.thaw().await;
                });
            }
            Err(_) => warn!("Freeze guard dropped outside a runtime, system left frozen"),
        }
    }
}
