use backup_core::{BackupError, BackupManager};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Runs the retention policy on a cron schedule.
pub struct RetentionScheduler {
    scheduler: Mutex<JobScheduler>,
    manager: Arc<BackupManager>,
}

impl RetentionScheduler {
    pub async fn new(manager: Arc<BackupManager>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            manager,
        })
    }

    pub async fn schedule(&self, cron_expression: &str) -> anyhow::Result<()> {
        let manager = self.manager.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let manager = manager.clone();
            Box::pin(async move {
                tracing::info!("Running scheduled retention sweep");
                match manager.apply_retention_policy().await {
                    Ok(removed) if removed.is_empty() => tracing::debug!("No stale backups"),
                    Ok(removed) => tracing::info!(removed = ?removed, "Retention removed stale backups"),
                    Err(BackupError::JobAlreadyInProgress(job)) => {
                        tracing::info!(%job, "Another job is running, skipping retention sweep")
                    }
                    Err(e) => tracing::error!(error = %e, "Retention sweep failed"),
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron_expression, "Retention scheduled");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
