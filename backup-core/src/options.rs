//! Persisted backup settings.

use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;

pub const DEFAULT_DAYS_UNTIL_STALE: u32 = 30;

fn default_days_until_stale() -> u32 {
    DEFAULT_DAYS_UNTIL_STALE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOptions {
    /// Age in days after which a backup counts as stale.
    #[serde(default = "default_days_until_stale")]
    pub days_until_stale: u32,

    /// Mount used when a create request names no location.
    #[serde(default)]
    pub default_backup_mount: Option<String>,

    /// Default for requests that do not set the flag themselves.
    #[serde(default)]
    pub homeassistant_exclude_database: bool,

    /// Slugs the retention policy never removes.
    #[serde(default)]
    pub pinned: BTreeSet<String>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            days_until_stale: DEFAULT_DAYS_UNTIL_STALE,
            default_backup_mount: None,
            homeassistant_exclude_database: false,
            pinned: BTreeSet::new(),
        }
    }
}

/// Partial update of [`BackupOptions`]. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OptionsUpdate {
    #[serde(default)]
    pub days_until_stale: Option<u32>,
    /// `Some(None)` clears the default mount.
    #[serde(default, deserialize_with = "nullable")]
    pub default_backup_mount: Option<Option<String>>,
    #[serde(default)]
    pub homeassistant_exclude_database: Option<bool>,
}

/// Distinguishes an explicit `null` from an absent field.
pub fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Durable storage for [`BackupOptions`].
#[async_trait]
pub trait OptionsStore: Send + Sync {
    /// Load the stored options, or defaults when nothing was saved yet.
    async fn load(&self) -> Result<BackupOptions>;

    async fn save(&self, options: &BackupOptions) -> Result<()>;
}

/// Options kept in a JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonOptionsStore {
    path: PathBuf,
}

impl JsonOptionsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl OptionsStore for JsonOptionsStore {
    async fn load(&self) -> Result<BackupOptions> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| BackupError::Options(format!("{}: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BackupOptions::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, options: &BackupOptions) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec_pretty(options)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Non-durable store, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryOptionsStore {
    options: Mutex<BackupOptions>,
}

impl MemoryOptionsStore {
    pub fn new(options: BackupOptions) -> Self {
        Self {
            options: Mutex::new(options),
        }
    }
}

#[async_trait]
impl OptionsStore for MemoryOptionsStore {
    async fn load(&self) -> Result<BackupOptions> {
        self.options
            .lock()
            .map(|o| o.clone())
            .map_err(|_| BackupError::Options("options lock poisoned".to_string()))
    }

    async fn save(&self, options: &BackupOptions) -> Result<()> {
        let mut stored = self
            .options
            .lock()
            .map_err(|_| BackupError::Options("options lock poisoned".to_string()))?;
        *stored = options.clone();
        Ok(())
    }
}
