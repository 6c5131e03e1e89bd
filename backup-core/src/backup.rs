//! Backup entity: metadata of one snapshot plus a handle to its archive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Kind of snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Entire supervised system: application, every add-on, every folder.
    Full,
    /// Explicit subset.
    Partial,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Full => f.write_str("full"),
            BackupType::Partial => f.write_str("partial"),
        }
    }
}

/// Logical destination of a backup archive.
///
/// Serialized as `null` for the local store and as the mount name otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum Location {
    Local,
    Mount(String),
}

impl From<Option<String>> for Location {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(name) => Location::Mount(name),
            None => Location::Local,
        }
    }
}

impl From<Location> for Option<String> {
    fn from(value: Location) -> Self {
        match value {
            Location::Local => None,
            Location::Mount(name) => Some(name),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local => f.write_str("local"),
            Location::Mount(name) => write!(f, "mount:{}", name),
        }
    }
}

/// What a snapshot contains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// Application state directory is included.
    pub homeassistant: bool,
    pub addons: BTreeSet<String>,
    pub folders: BTreeSet<String>,
    /// Application version recorded at capture time.
    #[serde(default)]
    pub homeassistant_version: Option<String>,
}

impl Content {
    pub fn is_empty(&self) -> bool {
        !self.homeassistant && self.addons.is_empty() && self.folders.is_empty()
    }
}

/// One snapshot known to the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub slug: String,
    pub name: String,
    pub date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub content: Content,
    pub protected: bool,
    pub location: Location,
    pub size: u64,
    pub homeassistant_exclude_database: bool,
    /// Version of the engine that wrote the archive.
    #[serde(default)]
    pub supervisor_version: Option<String>,
    /// Concrete archive file. Not part of the public listing.
    #[serde(skip)]
    pub path: PathBuf,
}

impl Backup {
    /// Age of the backup relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.date)
    }

    /// True when the backup is older than `days_until_stale` days.
    pub fn is_stale(&self, now: DateTime<Utc>, days_until_stale: u32) -> bool {
        self.age(now) > chrono::Duration::days(i64::from(days_until_stale))
    }
}

/// Generate a fresh slug: 8 lowercase hex characters.
pub fn new_slug() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}
