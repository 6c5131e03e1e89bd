//! Archive header types.
//!
//! The header is stored unencrypted as `backup.json`, the first member of the
//! container, so listings never need the passphrase or the payload.

use super::crypto::CryptoHeader;
use crate::backup::{Backup, BackupType, Content, Location};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub const HEADER_NAME: &str = "backup.json";
pub const FORMAT_VERSION: u32 = 1;

/// Which part of the supervised system an entry captures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum SourceKind {
    Homeassistant,
    Addon(String),
    Folder(String),
}

impl SourceKind {
    /// Member name inside the container.
    pub fn entry_name(&self, encrypted: bool) -> String {
        let base = match self {
            SourceKind::Homeassistant => "homeassistant".to_string(),
            SourceKind::Addon(slug) => format!("addon_{}", sanitize(slug)),
            SourceKind::Folder(name) => format!("folder_{}", sanitize(name)),
        };
        if encrypted {
            format!("{}.tar.zst.enc", base)
        } else {
            format!("{}.tar.zst", base)
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Homeassistant => f.write_str("homeassistant"),
            SourceKind::Addon(slug) => write!(f, "addon {}", slug),
            SourceKind::Folder(name) => write!(f, "folder {}", name),
        }
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Metadata for a single member of the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub source: SourceKind,
    /// Stored byte length (after compression and encryption).
    pub size: u64,
    /// Hex SHA-256 of the stored bytes.
    pub sha256: String,
}

/// Add-on recorded in a backup, with the version it had at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonRecord {
    pub slug: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Backup header, serialized as `backup.json` in each container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub slug: String,
    pub name: String,
    pub date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub content: Content,
    pub protected: bool,
    pub homeassistant_exclude_database: bool,
    #[serde(default)]
    pub supervisor_version: Option<String>,
    #[serde(default)]
    pub addons: Vec<AddonRecord>,
    #[serde(default)]
    pub entries: Vec<ManifestEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto: Option<CryptoHeader>,
}

impl Manifest {
    pub fn entry(&self, source: &SourceKind) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| &e.source == source)
    }

    /// Build the in-memory entity for a committed container.
    pub fn to_backup(&self, location: Location, path: PathBuf, size: u64) -> Backup {
        Backup {
            slug: self.slug.clone(),
            name: self.name.clone(),
            date: self.date,
            backup_type: self.backup_type,
            content: self.content.clone(),
            protected: self.protected,
            location,
            size,
            homeassistant_exclude_database: self.homeassistant_exclude_database,
            supervisor_version: self.supervisor_version.clone(),
            path,
        }
    }
}
