//! Configuration for the backup engine.
//!
//! Embedded by the host binary in its own TOML file; every field has a
//! default so an empty section is valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub freeze: FreezeConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Local backup store
    #[serde(default = "default_local_store")]
    pub local_store: PathBuf,

    /// Application state directory
    #[serde(default = "default_homeassistant")]
    pub homeassistant: PathBuf,

    /// Root of per-add-on data directories (`<addons>/<slug>`)
    #[serde(default = "default_addons")]
    pub addons: PathBuf,

    /// Named shared folders that can be backed up
    #[serde(default = "default_folders")]
    pub folders: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreezeConfig {
    /// Seconds to wait for the application to acknowledge a quiesce
    #[serde(default = "default_quiesce_timeout")]
    pub quiesce_timeout_secs: u64,

    /// Seconds after which a manual freeze thaws on its own
    #[serde(default = "default_manual_thaw_timeout")]
    pub manual_thaw_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

// Default values
fn default_local_store() -> PathBuf {
    PathBuf::from("/data/backup")
}

fn default_homeassistant() -> PathBuf {
    PathBuf::from("/data/homeassistant")
}

fn default_addons() -> PathBuf {
    PathBuf::from("/data/addons/data")
}

fn default_folders() -> BTreeMap<String, PathBuf> {
    [
        ("share", "/data/share"),
        ("ssl", "/data/ssl"),
        ("media", "/data/media"),
        ("addons/local", "/data/addons/local"),
    ]
    .into_iter()
    .map(|(name, path)| (name.to_string(), PathBuf::from(path)))
    .collect()
}

fn default_quiesce_timeout() -> u64 {
    60
}

fn default_manual_thaw_timeout() -> u64 {
    600
}

fn default_compression_level() -> i32 {
    3
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            local_store: default_local_store(),
            homeassistant: default_homeassistant(),
            addons: default_addons(),
            folders: default_folders(),
        }
    }
}

impl Default for FreezeConfig {
    fn default() -> Self {
        Self {
            quiesce_timeout_secs: default_quiesce_timeout(),
            manual_thaw_timeout_secs: default_manual_thaw_timeout(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
        }
    }
}

impl PathsConfig {
    /// Layout with every directory placed under `root`.
    pub fn under(root: &Path) -> Self {
        Self {
            local_store: root.join("backup"),
            homeassistant: root.join("homeassistant"),
            addons: root.join("addons/data"),
            folders: ["share", "ssl", "media"]
                .into_iter()
                .map(|name| (name.to_string(), root.join(name)))
                .collect(),
        }
    }

    pub fn addon_data(&self, slug: &str) -> PathBuf {
        self.addons.join(slug)
    }
}

impl FreezeConfig {
    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_secs(self.quiesce_timeout_secs)
    }

    pub fn manual_thaw_timeout(&self) -> Duration {
        Duration::from_secs(self.manual_thaw_timeout_secs)
    }
}
