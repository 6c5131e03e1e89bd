//! Supervisor configuration, loaded from a TOML file.

use backup_core::components::InstalledAddon;
use backup_core::location::Mount;
use backup_core::CoreConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    /// Backup engine paths and tunables
    #[serde(default)]
    pub core: CoreConfig,

    #[serde(default)]
    pub application: ApplicationConfig,

    #[serde(default)]
    pub components: ComponentsConfig,

    /// Mounts known to the host
    #[serde(default)]
    pub mounts: Vec<Mount>,

    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP API port
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding persisted settings
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// WebSocket endpoint of the supervised application
    #[serde(default = "default_application_url")]
    pub url: String,

    /// Access token sent in the auth handshake
    #[serde(default)]
    pub token: Option<String>,
}

/// Shell command templates for component control. `{slug}` is replaced
/// with the add-on slug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentsConfig {
    #[serde(default = "default_stop_homeassistant")]
    pub stop_homeassistant: String,

    #[serde(default = "default_start_homeassistant")]
    pub start_homeassistant: String,

    #[serde(default = "default_stop_addon")]
    pub stop_addon: String,

    #[serde(default = "default_start_addon")]
    pub start_addon: String,

    /// Prints the application version on stdout
    #[serde(default)]
    pub homeassistant_version: Option<String>,

    /// Prints a JSON array of `{slug, version}` on stdout
    #[serde(default)]
    pub list_addons: Option<String>,

    /// Used when `list_addons` is not set
    #[serde(default)]
    pub addons: Vec<InstalledAddon>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_enabled")]
    pub enabled: bool,

    /// Cron expression (with seconds) for the retention sweep
    #[serde(default = "default_retention_cron")]
    pub cron: String,
}

// Default values
fn default_port() -> u16 {
    8099
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/data/supervisor.db")
}

fn default_application_url() -> String {
    "ws://127.0.0.1:8123/api/websocket".to_string()
}

fn default_stop_homeassistant() -> String {
    "docker stop homeassistant".to_string()
}

fn default_start_homeassistant() -> String {
    "docker start homeassistant".to_string()
}

fn default_stop_addon() -> String {
    "docker stop addon_{slug}".to_string()
}

fn default_start_addon() -> String {
    "docker start addon_{slug}".to_string()
}

fn default_retention_enabled() -> bool {
    true
}

fn default_retention_cron() -> String {
    "0 0 3 * * *".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            url: default_application_url(),
            token: None,
        }
    }
}

impl Default for ComponentsConfig {
    fn default() -> Self {
        Self {
            stop_homeassistant: default_stop_homeassistant(),
            start_homeassistant: default_start_homeassistant(),
            stop_addon: default_stop_addon(),
            start_addon: default_start_addon(),
            homeassistant_version: None,
            list_addons: None,
            addons: Vec::new(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: default_retention_enabled(),
            cron: default_retention_cron(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
