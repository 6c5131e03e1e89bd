//! Control of the supervised components (the application and its add-ons).

use crate::utils::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A component that can be stopped and started around a restore.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Component {
    Homeassistant,
    Addon(String),
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Homeassistant => f.write_str("homeassistant"),
            Component::Addon(slug) => write!(f, "addon_{}", slug),
        }
    }
}

/// An add-on currently installed on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledAddon {
    pub slug: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Add-on slugs are lowercase ASCII letters, digits, `_` and `-`.
///
/// Slugs end up in filesystem paths and component commands, so anything read
/// from an archive header must pass this check first.
pub fn is_valid_addon_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Folder ids are relative names such as `share` or `addons/local`.
pub fn is_valid_folder_id(id: &str) -> bool {
    !id.is_empty()
        && id.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        })
}

#[async_trait]
pub trait ComponentControl: Send + Sync {
    /// Version of the running application, if known.
    async fn homeassistant_version(&self) -> Result<Option<String>>;

    async fn installed_addons(&self) -> Result<Vec<InstalledAddon>>;

    async fn stop(&self, component: &Component) -> Result<()>;

    async fn start(&self, component: &Component) -> Result<()>;
}
