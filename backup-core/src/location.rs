//! Maps logical backup locations to concrete directories.

use crate::backup::Location;
use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Extra free space required on top of the size estimate, in percent.
pub const SPACE_MARGIN_PERCENT: u64 = 10;

/// What a mount is used for. Only `Backup` mounts receive archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountUsage {
    Backup,
    Media,
    Share,
}

/// External storage attached to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub name: String,
    pub usage: MountUsage,
    pub path: PathBuf,
}

/// Source of the host's mounts.
pub trait MountProvider: Send + Sync {
    fn mounts(&self) -> Vec<Mount>;
}

/// Fixed mount table, usually read from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticMounts {
    mounts: Vec<Mount>,
}

impl StaticMounts {
    pub fn new(mounts: Vec<Mount>) -> Self {
        Self { mounts }
    }
}

impl MountProvider for StaticMounts {
    fn mounts(&self) -> Vec<Mount> {
        self.mounts.clone()
    }
}

/// Free-space query for a directory.
pub trait DiskSpace: Send + Sync {
    /// Bytes available to unprivileged writers under `path`.
    fn available(&self, path: &Path) -> io::Result<u64>;
}

/// [`DiskSpace`] backed by `statvfs(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsDiskSpace;

impl DiskSpace for StatvfsDiskSpace {
    fn available(&self, path: &Path) -> io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        #[allow(clippy::unnecessary_cast)]
        let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        Ok(available)
    }
}

/// Where a caller asked a backup to go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LocationRequest {
    /// Nothing specified: the default backup mount if set, else local.
    #[default]
    Default,
    /// Explicitly the local store, even when a default mount is set.
    Local,
    Mount(String),
}

impl From<Option<Option<String>>> for LocationRequest {
    /// `None` is an absent field, `Some(None)` an explicit `null`.
    fn from(value: Option<Option<String>>) -> Self {
        match value {
            None => LocationRequest::Default,
            Some(None) => LocationRequest::Local,
            Some(Some(name)) => LocationRequest::Mount(name),
        }
    }
}

/// Resolves locations against the local store and the mount table.
#[derive(Clone)]
pub struct LocationResolver {
    local_store: PathBuf,
    mounts: Arc<dyn MountProvider>,
    disk: Arc<dyn DiskSpace>,
}

impl LocationResolver {
    pub fn new(local_store: PathBuf, mounts: Arc<dyn MountProvider>, disk: Arc<dyn DiskSpace>) -> Self {
        Self {
            local_store,
            mounts,
            disk,
        }
    }

    /// Mounts that may hold backups.
    pub fn backup_mounts(&self) -> Vec<Mount> {
        self.mounts
            .mounts()
            .into_iter()
            .filter(|m| m.usage == MountUsage::Backup)
            .collect()
    }

    /// Look up a backup mount by name.
    pub fn backup_mount(&self, name: &str) -> Result<Mount> {
        self.backup_mounts()
            .into_iter()
            .find(|m| m.name == name)
            .ok_or_else(|| BackupError::UnknownLocation(name.to_string()))
    }

    /// Pick the logical location for a request.
    pub fn select(&self, request: &LocationRequest, default_mount: Option<&str>) -> Location {
        match request {
            LocationRequest::Default => match default_mount {
                Some(name) => Location::Mount(name.to_string()),
                None => Location::Local,
            },
            LocationRequest::Local => Location::Local,
            LocationRequest::Mount(name) => Location::Mount(name.clone()),
        }
    }

    /// Concrete directory of a location, without any space check.
    pub fn directory(&self, location: &Location) -> Result<PathBuf> {
        match location {
            Location::Local => {
                std::fs::create_dir_all(&self.local_store)?;
                Ok(self.local_store.clone())
            }
            Location::Mount(name) => {
                let mount = self.backup_mount(name)?;
                if !mount.path.is_dir() {
                    return Err(BackupError::LocationUnavailable(format!(
                        "{} ({})",
                        name,
                        mount.path.display()
                    )));
                }
                Ok(mount.path)
            }
        }
    }

    /// Resolve a request to a writable directory with room for
    /// `size_estimate` bytes plus the safety margin.
    pub fn resolve(
        &self,
        request: &LocationRequest,
        default_mount: Option<&str>,
        size_estimate: u64,
    ) -> Result<(Location, PathBuf)> {
        let location = self.select(request, default_mount);
        let directory = self.directory(&location)?;

        let required = size_estimate.saturating_add(size_estimate.saturating_mul(SPACE_MARGIN_PERCENT) / 100);
        let available = self.disk.available(&directory)?;
        debug!(%location, available, required, "Checked free space");
        if available < required {
            return Err(BackupError::InsufficientSpace {
                path: directory.display().to_string(),
                available,
                required,
            });
        }

        Ok((location, directory))
    }

    /// Every location that currently has a reachable directory.
    pub fn locations(&self) -> Vec<(Location, PathBuf)> {
        let mut locations = vec![(Location::Local, self.local_store.clone())];
        locations.extend(
            self.backup_mounts()
                .into_iter()
                .filter(|m| m.path.is_dir())
                .map(|m| (Location::Mount(m.name), m.path)),
        );
        locations
    }
}
