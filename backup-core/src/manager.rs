//! Backup manager: the single entry point for creating, restoring, removing
//! and expiring backups.
//!
//! The manager owns the index of known backups and the persisted options.
//! Every operation that changes archives or the index runs under the
//! exclusive [`JobLock`]; the index stays readable while a job holds it. All archive work happens on the
//! blocking pool.

use crate::archive::manifest::{AddonRecord, Manifest, SourceKind, FORMAT_VERSION};
use crate::archive::{self, ArchiveSource, ExtractTarget, WriteOptions, ARCHIVE_EXTENSION};
use crate::backup::{new_slug, Backup, BackupType, Content, Location};
use crate::components::{is_valid_addon_slug, Component, ComponentControl, InstalledAddon};
use crate::config::CoreConfig;
use crate::freeze::{CoreState, FreezeCoordinator, FreezeGuard, QuiesceChannel};
use crate::fs::walker::{calculate_total_size, WalkOptions};
use crate::job::{JobGuard, JobLock};
use crate::location::{DiskSpace, LocationRequest, LocationResolver, Mount, MountProvider};
use crate::options::{BackupOptions, OptionsStore, OptionsUpdate};
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Files of the application's recorder database.
pub const DATABASE_FILES: &[&str] = &[
    "home-assistant_v2.db",
    "home-assistant_v2.db-wal",
    "home-assistant_v2.db-shm",
];

/// External systems the manager drives.
pub struct Collaborators {
    pub components: Arc<dyn ComponentControl>,
    pub quiesce: Arc<dyn QuiesceChannel>,
    pub mounts: Arc<dyn MountProvider>,
    pub disk: Arc<dyn DiskSpace>,
    pub options: Arc<dyn OptionsStore>,
}

/// Parts of the system chosen for a partial backup or restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Selection {
    #[serde(default)]
    pub homeassistant: bool,
    #[serde(default)]
    pub addons: BTreeSet<String>,
    #[serde(default)]
    pub folders: BTreeSet<String>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        !self.homeassistant && self.addons.is_empty() && self.folders.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub backup_type: BackupType,
    pub name: Option<String>,
    /// Ignored for full backups.
    pub selection: Selection,
    pub location: LocationRequest,
    pub passphrase: Option<String>,
    /// Falls back to the persisted option when unset.
    pub homeassistant_exclude_database: Option<bool>,
}

impl CreateRequest {
    pub fn full() -> Self {
        Self {
            backup_type: BackupType::Full,
            name: None,
            selection: Selection::default(),
            location: LocationRequest::Default,
            passphrase: None,
            homeassistant_exclude_database: None,
        }
    }

    pub fn partial(selection: Selection) -> Self {
        Self {
            backup_type: BackupType::Partial,
            selection,
            ..Self::full()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub backup: Backup,
    /// Non-fatal problems, such as an unacknowledged quiesce.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    pub passphrase: Option<String>,
    /// `None` restores everything the backup contains.
    pub selection: Option<Selection>,
}

/// Snapshot of the manager for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub backups: Vec<Backup>,
    pub options: BackupOptions,
    pub state: CoreState,
    pub current_job: Option<String>,
    pub mounts: Vec<Mount>,
}

/// A freeze requested through [`BackupManager::freeze`]. Holds the job lock
/// until thawed.
struct ManualFreeze {
    guard: FreezeGuard,
    job: JobGuard,
    auto_thaw: CancellationToken,
}

impl ManualFreeze {
    async fn release(self) -> Vec<String> {
        let ManualFreeze { guard, job, auto_thaw } = self;
        auto_thaw.cancel();
        let warnings = guard.thaw().await;
        drop(job);
        warnings
    }
}

pub struct BackupManager {
    config: CoreConfig,
    components: Arc<dyn ComponentControl>,
    resolver: LocationResolver,
    freeze: FreezeCoordinator,
    jobs: JobLock,
    store: Arc<dyn OptionsStore>,
    options: RwLock<BackupOptions>,
    backups: RwLock<BTreeMap<String, Backup>>,
    manual: Arc<Mutex<Option<ManualFreeze>>>,
}

impl BackupManager {
    /// Build a manager. Call [`BackupManager::load`] before serving requests.
    pub fn new(config: CoreConfig, collaborators: Collaborators) -> Self {
        let resolver = LocationResolver::new(
            config.paths.local_store.clone(),
            collaborators.mounts,
            collaborators.disk,
        );
        let freeze = FreezeCoordinator::new(collaborators.quiesce, config.freeze.quiesce_timeout());

        Self {
            config,
            components: collaborators.components,
            resolver,
            freeze,
            jobs: JobLock::new(),
            store: collaborators.options,
            options: RwLock::new(BackupOptions::default()),
            backups: RwLock::new(BTreeMap::new()),
            manual: Arc::new(Mutex::new(None)),
        }
    }

    /// Load persisted options and index every reachable location.
    pub async fn load(&self) -> Result<usize> {
        let options = self.store.load().await?;
        *self.options.write().await = options;
        self.reload().await
    }

    /// Known backups, oldest first.
    pub async fn list(&self) -> Vec<Backup> {
        let mut backups: Vec<Backup> = self.backups.read().await.values().cloned().collect();
        backups.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.slug.cmp(&b.slug)));
        backups
    }

    pub async fn info(&self, slug: &str) -> Result<Backup> {
        self.backups
            .read()
            .await
            .get(slug)
            .cloned()
            .ok_or_else(|| BackupError::SlugNotFound(slug.to_string()))
    }

    pub async fn options(&self) -> BackupOptions {
        self.options.read().await.clone()
    }

    pub fn state(&self) -> CoreState {
        self.freeze.state()
    }

    /// Name of the job holding the lock, if any.
    pub fn current_job(&self) -> Option<String> {
        self.jobs.current()
    }

    pub fn backup_mounts(&self) -> Vec<Mount> {
        self.resolver.backup_mounts()
    }

    pub async fn overview(&self) -> Overview {
        Overview {
            backups: self.list().await,
            options: self.options().await,
            state: self.state(),
            current_job: self.current_job(),
            mounts: self.backup_mounts(),
        }
    }

    /// Create a backup.
    ///
    /// The application is quiesced for the duration of the archive write when
    /// it is part of the backup, and always thawed before this returns. On
    /// failure nothing is added to the index and no archive is left behind.
    pub async fn create(&self, request: CreateRequest, cancel: &CancellationToken) -> Result<CreateOutcome> {
        let _job = self.jobs.try_acquire("backup_create")?;
        let options = self.options().await;
        let mut warnings = Vec::new();

        let installed = self.components.installed_addons().await?;
        let mut content = self.select_content(request.backup_type, &request.selection, &installed)?;
        let exclude_database = request
            .homeassistant_exclude_database
            .unwrap_or(options.homeassistant_exclude_database);
        let sources = self.sources(&content, exclude_database);

        let estimate = {
            let sources = sources.clone();
            blocking(move || estimate_size(&sources)).await?
        };
        let (location, directory) = self.resolver.resolve(
            &request.location,
            options.default_backup_mount.as_deref(),
            estimate,
        )?;

        if content.homeassistant {
            content.homeassistant_version = match self.components.homeassistant_version().await {
                Ok(version) => version,
                Err(e) => {
                    warn!("Could not determine application version: {}", e);
                    None
                }
            };
        }

        let slug = self.unused_slug().await;
        let date = Utc::now();
        let manifest = Manifest {
            version: FORMAT_VERSION,
            slug: slug.clone(),
            name: request
                .name
                .unwrap_or_else(|| default_name(request.backup_type, date)),
            date,
            backup_type: request.backup_type,
            protected: request.passphrase.is_some(),
            homeassistant_exclude_database: exclude_database,
            supervisor_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            addons: installed
                .iter()
                .filter(|addon| content.addons.contains(&addon.slug))
                .map(|addon| AddonRecord {
                    slug: addon.slug.clone(),
                    version: addon.version.clone(),
                })
                .collect(),
            content,
            entries: Vec::new(),
            crypto: None,
        };

        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        info!(%slug, backup_type = %request.backup_type, %location, estimate, "Creating backup");
        let freeze = if manifest.content.homeassistant {
            Some(self.freeze.freeze().await?)
        } else {
            None
        };

        // Dropping this future also stops the blocking writer.
        let cancel = cancel.child_token();
        let _abort_writer = cancel.clone().drop_guard();
        let write_options = WriteOptions {
            compression_level: self.config.archive.compression_level,
        };
        let passphrase = request.passphrase;
        let written = {
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                archive::write(
                    manifest,
                    &sources,
                    &directory,
                    passphrase.as_deref(),
                    &write_options,
                    &cancel,
                )
            })
            .await
        };

        if let Some(guard) = freeze {
            warnings.extend(guard.thaw().await);
        }

        let (manifest, handle) = match written? {
            Ok(written) => written,
            Err(e) => {
                error!(%slug, "Backup failed: {}", e);
                return Err(e);
            }
        };

        let backup = manifest.to_backup(location, handle.path, handle.size);
        self.backups.write().await.insert(slug.clone(), backup.clone());
        info!(%slug, size = backup.size, warnings = warnings.len(), "Backup created");

        Ok(CreateOutcome { backup, warnings })
    }

    /// Restore a backup over the live system.
    ///
    /// The archive is fully validated before any component is stopped, so a
    /// wrong passphrase or a corrupt archive leaves the system untouched.
    /// Stopped components are started again whatever the outcome.
    pub async fn restore(&self, slug: &str, request: RestoreRequest) -> Result<()> {
        let _job = self.jobs.try_acquire("backup_restore")?;
        let backup = self.info(slug).await?;

        let path = backup.path.clone();
        let (manifest, handle) = blocking(move || archive::read(&path)).await?;
        let content = restore_content(&manifest.content, request.selection.as_ref())?;
        let targets = self.targets(&content)?;

        info!(slug, "Validating backup before restore");
        let key = {
            let (handle, manifest, targets) = (handle.clone(), manifest.clone(), targets.clone());
            let passphrase = request.passphrase;
            blocking(move || {
                let key = archive::validate(&handle, &manifest, passphrase.as_deref())?;
                archive::check_targets(&handle, &manifest, &targets)?;
                Ok(key)
            })
            .await?
        };

        let mut outcome = Ok(());
        let mut stopped = Vec::new();
        for component in affected_components(&content) {
            match self.components.stop(&component).await {
                Ok(()) => stopped.push(component),
                Err(e) => {
                    error!(%component, "Failed to stop before restore: {}", e);
                    outcome = Err(e);
                    break;
                }
            }
        }

        if outcome.is_ok() {
            info!(slug, targets = targets.len(), "Extracting backup");
            outcome = blocking(move || archive::extract_validated(&handle, &manifest, key.as_ref(), &targets))
                .await
                .map_err(|e| {
                    error!(slug, "Restore failed during extraction: {}", e);
                    BackupError::RestoreIncomplete {
                        slug: slug.to_string(),
                        reason: e.to_string(),
                    }
                });
        }

        for component in stopped.iter().rev() {
            if let Err(e) = self.components.start(component).await {
                error!(%component, "Failed to start after restore: {}", e);
                if outcome.is_ok() {
                    outcome = Err(BackupError::Component(format!("failed to start {}: {}", component, e)));
                }
            }
        }

        if outcome.is_ok() {
            info!(slug, "Restore complete");
        }
        outcome
    }

    /// Delete a backup's archive, then forget it.
    pub async fn remove(&self, slug: &str) -> Result<()> {
        let _job = self.jobs.try_acquire("backup_remove")?;
        self.remove_locked(slug).await
    }

    /// [`BackupManager::remove`] for callers already holding the job lock.
    async fn remove_locked(&self, slug: &str) -> Result<()> {
        let backup = self.info(slug).await?;

        match tokio::fs::remove_file(&backup.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(slug, path = %backup.path.display(), "Archive already gone, dropping from index");
            }
            Err(e) => {
                error!(slug, "Failed to delete archive: {}", e);
                return Err(e.into());
            }
        }

        self.backups.write().await.remove(slug);
        if self.options.read().await.pinned.contains(slug) {
            if let Err(e) = self.update_options(|o| {
                o.pinned.remove(slug);
            })
            .await
            {
                warn!(slug, "Failed to unpin removed backup: {}", e);
            }
        }

        info!(slug, "Backup removed");
        Ok(())
    }

    /// Remove stale, unpinned backups. The newest backup is always kept.
    ///
    /// Returns the removed slugs, oldest first.
    pub async fn apply_retention_policy(&self) -> Result<Vec<String>> {
        let _job = self.jobs.try_acquire("backup_retention")?;
        let options = self.options().await;
        let now = Utc::now();
        let backups = self.list().await;

        let Some(newest) = backups.last().map(|b| b.slug.clone()) else {
            return Ok(Vec::new());
        };
        let stale: Vec<String> = backups
            .iter()
            .filter(|b| b.slug != newest)
            .filter(|b| !options.pinned.contains(&b.slug))
            .filter(|b| b.is_stale(now, options.days_until_stale))
            .map(|b| b.slug.clone())
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for slug in stale {
            match self.remove_locked(&slug).await {
                Ok(()) => removed.push(slug),
                Err(e) => warn!(%slug, "Retention could not remove backup: {}", e),
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), days_until_stale = options.days_until_stale, "Removed stale backups");
        }
        Ok(removed)
    }

    pub async fn set_days_until_stale(&self, days: u32) -> Result<()> {
        self.set_options(OptionsUpdate {
            days_until_stale: Some(days),
            ..Default::default()
        })
        .await
        .map(|_| ())
    }

    /// Validate and persist an options update.
    pub async fn set_options(&self, update: OptionsUpdate) -> Result<BackupOptions> {
        if update.days_until_stale == Some(0) {
            return Err(BackupError::InvalidOption(
                "days_until_stale must be greater than 0".to_string(),
            ));
        }
        if let Some(Some(name)) = &update.default_backup_mount {
            self.resolver.backup_mount(name)?;
        }

        self.update_options(|options| {
            if let Some(days) = update.days_until_stale {
                options.days_until_stale = days;
            }
            if let Some(mount) = update.default_backup_mount {
                options.default_backup_mount = mount;
            }
            if let Some(exclude) = update.homeassistant_exclude_database {
                options.homeassistant_exclude_database = exclude;
            }
        })
        .await
    }

    /// Change a backup's name, in the index and in its archive header.
    pub async fn rename(&self, slug: &str, name: &str) -> Result<Backup> {
        let _job = self.jobs.try_acquire("backup_rename")?;
        let backup = self.info(slug).await?;

        let path = backup.path.clone();
        let new_name = name.to_string();
        let handle = blocking(move || {
            let (mut manifest, handle) = archive::read(&path)?;
            manifest.name = new_name;
            archive::rewrite_header(&handle, &manifest)
        })
        .await?;

        let mut backups = self.backups.write().await;
        let entry = backups
            .get_mut(slug)
            .ok_or_else(|| BackupError::SlugNotFound(slug.to_string()))?;
        entry.name = name.to_string();
        entry.size = handle.size;
        info!(slug, name, "Backup renamed");
        Ok(entry.clone())
    }

    /// Exempt a backup from retention, or make it eligible again.
    pub async fn pin(&self, slug: &str, pinned: bool) -> Result<()> {
        let _job = self.jobs.try_acquire("backup_pin")?;
        self.info(slug).await?;
        self.update_options(|options| {
            if pinned {
                options.pinned.insert(slug.to_string());
            } else {
                options.pinned.remove(slug);
            }
        })
        .await?;
        info!(slug, pinned, "Backup pin updated");
        Ok(())
    }

    /// Rebuild the index from the archives on disk and clear leftovers of
    /// interrupted writes.
    pub async fn reload(&self) -> Result<usize> {
        let _job = self.jobs.try_acquire("backup_reload")?;
        let locations = self.resolver.locations();
        let found = blocking(move || Ok(scan_locations(&locations))).await?;

        let count = found.len();
        *self.backups.write().await = found;
        info!(count, "Backup index reloaded");
        Ok(count)
    }

    /// Freeze on request. The system thaws after `timeout` (or the configured
    /// default) unless [`BackupManager::thaw`] comes first; no backup or
    /// restore can start meanwhile.
    pub async fn freeze(&self, timeout: Option<Duration>) -> Result<Vec<String>> {
        let job = self.jobs.try_acquire("manual_freeze")?;
        let guard = self.freeze.freeze().await?;
        let warnings: Vec<String> = guard.warning().map(str::to_string).into_iter().collect();

        let timeout = timeout.unwrap_or_else(|| self.config.freeze.manual_thaw_timeout());
        let auto_thaw = CancellationToken::new();
        *self.manual.lock().await = Some(ManualFreeze {
            guard,
            job,
            auto_thaw: auto_thaw.clone(),
        });

        let manual = self.manual.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = auto_thaw.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let frozen = {
                        let mut slot = manual.lock().await;
                        // A thaw cancels the token while holding the slot.
                        if auto_thaw.is_cancelled() {
                            return;
                        }
                        slot.take()
                    };
                    if let Some(frozen) = frozen {
                        warn!("Manual freeze expired after {}s, thawing", timeout.as_secs());
                        frozen.release().await;
                    }
                }
            }
        });

        info!(timeout_secs = timeout.as_secs(), "System frozen on request");
        Ok(warnings)
    }

    /// End a manual freeze. A no-op when no manual freeze is held; a freeze
    /// owned by a running backup is only ended by that backup.
    pub async fn thaw(&self) -> Vec<String> {
        let frozen = {
            let mut slot = self.manual.lock().await;
            let frozen = slot.take();
            if let Some(frozen) = &frozen {
                frozen.auto_thaw.cancel();
            }
            frozen
        };
        match frozen {
            Some(frozen) => frozen.release().await,
            None => Vec::new(),
        }
    }

    async fn update_options<F>(&self, apply: F) -> Result<BackupOptions>
    where
        F: FnOnce(&mut BackupOptions),
    {
        let mut options = self.options.write().await;
        let mut updated = options.clone();
        apply(&mut updated);
        self.store.save(&updated).await?;
        *options = updated.clone();
        Ok(updated)
    }

    async fn unused_slug(&self) -> String {
        let backups = self.backups.read().await;
        loop {
            let slug = new_slug();
            if !backups.contains_key(&slug) {
                return slug;
            }
        }
    }

    fn select_content(
        &self,
        backup_type: BackupType,
        selection: &Selection,
        installed: &[InstalledAddon],
    ) -> Result<Content> {
        let folders = &self.config.paths.folders;
        match backup_type {
            BackupType::Full => Ok(Content {
                homeassistant: true,
                addons: installed.iter().map(|a| a.slug.clone()).collect(),
                folders: folders.keys().cloned().collect(),
                homeassistant_version: None,
            }),
            BackupType::Partial => {
                if selection.is_empty() {
                    return Err(BackupError::EmptySelection);
                }
                if let Some(addon) = selection
                    .addons
                    .iter()
                    .find(|slug| !installed.iter().any(|a| &&a.slug == slug))
                {
                    return Err(BackupError::UnknownAddon(addon.clone()));
                }
                if let Some(folder) = selection.folders.iter().find(|f| !folders.contains_key(*f)) {
                    return Err(BackupError::UnknownFolder(folder.clone()));
                }
                Ok(Content {
                    homeassistant: selection.homeassistant,
                    addons: selection.addons.clone(),
                    folders: selection.folders.clone(),
                    homeassistant_version: None,
                })
            }
        }
    }

    fn source_path(&self, kind: &SourceKind) -> Result<PathBuf> {
        let paths = &self.config.paths;
        match kind {
            SourceKind::Homeassistant => Ok(paths.homeassistant.clone()),
            SourceKind::Addon(slug) if is_valid_addon_slug(slug) => Ok(paths.addon_data(slug)),
            SourceKind::Addon(slug) => Err(BackupError::UnknownAddon(slug.clone())),
            SourceKind::Folder(name) => paths
                .folders
                .get(name)
                .cloned()
                .ok_or_else(|| BackupError::UnknownFolder(name.clone())),
        }
    }

    fn sources(&self, content: &Content, exclude_database: bool) -> Vec<ArchiveSource> {
        source_kinds(content)
            .into_iter()
            .filter_map(|kind| {
                let path = self.source_path(&kind).ok()?;
                let walk = match kind {
                    SourceKind::Homeassistant if exclude_database => {
                        WalkOptions::excluding(DATABASE_FILES.iter().copied())
                    }
                    _ => WalkOptions::default(),
                };
                Some(ArchiveSource { kind, path, walk })
            })
            .collect()
    }

    fn targets(&self, content: &Content) -> Result<Vec<ExtractTarget>> {
        source_kinds(content)
            .into_iter()
            .map(|kind| {
                let path = self.source_path(&kind)?;
                Ok(ExtractTarget { kind, path })
            })
            .collect()
    }
}

fn source_kinds(content: &Content) -> Vec<SourceKind> {
    let mut kinds = Vec::new();
    if content.homeassistant {
        kinds.push(SourceKind::Homeassistant);
    }
    kinds.extend(content.addons.iter().cloned().map(SourceKind::Addon));
    kinds.extend(content.folders.iter().cloned().map(SourceKind::Folder));
    kinds
}

fn affected_components(content: &Content) -> Vec<Component> {
    let mut components = Vec::new();
    if content.homeassistant {
        components.push(Component::Homeassistant);
    }
    components.extend(content.addons.iter().cloned().map(Component::Addon));
    components
}

/// Narrow a backup's content to what a restore asked for.
fn restore_content(content: &Content, selection: Option<&Selection>) -> Result<Content> {
    let Some(selection) = selection else {
        if content.is_empty() {
            return Err(BackupError::EmptySelection);
        }
        return Ok(content.clone());
    };

    if selection.is_empty() {
        return Err(BackupError::EmptySelection);
    }
    if selection.homeassistant && !content.homeassistant {
        return Err(BackupError::InvalidOption(
            "backup does not contain homeassistant".to_string(),
        ));
    }
    if let Some(addon) = selection.addons.difference(&content.addons).next() {
        return Err(BackupError::UnknownAddon(addon.clone()));
    }
    if let Some(folder) = selection.folders.difference(&content.folders).next() {
        return Err(BackupError::UnknownFolder(folder.clone()));
    }

    Ok(Content {
        homeassistant: selection.homeassistant,
        addons: selection.addons.clone(),
        folders: selection.folders.clone(),
        homeassistant_version: content.homeassistant_version.clone(),
    })
}

fn estimate_size(sources: &[ArchiveSource]) -> Result<u64> {
    let mut total = 0u64;
    for source in sources.iter().filter(|s| s.path.is_dir()) {
        total = total.saturating_add(calculate_total_size(&source.path, &source.walk)?);
    }
    Ok(total)
}

fn default_name(backup_type: BackupType, date: DateTime<Utc>) -> String {
    let kind = match backup_type {
        BackupType::Full => "Full",
        BackupType::Partial => "Partial",
    };
    format!("{} backup {}", kind, date.format("%Y-%m-%d %H:%M:%S"))
}

fn scan_locations(locations: &[(Location, PathBuf)]) -> BTreeMap<String, Backup> {
    let mut found = BTreeMap::new();

    for (location, directory) in locations {
        if !directory.is_dir() {
            continue;
        }
        match archive::cleanup_temp_files(directory) {
            Ok(0) => {}
            Ok(removed) => info!(%location, removed, "Removed leftovers of interrupted backups"),
            Err(e) => warn!(%location, "Failed to clean temporary files: {}", e),
        }

        let entries = match std::fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(%location, "Cannot list backup directory: {}", e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXTENSION) {
                continue;
            }
            match archive::read(&path) {
                Ok((manifest, handle)) => {
                    if found.contains_key(&manifest.slug) {
                        warn!(slug = %manifest.slug, path = %path.display(), "Duplicate backup slug, ignoring");
                        continue;
                    }
                    found.insert(
                        manifest.slug.clone(),
                        manifest.to_backup(location.clone(), handle.path, handle.size),
                    );
                }
                Err(e) => warn!(path = %path.display(), "Skipping unreadable backup: {}", e),
            }
        }
    }

    found
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}
