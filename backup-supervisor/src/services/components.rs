//! Component control through configured shell commands.

use crate::config::ComponentsConfig;
use async_trait::async_trait;
use backup_core::components::{is_valid_addon_slug, Component, ComponentControl, InstalledAddon};
use backup_core::{BackupError, Result};
use tokio::process::Command;
use tracing::{debug, info};

pub struct ProcessComponents {
    config: ComponentsConfig,
}

impl ProcessComponents {
    pub fn new(config: ComponentsConfig) -> Self {
        Self { config }
    }

    /// The slug is spliced into a shell command line, so only plain slugs
    /// are accepted.
    fn command_for(&self, component: &Component, stop: bool) -> Result<String> {
        if let Component::Addon(slug) = component {
            if !is_valid_addon_slug(slug) {
                return Err(BackupError::Component(format!("refusing unsafe add-on slug {:?}", slug)));
            }
        }
        Ok(match (component, stop) {
            (Component::Homeassistant, true) => self.config.stop_homeassistant.clone(),
            (Component::Homeassistant, false) => self.config.start_homeassistant.clone(),
            (Component::Addon(slug), true) => self.config.stop_addon.replace("{slug}", slug),
            (Component::Addon(slug), false) => self.config.start_addon.replace("{slug}", slug),
        })
    }
}

/// Run `command` through `sh -c` and return its stdout.
async fn run(command: &str) -> Result<String> {
    debug!(command, "Running component command");
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| BackupError::Component(format!("{}: {}", command, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackupError::Component(format!(
            "{} exited with {}: {}",
            command,
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl ComponentControl for ProcessComponents {
    async fn homeassistant_version(&self) -> Result<Option<String>> {
        let Some(command) = &self.config.homeassistant_version else {
            return Ok(None);
        };
        let version = run(command).await?;
        Ok((!version.is_empty()).then_some(version))
    }

    async fn installed_addons(&self) -> Result<Vec<InstalledAddon>> {
        let Some(command) = &self.config.list_addons else {
            return Ok(self.config.addons.clone());
        };
        let stdout = run(command).await?;
        serde_json::from_str(&stdout)
            .map_err(|e| BackupError::Component(format!("unexpected add-on list from {}: {}", command, e)))
    }

    async fn stop(&self, component: &Component) -> Result<()> {
        info!(%component, "Stopping component");
        run(&self.command_for(component, true)?).await.map(|_| ())
    }

    async fn start(&self, component: &Component) -> Result<()> {
        info!(%component, "Starting component");
        run(&self.command_for(component, false)?).await.map(|_| ())
    }
}
