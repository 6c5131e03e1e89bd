//! In-memory collaborators for unit tests.

use crate::components::{Component, ComponentControl, InstalledAddon};
use crate::freeze::QuiesceChannel;
use crate::location::DiskSpace;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Records quiesce messages; optionally slow or failing.
#[derive(Default)]
pub struct FakeQuiesce {
    messages: Mutex<Vec<String>>,
    delay: Option<Duration>,
    fail: bool,
}

impl FakeQuiesce {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    async fn send(&self, message: &str) -> Result<()> {
        self.messages.lock().unwrap().push(message.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(BackupError::Component("application unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QuiesceChannel for FakeQuiesce {
    async fn begin_quiesce(&self) -> Result<()> {
        self.send("backup/start").await
    }

    async fn end_quiesce(&self) -> Result<()> {
        self.send("backup/end").await
    }
}

/// Reports a fixed amount of free space everywhere.
pub struct FixedDiskSpace(pub u64);

impl DiskSpace for FixedDiskSpace {
    fn available(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

/// Records stop/start calls against a fixed add-on list.
#[derive(Default)]
pub struct FakeComponents {
    addons: Vec<InstalledAddon>,
    events: Mutex<Vec<String>>,
    fail_stop: Mutex<Option<Component>>,
}

impl FakeComponents {
    pub fn new(addons: &[(&str, Option<&str>)]) -> Self {
        Self {
            addons: addons
                .iter()
                .map(|(slug, version)| InstalledAddon {
                    slug: slug.to_string(),
                    version: version.map(str::to_string),
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn fail_stop(&self, component: Component) {
        *self.fail_stop.lock().unwrap() = Some(component);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComponentControl for FakeComponents {
    async fn homeassistant_version(&self) -> Result<Option<String>> {
        Ok(Some("2026.10.1".to_string()))
    }

    async fn installed_addons(&self) -> Result<Vec<InstalledAddon>> {
        Ok(self.addons.clone())
    }

    async fn stop(&self, component: &Component) -> Result<()> {
        if self.fail_stop.lock().unwrap().as_ref() == Some(component) {
            return Err(BackupError::Component(format!("{} refused to stop", component)));
        }
        self.events.lock().unwrap().push(format!("stop {}", component));
        Ok(())
    }

    async fn start(&self, component: &Component) -> Result<()> {
        self.events.lock().unwrap().push(format!("start {}", component));
        Ok(())
    }
}
