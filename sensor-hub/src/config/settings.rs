//! Per-device schedule settings persisted as one JSON file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::Result;
use crate::domain::ScheduleConfig;
use crate::utils::fs::{io_error, write_atomic};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsFile {
    /// Applied to devices without their own entry.
    #[serde(default)]
    default: ScheduleConfig,
    #[serde(default)]
    devices: BTreeMap<String, ScheduleConfig>,
}

/// JSON-backed store of [`ScheduleConfig`]s keyed by device name.
///
/// Reads are served from memory; every write rewrites the file atomically
/// and only reaches the cache once the file is on disk.
#[derive(Debug)]
pub struct JsonSettingsStore {
    path: PathBuf,
    /// Devices without an output location save under `<root>/<device>`.
    output_root: Option<PathBuf>,
    cache: RwLock<SettingsFile>,
    /// Held across a whole write so files land in call order.
    writer: Mutex<()>,
}

impl JsonSettingsStore {
    /// Open the store, starting empty if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<SettingsFile>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No settings file, starting with defaults");
                SettingsFile::default()
            }
            Err(e) => return Err(io_error("reading", &path, e)),
        };
        info!(
            path = %path.display(),
            devices = file.devices.len(),
            "Loaded device settings"
        );
        Ok(Self {
            path,
            output_root: None,
            cache: RwLock::new(file),
            writer: Mutex::new(()),
        })
    }

    pub fn with_output_root(mut self, root: Option<PathBuf>) -> Self {
        self.output_root = root;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Settings for `device`, falling back to the default entry.
    pub fn load(&self, device: &str) -> ScheduleConfig {
        let mut config = {
            let cache = self.cache.read();
            cache
                .devices
                .get(device)
                .unwrap_or(&cache.default)
                .clone()
        };
        if config.output_location.is_none()
            && let Some(root) = &self.output_root
        {
            config.output_location = Some(root.join(device));
        }
        config
    }

    pub fn contains(&self, device: &str) -> bool {
        self.cache.read().devices.contains_key(device)
    }

    pub fn devices(&self) -> Vec<String> {
        self.cache.read().devices.keys().cloned().collect()
    }

    pub async fn save(&self, device: &str, config: &ScheduleConfig) -> Result<()> {
        self.save_all(&[(device.to_string(), config.clone())]).await
    }

    /// Persist several device entries with a single write.
    pub async fn save_all(&self, entries: &[(String, ScheduleConfig)]) -> Result<()> {
        for (_, config) in entries {
            config.validate()?;
        }
        self.update(|file| {
            for (device, config) in entries {
                file.devices.insert(device.clone(), config.clone());
            }
        })
        .await?;
        debug!(devices = entries.len(), "Saved device settings");
        Ok(())
    }

    pub fn default_config(&self) -> ScheduleConfig {
        self.cache.read().default.clone()
    }

    pub async fn set_default(&self, config: &ScheduleConfig) -> Result<()> {
        config.validate()?;
        self.update(|file| file.default = config.clone()).await
    }

    async fn update(&self, edit: impl FnOnce(&mut SettingsFile)) -> Result<()> {
        let _writer = self.writer.lock().await;
        let mut next = self.cache.read().clone();
        edit(&mut next);
        let bytes = serde_json::to_vec_pretty(&next)?;
        write_atomic(&self.path, &bytes).await?;
        *self.cache.write() = next;
        Ok(())
    }
}
