//! Persisted configuration.
//!
//! The only durable setting is the serial of the last selected playback
//! device, stored as a small TOML file so it survives restarts.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Access to the stored "last selected device" setting.
///
/// The dispatcher persists only when the newly active serial differs from
/// the stored one.
pub trait ConfigStore {
    /// Serial of the last persisted device; empty when none was stored.
    fn current_serial(&self) -> &str;

    /// Store a new serial durably.
    fn persist(&mut self, serial: &str) -> Result<()>;
}

/// On-disk configuration contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredConfig {
    #[serde(default)]
    pub last_device_serial: String,
}

/// TOML-file-backed [`ConfigStore`].
pub struct FileConfigStore {
    path: PathBuf,
    stored: StoredConfig,
}

impl FileConfigStore {
    /// Load the config at `path`, falling back to defaults when the file is
    /// absent or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stored = match fs::read_to_string(&path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed config, using defaults");
                    StoredConfig::default()
                }
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no stored config, using defaults");
                StoredConfig::default()
            }
        };
        Self { path, stored }
    }

    pub fn stored(&self) -> &StoredConfig {
        &self.stored
    }
}

impl ConfigStore for FileConfigStore {
    fn current_serial(&self) -> &str {
        &self.stored.last_device_serial
    }

    fn persist(&mut self, serial: &str) -> Result<()> {
        self.stored.last_device_serial = serial.to_string();
        let text = toml::to_string(&self.stored).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(&self.path, text)?;
        debug!(path = %self.path.display(), serial, "config written");
        Ok(())
    }
}

/// In-memory [`ConfigStore`] for tests and demos.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    serial: String,
}

impl ConfigStore for MemoryConfigStore {
    fn current_serial(&self) -> &str {
        &self.serial
    }

    fn persist(&mut self, serial: &str) -> Result<()> {
        self.serial = serial.to_string();
        Ok(())
    }
}
