use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Backend identity and registry housekeeping
///
/// # Configuration Example
///
/// ```toml
/// [backend]
/// dom_id = 0
/// device_class = "vsnd"
/// housekeeping_interval_ms = 500
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackendSettings {
    /// Domain the backend runs in (usually Dom0 or a driver domain)
    #[serde(default = "default_dom_id")]
    pub dom_id: u16,

    /// Device class used to build store paths (e.g. "vif", "vsnd")
    #[serde(default = "default_device_class")]
    pub device_class: String,

    /// Interval between two registry passes polling frontends for termination
    ///
    /// **Default**: 500
    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            dom_id: default_dom_id(),
            device_class: default_device_class(),
            housekeeping_interval_ms: default_housekeeping_interval_ms(),
        }
    }
}

impl BackendSettings {
    pub fn validate(&self) -> Result<()> {
        if self.device_class.trim().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "backend.device_class cannot be empty".into(),
            )));
        }

        if self.device_class.contains('/') {
            return Err(Error::Config(ConfigError::Message(format!(
                "backend.device_class {:?} must not contain '/'",
                self.device_class
            ))));
        }

        if self.housekeeping_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "backend.housekeeping_interval_ms must be greater than 0".into(),
            )));
        }

        Ok(())
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }
}

const fn default_dom_id() -> u16 {
    0
}
fn default_device_class() -> String {
    "vdev".to_string()
}
const fn default_housekeeping_interval_ms() -> u64 {
    500
}
