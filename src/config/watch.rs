use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::Error;
use crate::Result;

/// Configuration for the XenStore watch engine
///
/// # Configuration Example
///
/// ```toml
/// [watch]
/// poll_timeout_ms = 100
/// init_notify_queue_limit = 1024
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    /// Upper bound for one wait on the store's change notification
    ///
    /// Only used to observe `stop()` promptly; it carries no business logic.
    /// Lower values make shutdown faster at the cost of more wakeups.
    ///
    /// **Default**: 100
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Maximum number of paths waiting for their synthetic initial dispatch
    ///
    /// Registrations beyond this limit are still watched, but don't get the
    /// initial notification.
    ///
    /// **Default**: 1024
    #[serde(default = "default_init_notify_queue_limit")]
    pub init_notify_queue_limit: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            init_notify_queue_limit: default_init_notify_queue_limit(),
        }
    }
}

impl WatchConfig {
    /// Validates watch configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.poll_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.poll_timeout_ms must be greater than 0".into(),
            )));
        }

        if self.poll_timeout_ms > 1000 {
            warn!(
                "watch.poll_timeout_ms ({}) is above 1s; stopping the watch engine will be slow",
                self.poll_timeout_ms
            );
        }

        if self.init_notify_queue_limit == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.init_notify_queue_limit must be greater than 0".into(),
            )));
        }

        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

const fn default_poll_timeout_ms() -> u64 {
    100
}
const fn default_init_notify_queue_limit() -> usize {
    1024
}
