//! Backend Error Hierarchy
//!
//! Defines the error types for the XenStore accessor, the watch engine, the
//! frontend lifecycle and the data channels it binds, categorized by the layer
//! that raises them.

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// XenStore access failures (connection, missing entries, parsing)
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Watch registration and dispatch failures
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Frontend lifecycle failures
    #[error(transparent)]
    Frontend(#[from] FrontendError),

    /// Data channel bind failures
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Backend configuration validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// True if the error reports a missing store entry.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Store(StoreError::NotFound { .. }))
    }

    /// True if the error reports a lost store connection.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::Store(StoreError::Unavailable(_)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested entry does not exist
    #[error("Store entry not found: {path}")]
    NotFound { path: String },

    /// The underlying store connection is down
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The entry exists but its content cannot be converted
    #[error("Can't parse {value:?} at {path} as {expected}")]
    Parse {
        path: String,
        value: String,
        expected: &'static str,
    },

    /// A change notification that can't be resolved to a path
    #[error("Malformed watch event: {0}")]
    MalformedEvent(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Watches can't be set on an empty path
    #[error("Watch path must not be empty")]
    InvalidPath,

    /// `start()` was called while the dispatch thread is running
    #[error("Watch engine is already running")]
    AlreadyRunning,
}

#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    /// Store value outside of the xenbus state range
    #[error("Invalid xenbus state: {0}")]
    InvalidState(u32),

    /// A state hook reported a failure
    #[error("Hook {hook} failed: {reason}")]
    HookFailed { hook: &'static str, reason: String },

    /// A frontend with the same ids is already registered
    #[error("Frontend Dom({dom_id}/{dev_id}) already exists")]
    AlreadyExists { dom_id: u16, dev_id: u16 },
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Channel creation failed in the device's bind hook
    #[error("Channel bind failed: {0}")]
    BindFailure(String),

    /// A configuration entry required to bind the channel is absent
    #[error("Missing channel configuration at {path}")]
    MissingConfig { path: String },
}
