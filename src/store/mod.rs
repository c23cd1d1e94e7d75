//! XenStore access
//!
//! [`StoreConnection`] is the raw, synchronous connection to the hierarchical
//! configuration store. [`XenStore`] wraps a shared connection and adds the
//! typed helpers used by the watch engine and frontend handlers.
//!
//! All operations are safe to call from any thread. The accessor keeps no
//! state across calls besides the connection handle.

mod memory;
mod path;


use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use memory::*;
#[cfg(test)]
use mockall::automock;
pub use path::*;
use tracing::trace;

use crate::Result;
use crate::StoreError;

/// Kind of store mutation behind a change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventType {
    /// Node was created or its value replaced
    Write,
    /// Node was removed together with its subtree
    Remove,
}

/// Change notification delivered by the store for a watched subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    /// The node that was written or removed
    pub path: String,
    /// Type of change
    pub event_type: StoreEventType,
}

impl StoreEvent {
    /// True if a watch registered on `watch_path` observes this change.
    ///
    /// Writes fire watches at or above the written node; removals also fire
    /// watches on the removed subtree.
    pub fn matches(
        &self,
        watch_path: &str,
    ) -> bool {
        is_subpath(watch_path, &self.path)
            || (self.event_type == StoreEventType::Remove && is_subpath(&self.path, watch_path))
    }
}

#[cfg_attr(test, automock)]
pub trait StoreConnection: Send + Sync + 'static {
    fn read(
        &self,
        path: &str,
    ) -> Result<String>;

    fn write(
        &self,
        path: &str,
        value: &str,
    ) -> Result<()>;

    fn remove(
        &self,
        path: &str,
    ) -> Result<()>;

    fn exists(
        &self,
        path: &str,
    ) -> Result<bool>;

    /// Names of the direct children, in store order. Empty for a leaf.
    fn list(
        &self,
        path: &str,
    ) -> Result<Vec<String>>;

    /// Starts reporting changes at or below `path`.
    fn watch(
        &self,
        path: &str,
    ) -> Result<()>;

    fn unwatch(
        &self,
        path: &str,
    ) -> Result<()>;

    /// Blocks until a change is reported or `timeout` elapses.
    ///
    /// Returns `Ok(None)` on timeout. A lost connection is reported as
    /// [`StoreError::Unavailable`].
    fn read_watch(
        &self,
        timeout: Duration,
    ) -> Result<Option<StoreEvent>>;
}

/// Typed accessor over a shared store connection
#[derive(Clone)]
pub struct XenStore {
    conn: Arc<dyn StoreConnection>,
}

impl fmt::Debug for XenStore {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("XenStore").finish_non_exhaustive()
    }
}

impl XenStore {
    pub fn new(conn: Arc<dyn StoreConnection>) -> Self {
        Self { conn }
    }

    /// Returns the home path of the domain.
    pub fn get_domain_path(
        &self,
        dom_id: u16,
    ) -> String {
        domain_path(dom_id)
    }

    pub fn read_string(
        &self,
        path: &str,
    ) -> Result<String> {
        let value = self.conn.read(path)?;
        trace!(path, value = %value, "Read entry");
        Ok(value)
    }

    pub fn read_int(
        &self,
        path: &str,
    ) -> Result<i32> {
        let value = self.read_string(path)?;
        value.trim().parse::<i32>().map_err(|_| {
            StoreError::Parse {
                path: path.to_string(),
                value,
                expected: "int",
            }
            .into()
        })
    }

    pub fn read_uint(
        &self,
        path: &str,
    ) -> Result<u32> {
        let value = self.read_string(path)?;
        value.trim().parse::<u32>().map_err(|_| {
            StoreError::Parse {
                path: path.to_string(),
                value,
                expected: "uint",
            }
            .into()
        })
    }

    pub fn write_string(
        &self,
        path: &str,
        value: &str,
    ) -> Result<()> {
        trace!(path, value, "Write entry");
        self.conn.write(path, value)
    }

    pub fn write_int(
        &self,
        path: &str,
        value: i32,
    ) -> Result<()> {
        self.write_string(path, &value.to_string())
    }

    pub fn write_uint(
        &self,
        path: &str,
        value: u32,
    ) -> Result<()> {
        self.write_string(path, &value.to_string())
    }

    pub fn remove_path(
        &self,
        path: &str,
    ) -> Result<()> {
        trace!(path, "Remove entry");
        self.conn.remove(path)
    }

    pub fn check_if_exist(
        &self,
        path: &str,
    ) -> Result<bool> {
        self.conn.exists(path)
    }

    pub fn read_directory(
        &self,
        path: &str,
    ) -> Result<Vec<String>> {
        self.conn.list(path)
    }

    pub(crate) fn connection(&self) -> &Arc<dyn StoreConnection> {
        &self.conn
    }
}
