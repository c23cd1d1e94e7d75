//! Data channels bound during the frontend handshake
//!
//! The ring layout and the event channel signalling live in the concrete
//! channel implementation. The lifecycle only needs to hold channels, poll
//! them for termination and drop them on teardown, which releases the
//! underlying resources.


use std::fmt;

#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::ChannelError;
use crate::Error;
use crate::Result;
use crate::StoreError;
use crate::XenStore;

#[cfg_attr(test, automock)]
pub trait DataChannel: Send + Sync + 'static {
    /// Short channel name used in logs
    fn name(&self) -> String;

    /// True once the channel worker stopped, on peer request or on error.
    fn is_terminated(&self) -> bool;
}

pub type DataChannelPtr = Box<dyn DataChannel>;

impl fmt::Debug for dyn DataChannel {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("name", &self.name())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Ring configuration published by the frontend
///
/// ```text
/// <frontend root>/ring-ref        grant reference of the shared ring page
/// <frontend root>/event-channel   event channel port bound to the ring
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    pub ring_ref: u32,
    pub port: u32,
}

impl RingConfig {
    pub const RING_REF: &'static str = "ring-ref";
    pub const EVENT_CHANNEL: &'static str = "event-channel";

    /// Reads the default `ring-ref`/`event-channel` pair under `root`.
    pub fn read(
        store: &XenStore,
        root: &str,
    ) -> Result<Self> {
        Self::read_with(store, root, Self::RING_REF, Self::EVENT_CHANNEL)
    }

    /// Reads a ring configuration stored under custom entry names, as used by
    /// devices with more than one ring.
    ///
    /// # Errors
    ///
    /// [`ChannelError::MissingConfig`] if an entry is absent, store errors
    /// otherwise.
    pub fn read_with(
        store: &XenStore,
        root: &str,
        ring_ref_key: &str,
        port_key: &str,
    ) -> Result<Self> {
        let ring_ref = read_required(store, &format!("{root}/{ring_ref_key}"))?;
        let port = read_required(store, &format!("{root}/{port_key}"))?;

        debug!(root, ring_ref, port, "Ring configuration read");
        Ok(Self { ring_ref, port })
    }
}

fn read_required(
    store: &XenStore,
    path: &str,
) -> Result<u32> {
    store.read_uint(path).map_err(|e| match e {
        Error::Store(StoreError::NotFound { path }) => ChannelError::MissingConfig { path }.into(),
        other => other,
    })
}
