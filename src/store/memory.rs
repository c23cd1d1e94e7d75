//! In-process store implementation.
//!
//! Keeps the whole tree in a `BTreeMap` keyed by absolute path and reports
//! changes of watched subtrees through a crossbeam channel, which is what
//! [`StoreConnection::read_watch`] blocks on.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam_channel::unbounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::debug;
use tracing::warn;

use super::is_subpath;
use super::StoreConnection;
use super::StoreEvent;
use super::StoreEventType;
use crate::Result;
use crate::StoreError;

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, String>,
    watches: BTreeSet<String>,
}

impl Tree {
    fn children(
        &self,
        path: &str,
    ) -> Vec<String> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.nodes
            .range::<str, _>((Bound::Excluded(prefix.as_str()), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn is_watched(
        &self,
        path: &str,
    ) -> bool {
        self.watches.iter().any(|w| is_subpath(w, path))
    }
}

/// Hierarchical key-value store living in the current process
#[derive(Debug)]
pub struct MemoryStore {
    tree: Mutex<Tree>,
    connected: AtomicBool,
    event_sender: Sender<StoreEvent>,
    event_receiver: Receiver<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (event_sender, event_receiver) = unbounded();
        Self {
            tree: Mutex::new(Tree::default()),
            connected: AtomicBool::new(true),
            event_sender,
            event_receiver,
        }
    }

    /// Drops the connection: every later operation fails with `Unavailable`.
    pub fn disconnect(&self) {
        warn!("Memory store disconnected");
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of change events not yet consumed by `read_watch`.
    pub fn pending_events(&self) -> usize {
        self.event_receiver.len()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store connection closed".into()).into())
        }
    }

    fn notify(
        &self,
        path: String,
        event_type: StoreEventType,
    ) {
        debug!(path = %path, ?event_type, "Store change");
        // Receiver is owned by self, the send can't fail.
        let _ = self.event_sender.send(StoreEvent { path, event_type });
    }
}

impl StoreConnection for MemoryStore {
    fn read(
        &self,
        path: &str,
    ) -> Result<String> {
        self.ensure_connected()?;
        self.tree.lock().nodes.get(path).cloned().ok_or_else(|| {
            StoreError::NotFound {
                path: path.to_string(),
            }
            .into()
        })
    }

    fn write(
        &self,
        path: &str,
        value: &str,
    ) -> Result<()> {
        self.ensure_connected()?;
        if !path.starts_with('/') {
            return Err(StoreError::NotFound {
                path: path.to_string(),
            }
            .into());
        }

        let watched = {
            let mut tree = self.tree.lock();
            let mut idx = 0;
            while let Some(pos) = path[idx + 1..].find('/') {
                idx += pos + 1;
                tree.nodes.entry(path[..idx].to_string()).or_default();
            }
            tree.nodes.insert(path.to_string(), value.to_string());
            tree.is_watched(path)
        };

        if watched {
            self.notify(path.to_string(), StoreEventType::Write);
        }
        Ok(())
    }

    fn remove(
        &self,
        path: &str,
    ) -> Result<()> {
        self.ensure_connected()?;

        let watched = {
            let mut tree = self.tree.lock();
            if tree.nodes.remove(path).is_none() {
                return Err(StoreError::NotFound {
                    path: path.to_string(),
                }
                .into());
            }
            let prefix = format!("{path}/");
            tree.nodes.retain(|key, _| !key.starts_with(&prefix));

            // Watches below the removed node are affected too.
            tree.is_watched(path) || tree.watches.iter().any(|w| w.starts_with(&prefix))
        };

        if watched {
            self.notify(path.to_string(), StoreEventType::Remove);
        }
        Ok(())
    }

    fn exists(
        &self,
        path: &str,
    ) -> Result<bool> {
        self.ensure_connected()?;
        Ok(self.tree.lock().nodes.contains_key(path))
    }

    fn list(
        &self,
        path: &str,
    ) -> Result<Vec<String>> {
        self.ensure_connected()?;
        let tree = self.tree.lock();
        if !tree.nodes.contains_key(path) {
            return Err(StoreError::NotFound {
                path: path.to_string(),
            }
            .into());
        }
        Ok(tree.children(path))
    }

    fn watch(
        &self,
        path: &str,
    ) -> Result<()> {
        self.ensure_connected()?;
        self.tree.lock().watches.insert(path.to_string());
        Ok(())
    }

    fn unwatch(
        &self,
        path: &str,
    ) -> Result<()> {
        self.ensure_connected()?;
        self.tree.lock().watches.remove(path);
        Ok(())
    }

    fn read_watch(
        &self,
        timeout: Duration,
    ) -> Result<Option<StoreEvent>> {
        self.ensure_connected()?;
        match self.event_receiver.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => {
                self.ensure_connected()?;
                Ok(None)
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(StoreError::Unavailable("event channel closed".into()).into())
            }
        }
    }
}
