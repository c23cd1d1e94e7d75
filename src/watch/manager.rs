//! Watch Manager multiplexing XenStore change notifications
//!
//! # Architecture
//!
//! ```text
//! set_watch()/clear_watch() (any thread)
//!        │  table lock (mutation only)
//!        ▼
//! ┌──────────────────────────────┐
//! │ WatchTable                   │
//! │  - watches: path -> callback │
//! │  - init_notify: FIFO of path │
//! └──────────────┬───────────────┘
//!                │ lookup, lock released before invoke
//!                ▼
//! Dispatcher Thread:
//!   init_notify.pop() ─► callback()
//!   read_watch(poll_timeout) ─► matching paths (registration order) ─► callback()
//! ```
//!
//! # Guarantees
//!
//! - One dispatcher thread: callbacks never run concurrently with each other.
//! - The table lock is never held while a callback runs, so callbacks may call
//!   `set_watch`/`clear_watch` themselves.
//! - `clear_watch` from another thread waits for an in-flight callback, after
//!   it returns the cleared callback is never invoked again.
//! - Registration is serialized with the store's watch/unwatch call, so the
//!   table never holds a path the store stopped reporting.
//! - Losing the store connection stops the dispatcher and reports the error
//!   once through the error callback.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::thread::ThreadId;

use crossbeam_channel::bounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::TryRecvError;
use parking_lot::Mutex;
use parking_lot::ReentrantMutex;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use crate::utils::panic_message;
use crate::Error;
use crate::Result;
use crate::StoreError;
use crate::StoreEvent;
use crate::WatchConfig;
use crate::WatchError;
use crate::XenStore;

/// Callback invoked when a watched path changes
pub type WatchCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback receiving the error that stopped the dispatcher
pub type ErrorCallback = Box<dyn FnOnce(Error) + Send>;

/// Identifies one `set_watch` call
///
/// Replacing the callback of a path issues a new token, so an owner holding
/// an old token can't clear the replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken(u64);

/// Registered watch
struct Watch {
    /// Position in registration order, kept across callback replacement
    seq: u64,
    token: WatchToken,
    callback: WatchCallback,
    /// Path is queued for its synthetic initial dispatch
    init_notify_pending: bool,
}

#[derive(Default)]
struct WatchTable {
    watches: HashMap<String, Watch>,
    init_notify: VecDeque<String>,
    next_seq: u64,
    next_token: u64,
}

impl WatchTable {
    fn pop_init_notify(&mut self) -> Option<String> {
        let path = self.init_notify.pop_front()?;
        if let Some(watch) = self.watches.get_mut(&path) {
            watch.init_notify_pending = false;
        }
        Some(path)
    }
}

/// Internal state of WatchManager
struct WatchManagerInner {
    store: XenStore,

    /// Watches and pending initial notifications
    table: Mutex<WatchTable>,

    /// Held by the dispatcher while a callback runs
    dispatch_lock: ReentrantMutex<()>,

    /// Serializes the table update with the store's watch/unwatch call
    registration: Mutex<()>,

    /// Id of the dispatcher thread while it runs
    dispatch_thread: Mutex<Option<ThreadId>>,

    /// Dispatcher thread handle (None when not running)
    thread_handle: Mutex<Option<JoinHandle<()>>>,

    /// Shutdown signal sender (None when not running)
    shutdown_tx: Mutex<Option<Sender<()>>>,

    running: AtomicBool,

    error_callback: Mutex<Option<ErrorCallback>>,

    config: WatchConfig,
}

impl std::fmt::Debug for WatchManagerInner {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatchManagerInner")
            .field("watches", &self.table.lock().watches.len())
            .field("running", &self.running)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// XenStore watch multiplexer with a single dispatcher thread
///
/// Cloning is cheap, all clones share the same watch table and dispatcher.
///
/// # Example
///
/// ```ignore
/// let store = XenStore::new(Arc::new(MemoryStore::new()));
/// let manager = WatchManager::new(store.clone(), WatchConfig::default())
///     .with_error_callback(|e| eprintln!("watches stopped: {e}"));
/// manager.start()?;
///
/// manager.set_watch("/local/domain/1/device/vif/0/state", Arc::new(|| {
///     println!("state changed");
/// }), true)?;
///
/// manager.stop();
/// ```
#[derive(Debug, Clone)]
pub struct WatchManager {
    inner: Arc<WatchManagerInner>,
}

impl WatchManager {
    pub fn new(
        store: XenStore,
        config: WatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WatchManagerInner {
                store,
                table: Mutex::new(WatchTable::default()),
                dispatch_lock: ReentrantMutex::new(()),
                registration: Mutex::new(()),
                dispatch_thread: Mutex::new(None),
                thread_handle: Mutex::new(None),
                shutdown_tx: Mutex::new(None),
                running: AtomicBool::new(false),
                error_callback: Mutex::new(None),
                config,
            }),
        }
    }

    /// Installs the callback receiving the error that stops the dispatcher.
    pub fn with_error_callback<F>(
        self,
        callback: F,
    ) -> Self
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.set_error_callback(callback);
        self
    }

    pub fn set_error_callback<F>(
        &self,
        callback: F,
    ) where
        F: FnOnce(Error) + Send + 'static,
    {
        *self.inner.error_callback.lock() = Some(Box::new(callback));
    }

    pub fn store(&self) -> &XenStore {
        &self.inner.store
    }

    /// Start the background dispatcher thread
    ///
    /// Can be called again after the dispatcher stopped on a connection error.
    ///
    /// # Errors
    ///
    /// [`WatchError::AlreadyRunning`] if the dispatcher is running.
    pub fn start(&self) -> Result<()> {
        let mut handle_guard = self.inner.thread_handle.lock();

        if let Some(handle) = handle_guard.take() {
            if self.inner.running.load(Ordering::SeqCst) {
                *handle_guard = Some(handle);
                return Err(WatchError::AlreadyRunning.into());
            }
            // Dispatcher exited on its own, reap it before restarting.
            if handle.join().is_err() {
                error!("Watch dispatcher thread panicked");
            }
        }

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let inner = self.inner.clone();

        self.inner.running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("xs-watch".into())
            .spawn(move || inner.run(shutdown_rx))
            .map_err(|e| {
                self.inner.running.store(false, Ordering::SeqCst);
                Error::Fatal(format!("Can't spawn watch dispatcher: {e}"))
            })?;

        *handle_guard = Some(handle);
        *self.inner.shutdown_tx.lock() = Some(shutdown_tx);
        Ok(())
    }

    /// Stop the background dispatcher thread and drop all watches
    ///
    /// Waits for an in-flight callback to finish. When called from a callback
    /// the dispatcher only gets signalled, it exits once the callback returns.
    ///
    /// Calling `stop()` when no dispatcher is running only clears the watches.
    pub fn stop(&self) {
        if let Some(tx) = self.inner.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }

        if self.inner.is_dispatch_thread() {
            debug!("Watch dispatcher stop requested from a callback");
        } else {
            let handle = self.inner.thread_handle.lock().take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!("Watch dispatcher thread panicked");
                }
            }
        }

        self.inner.clear_watches();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Sets watch for XenStore entry change
    ///
    /// Exactly one callback is kept per path: registering an existing path
    /// replaces its callback. The returned token identifies this
    /// registration for [`WatchManager::clear_watch_token`].
    ///
    /// # Arguments
    ///
    /// * `path` - Entry to watch, changes below it are reported too
    /// * `callback` - Invoked on the dispatcher thread
    /// * `init_notify` - Invoke the callback once after registration even if
    ///   nothing changes
    ///
    /// # Errors
    ///
    /// [`WatchError::InvalidPath`] for an empty path, store errors if the
    /// watch can't be installed.
    pub fn set_watch(
        &self,
        path: &str,
        callback: WatchCallback,
        init_notify: bool,
    ) -> Result<WatchToken> {
        if path.is_empty() {
            return Err(WatchError::InvalidPath.into());
        }

        // Held until the entry is in the table, so a concurrent clear can't
        // unwatch the store between the check and the insert.
        let _registration = self.inner.registration.lock();

        let registered = self.inner.table.lock().watches.contains_key(path);
        if !registered {
            self.inner.store.connection().watch(path)?;
        }

        let mut table = self.inner.table.lock();
        let table = &mut *table;

        let token = WatchToken(table.next_token);
        table.next_token += 1;

        if let Some(watch) = table.watches.get_mut(path) {
            watch.callback = callback;
            watch.token = token;
        } else {
            let seq = table.next_seq;
            table.next_seq += 1;
            table.watches.insert(
                path.to_string(),
                Watch {
                    seq,
                    token,
                    callback,
                    init_notify_pending: false,
                },
            );
        }

        if init_notify {
            let limit = self.inner.config.init_notify_queue_limit;
            let queued = table.init_notify.len();
            if let Some(watch) = table.watches.get_mut(path) {
                if watch.init_notify_pending {
                    trace!(path, "Initial notification already queued");
                } else if queued >= limit {
                    warn!(path, limit, "Init notify queue full, initial notification dropped");
                } else {
                    watch.init_notify_pending = true;
                    table.init_notify.push_back(path.to_string());
                }
            }
        }

        debug!(path, init_notify, "Watch set");
        Ok(token)
    }

    /// Clears watch for XenStore entry change
    ///
    /// Clearing a path that isn't watched is a no-op. Safe to call from any
    /// callback, including the one registered for `path`.
    pub fn clear_watch(
        &self,
        path: &str,
    ) {
        self.inner.remove_watch(path, None);
    }

    /// Clears the watch of `path` only if it is still the registration
    /// identified by `token`.
    ///
    /// Returns false, leaving the table untouched, when the path was
    /// registered again since. Waits for an in-flight callback like
    /// [`WatchManager::clear_watch`].
    pub fn clear_watch_token(
        &self,
        path: &str,
        token: WatchToken,
    ) -> bool {
        self.inner.remove_watch(path, Some(token))
    }

    pub fn is_watched(
        &self,
        path: &str,
    ) -> bool {
        self.inner.table.lock().watches.contains_key(path)
    }

    /// Get the number of registered watches
    ///
    /// This is primarily for testing and monitoring purposes.
    pub fn watch_count(&self) -> usize {
        self.inner.table.lock().watches.len()
    }

    /// Get the number of paths waiting for their initial notification
    pub fn pending_init_notify(&self) -> usize {
        self.inner.table.lock().init_notify.len()
    }
}

/// Marks the dispatcher stopped when `run` returns or unwinds
struct DispatchExit<'a> {
    inner: &'a WatchManagerInner,
}

impl Drop for DispatchExit<'_> {
    fn drop(&mut self) {
        *self.inner.dispatch_thread.lock() = None;
        self.inner.running.store(false, Ordering::SeqCst);
    }
}

impl WatchManagerInner {
    fn run(
        &self,
        shutdown_rx: Receiver<()>,
    ) {
        *self.dispatch_thread.lock() = Some(thread::current().id());
        let _exit = DispatchExit { inner: self };
        debug!("Watch dispatcher thread started");

        let timeout = self.config.poll_timeout();
        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => {
                    debug!("Watch dispatcher received shutdown signal");
                    break;
                }
                Err(TryRecvError::Empty) => {}
            }

            let init_path = self.table.lock().pop_init_notify();
            if let Some(path) = init_path {
                self.dispatch_path(&path);
                continue;
            }

            match self.store.connection().read_watch(timeout) {
                Ok(Some(event)) => self.dispatch_event(&event),
                Ok(None) => {}
                Err(Error::Store(StoreError::MalformedEvent(e))) => {
                    warn!("Skipping malformed watch event: {}", e);
                }
                Err(e) => {
                    error!("Watch dispatcher stopped: {}", e);
                    self.report_error(e);
                    break;
                }
            }
        }

        debug!("Watch dispatcher thread stopped");
    }

    fn is_dispatch_thread(&self) -> bool {
        *self.dispatch_thread.lock() == Some(thread::current().id())
    }

    fn report_error(
        &self,
        e: Error,
    ) {
        let callback = self.error_callback.lock().take();
        match callback {
            Some(callback) => callback(e),
            None => warn!("No error callback installed, watch error dropped"),
        }
    }

    /// Dispatch a store event to every watch it matches
    fn dispatch_event(
        &self,
        event: &StoreEvent,
    ) {
        if !event.path.starts_with('/') {
            warn!(path = %event.path, "Skipping watch event with relative path");
            return;
        }

        // Initial notifications queued while we were waiting go first.
        loop {
            let init_path = self.table.lock().pop_init_notify();
            match init_path {
                Some(path) => self.dispatch_path(&path),
                None => break,
            }
        }

        let paths: Vec<String> = {
            let table = self.table.lock();
            let mut matched: Vec<(u64, &String)> = table
                .watches
                .iter()
                .filter(|(path, _)| event.matches(path))
                .map(|(path, watch)| (watch.seq, path))
                .collect();
            matched.sort_unstable_by_key(|(seq, _)| *seq);
            matched.into_iter().map(|(_, path)| path.clone()).collect()
        };

        trace!(
            path = %event.path,
            event_type = ?event.event_type,
            watches = paths.len(),
            "Event dispatched"
        );

        for path in paths {
            self.dispatch_path(&path);
        }
    }

    /// Invokes the callback of `path` if it is still registered
    fn dispatch_path(
        &self,
        path: &str,
    ) {
        let _dispatch = self.dispatch_lock.lock();

        let callback = match self.table.lock().watches.get(path) {
            Some(watch) => watch.callback.clone(),
            None => {
                trace!(path, "Watch cleared before dispatch");
                return;
            }
        };

        trace!(path, "Dispatch watch");
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback())) {
            error!(path, "Watch callback panicked: {}", panic_message(payload.as_ref()));
        }
    }

    fn remove_watch(
        &self,
        path: &str,
        token: Option<WatchToken>,
    ) -> bool {
        // Blocks while another thread's callback is running.
        let _dispatch = self.dispatch_lock.lock();
        let _registration = self.registration.lock();

        let removed = {
            let mut table = self.table.lock();
            let owned = match (table.watches.get(path), token) {
                (Some(watch), Some(token)) => watch.token == token,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if owned {
                table.watches.remove(path);
                table.init_notify.retain(|p| p != path);
            }
            owned
        };

        if removed {
            if let Err(e) = self.store.connection().unwatch(path) {
                debug!(path, "Unwatch failed: {}", e);
            }
            debug!(path, "Watch cleared");
        } else {
            trace!(path, "Clear of unknown or replaced watch ignored");
        }
        removed
    }

    fn clear_watches(&self) {
        let _registration = self.registration.lock();
        let paths: Vec<String> = {
            let mut table = self.table.lock();
            table.init_notify.clear();
            table.watches.drain().map(|(path, _)| path).collect()
        };

        for path in &paths {
            if let Err(e) = self.store.connection().unwatch(path) {
                debug!(path = %path, "Unwatch failed: {}", e);
            }
        }

        if !paths.is_empty() {
            debug!(count = paths.len(), "Watches cleared");
        }
    }
}
