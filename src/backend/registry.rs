use std::sync::Arc;
use std::sync::Weak;
use std::thread;
use std::thread::JoinHandle;

use crossbeam_channel::bounded;
use crossbeam_channel::tick;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::log_dom_id;
use crate::BackendConfig;
use crate::Error;
use crate::FrontendDevice;
use crate::FrontendError;
use crate::FrontendHandler;
use crate::FrontendInfo;
use crate::Result;
use crate::WatchManager;
use crate::XenStore;

/// Creates the device of every frontend added to a [`Backend`]
pub trait FrontendFactory: Send + Sync + 'static {
    type Device: FrontendDevice;

    fn create(
        &self,
        info: &FrontendInfo,
    ) -> Result<Self::Device>;
}

/// `(dom_id, dev_id)`
pub type FrontendKey = (u16, u16);

/// Read guard on a registered handler
///
/// Holds a registry shard lock: drop it before adding or removing frontends
/// from the same thread.
pub type FrontendRef<'a, D> = Ref<'a, FrontendKey, FrontendHandler<D>>;

struct BackendInner<F: FrontendFactory> {
    config: BackendConfig,
    factory: F,
    watches: WatchManager,
    frontends: DashMap<FrontendKey, FrontendHandler<F::Device>>,

    /// Housekeeping thread handle (None when not running)
    housekeeping_handle: Mutex<Option<JoinHandle<()>>>,

    /// Shutdown signal sender (None when not running)
    shutdown_tx: Mutex<Option<Sender<()>>>,
}

/// Registry of the frontends served by one backend domain
///
/// The registry owns every handler. Callers only borrow one through
/// [`Backend::frontend`], so removing a frontend drops its handler right away.
///
/// # Example
///
/// ```ignore
/// let config = BackendConfig::new()?.validate()?;
/// let backend = Backend::new(config, store, MyFactory);
/// backend.start()?;
///
/// let info = backend.add_frontend(1, 0)?;
/// if let Some(handler) = backend.frontend(info.dom_id, info.dev_id) {
///     println!("{:?}", handler.backend_state());
/// }
/// // ...
/// backend.stop();
/// ```
pub struct Backend<F: FrontendFactory> {
    inner: Arc<BackendInner<F>>,
}

impl<F: FrontendFactory> std::fmt::Debug for Backend<F> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("config", &self.inner.config)
            .field("frontends", &self.inner.frontends.len())
            .field("watches", &self.inner.watches)
            .finish()
    }
}

impl<F: FrontendFactory> Backend<F> {
    pub fn new(
        config: BackendConfig,
        store: XenStore,
        factory: F,
    ) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                watches: WatchManager::new(store, config.watch.clone()),
                config,
                factory,
                frontends: DashMap::new(),
                housekeeping_handle: Mutex::new(None),
                shutdown_tx: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn store(&self) -> &XenStore {
        self.inner.watches.store()
    }

    pub fn watches(&self) -> &WatchManager {
        &self.inner.watches
    }

    /// Starts the watch engine and the housekeeping thread.
    ///
    /// # Errors
    ///
    /// [`crate::WatchError::AlreadyRunning`] if the backend runs already.
    pub fn start(&self) -> Result<()> {
        let mut handle_guard = self.inner.housekeeping_handle.lock();
        if handle_guard.is_some() {
            return Err(crate::WatchError::AlreadyRunning.into());
        }

        let weak: Weak<BackendInner<F>> = Arc::downgrade(&self.inner);
        self.inner.watches.set_error_callback(move |e| {
            if let Some(inner) = weak.upgrade() {
                inner.on_watch_error(e);
            }
        });
        self.inner.watches.start()?;

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let interval = self.inner.config.backend.housekeeping_interval();
        let housekeeping_inner = Arc::downgrade(&self.inner);

        let handle = thread::Builder::new()
            .name("be-housekeeping".into())
            .spawn(move || run_housekeeping(housekeeping_inner, interval, shutdown_rx))
            .map_err(|e| {
                self.inner.watches.stop();
                Error::Fatal(format!("Can't spawn housekeeping thread: {e}"))
            })?;

        *handle_guard = Some(handle);
        *self.inner.shutdown_tx.lock() = Some(shutdown_tx);

        info!(
            dom_id = self.inner.config.backend.dom_id,
            device_class = %self.inner.config.backend.device_class,
            "Backend started"
        );
        Ok(())
    }

    /// Stops housekeeping, drops every frontend, then stops the watch engine.
    pub fn stop(&self) {
        self.inner.stop_housekeeping();
        self.inner.remove_all();
        self.inner.watches.stop();
        debug!("Backend stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.housekeeping_handle.lock().is_some() && self.inner.watches.is_running()
    }

    /// Creates the handler of a new frontend and starts following its state.
    ///
    /// # Errors
    ///
    /// [`FrontendError::AlreadyExists`] if the frontend is registered, factory
    /// and store errors otherwise.
    pub fn add_frontend(
        &self,
        dom_id: u16,
        dev_id: u16,
    ) -> Result<FrontendInfo> {
        match self.inner.frontends.entry((dom_id, dev_id)) {
            Entry::Occupied(_) => {
                warn!(frontend = %log_dom_id(dom_id, dev_id), "Frontend already exists");
                Err(FrontendError::AlreadyExists { dom_id, dev_id }.into())
            }
            Entry::Vacant(entry) => {
                let settings = &self.inner.config.backend;
                let info = FrontendInfo::new(settings.dom_id, &settings.device_class, dom_id, dev_id);
                let device = self.inner.factory.create(&info)?;
                let handler = FrontendHandler::new(info.clone(), device, self.inner.watches.clone())?;

                entry.insert(handler);
                info!(frontend = %log_dom_id(dom_id, dev_id), "New frontend");
                Ok(info)
            }
        }
    }

    /// Borrows a registered handler, see [`FrontendRef`].
    pub fn frontend(
        &self,
        dom_id: u16,
        dev_id: u16,
    ) -> Option<FrontendRef<'_, F::Device>> {
        self.inner.frontends.get(&(dom_id, dev_id))
    }

    pub fn frontend_count(&self) -> usize {
        self.inner.frontends.len()
    }

    /// Registered frontends, sorted by key.
    pub fn frontend_keys(&self) -> Vec<FrontendKey> {
        let mut keys: Vec<FrontendKey> = self.inner.frontends.iter().map(|entry| *entry.key()).collect();
        keys.sort_unstable();
        keys
    }

    /// Drops a frontend handler, returns false if it isn't registered.
    pub fn remove_frontend(
        &self,
        dom_id: u16,
        dev_id: u16,
    ) -> bool {
        self.inner.remove((dom_id, dev_id))
    }

    /// Drops every terminated frontend, returns how many were dropped.
    pub fn housekeeping(&self) -> usize {
        self.inner.housekeeping()
    }
}

impl<F: FrontendFactory> Drop for Backend<F> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_housekeeping<F: FrontendFactory>(
    inner: Weak<BackendInner<F>>,
    interval: std::time::Duration,
    shutdown_rx: Receiver<()>,
) {
    debug!("Housekeeping thread started");
    let ticker = tick(interval);

    loop {
        crossbeam_channel::select! {
            recv(ticker) -> _ => {
                match inner.upgrade() {
                    Some(inner) => {
                        inner.housekeeping();
                    }
                    None => break,
                }
            }
            recv(shutdown_rx) -> _ => {
                debug!("Housekeeping received shutdown signal");
                break;
            }
        }
    }

    debug!("Housekeeping thread stopped");
}

impl<F: FrontendFactory> BackendInner<F> {
    fn housekeeping(&self) -> usize {
        let terminated: Vec<FrontendKey> = self
            .frontends
            .iter()
            .filter(|entry| entry.value().is_terminated())
            .map(|entry| *entry.key())
            .collect();

        for key in &terminated {
            self.notify_terminated(*key);
        }
        terminated.len()
    }

    fn notify_terminated(
        &self,
        key: FrontendKey,
    ) {
        if self.remove(key) {
            info!(frontend = %log_dom_id(key.0, key.1), "Terminated frontend removed");
        }
    }

    fn remove(
        &self,
        key: FrontendKey,
    ) -> bool {
        // The shard lock is released before the handler drops.
        self.frontends.remove(&key).is_some()
    }

    fn remove_all(&self) {
        let keys: Vec<FrontendKey> = self.frontends.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            self.remove(key);
        }
    }

    fn stop_housekeeping(&self) {
        // Handle lock first, start() holds it while installing the sender.
        let handle = {
            let mut handle_guard = self.housekeeping_handle.lock();
            if let Some(tx) = self.shutdown_tx.lock().take() {
                let _ = tx.send(());
            }
            handle_guard.take()
        };

        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Housekeeping thread panicked");
            }
        }
    }

    /// Engine lost its store connection: nothing can be followed any more.
    fn on_watch_error(
        &self,
        e: Error,
    ) {
        error!("Watch engine failed, removing all frontends: {}", e);
        self.stop_housekeeping();
        self.remove_all();
    }
}
