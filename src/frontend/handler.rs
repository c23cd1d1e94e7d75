//! Frontend lifecycle handler
//!
//! One handler drives the xenbus handshake of one frontend device. It watches
//! the frontend state entry, runs the device hook of every new state and
//! answers with the backend state:
//!
//! ```text
//! frontend state   hook                                   backend write
//! Initialising     on_state_initializing                  InitWait
//! InitWait         on_state_init_wait                     -
//! Initialised      on_state_initialized, on_bind          Connected (Closing on failure)
//! Connected        on_state_connected                     -
//! Closing          on_state_closing, drop channels        Closing, Closed
//! Closed           on_state_closed                        InitWait
//! Reconfiguring    on_state_reconfiguring                 Reconfigured
//! Reconfigured     on_state_reconfigured                  -
//! ```
//!
//! Transitions run on the watch dispatcher thread only. The backend state and
//! the channel list sit behind a separate lock so the registry can poll
//! [`FrontendHandler::is_terminated`] from its housekeeping thread.

use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::backend_path;
use crate::frontend_path;
use crate::log_dom_id;
use crate::log_state;
use crate::state_path;
use crate::DataChannelPtr;
use crate::FrontendContext;
use crate::FrontendDevice;
use crate::Result;
use crate::WatchManager;
use crate::WatchToken;
use crate::XenStore;
use crate::XenbusState;

/// Identity and store paths of one frontend device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendInfo {
    pub backend_dom_id: u16,
    pub device_class: String,
    pub dom_id: u16,
    pub dev_id: u16,
    pub frontend_path: String,
    pub backend_path: String,
    pub frontend_state_path: String,
    pub backend_state_path: String,
    pub log_id: String,
}

impl FrontendInfo {
    pub fn new(
        backend_dom_id: u16,
        device_class: &str,
        dom_id: u16,
        dev_id: u16,
    ) -> Self {
        let frontend_path = frontend_path(dom_id, device_class, dev_id);
        let backend_path = backend_path(backend_dom_id, device_class, dom_id, dev_id);
        Self {
            backend_dom_id,
            device_class: device_class.to_string(),
            dom_id,
            dev_id,
            frontend_state_path: state_path(&frontend_path),
            backend_state_path: state_path(&backend_path),
            frontend_path,
            backend_path,
            log_id: log_dom_id(dom_id, dev_id),
        }
    }
}

/// State read by the registry while transitions are running
struct SharedState {
    backend_state: XenbusState,
    frontend_state: XenbusState,
    channels: Vec<DataChannelPtr>,
    terminated: bool,
}

struct HandlerInner<D> {
    info: FrontendInfo,
    store: XenStore,
    watches: WatchManager,
    /// Only locked on the dispatcher thread
    device: Mutex<D>,
    shared: Mutex<SharedState>,
}

/// Handles one connected frontend
///
/// Dropping the handler clears its watch first, so no transition runs on a
/// half destroyed handler, then releases the channels. A newer handler
/// watching the same frontend keeps its watch.
pub struct FrontendHandler<D: FrontendDevice> {
    inner: Arc<HandlerInner<D>>,
    watch: WatchToken,
}

impl<D: FrontendDevice> std::fmt::Debug for FrontendHandler<D> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("FrontendHandler")
            .field("frontend", &self.inner.info.log_id)
            .field("backend_state", &shared.backend_state)
            .field("frontend_state", &shared.frontend_state)
            .field("channels", &shared.channels.len())
            .finish()
    }
}

impl<D: FrontendDevice> FrontendHandler<D> {
    /// Creates the handler, publishes `Initialising` as backend state and
    /// starts watching the frontend state.
    ///
    /// The watch is registered with an initial notification, so a frontend
    /// that is already past `Unknown` is handled right away.
    pub fn new(
        info: FrontendInfo,
        device: D,
        watches: WatchManager,
    ) -> Result<Self> {
        let inner = Arc::new(HandlerInner {
            store: watches.store().clone(),
            info,
            watches,
            device: Mutex::new(device),
            shared: Mutex::new(SharedState {
                backend_state: XenbusState::Initialising,
                frontend_state: XenbusState::Unknown,
                channels: Vec::new(),
                terminated: false,
            }),
        });

        inner.write_backend_state(XenbusState::Initialising)?;

        let weak: Weak<HandlerInner<D>> = Arc::downgrade(&inner);
        let watch = inner.watches.set_watch(
            &inner.info.frontend_state_path,
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.frontend_state_changed();
                }
            }),
            true,
        )?;

        info!(frontend = %inner.info.log_id, path = %inner.info.frontend_path, "Frontend handler created");
        Ok(Self { inner, watch })
    }

    pub fn info(&self) -> &FrontendInfo {
        &self.inner.info
    }

    pub fn dom_id(&self) -> u16 {
        self.inner.info.dom_id
    }

    pub fn dev_id(&self) -> u16 {
        self.inner.info.dev_id
    }

    pub fn store(&self) -> &XenStore {
        &self.inner.store
    }

    pub fn backend_state(&self) -> XenbusState {
        self.inner.shared.lock().backend_state
    }

    /// Last frontend state observed in the store.
    pub fn frontend_state(&self) -> XenbusState {
        self.inner.shared.lock().frontend_state
    }

    pub fn channel_count(&self) -> usize {
        self.inner.shared.lock().channels.len()
    }

    /// Runs `f` with the device, for inspection outside of the hooks.
    ///
    /// Must not be called from a device hook.
    pub fn with_device<R>(
        &self,
        f: impl FnOnce(&D) -> R,
    ) -> R {
        f(&self.inner.device.lock())
    }

    /// Check if frontend is terminated
    ///
    /// True once every held channel reports itself terminated, or when the
    /// frontend reached `Closed` and no channel is held. Only the channels
    /// held right now count: a frontend that connected, closed and released
    /// its channels is terminated as soon as its state is `Closed`.
    pub fn is_terminated(&self) -> bool {
        let mut shared = self.inner.shared.lock();

        let terminated = if shared.channels.is_empty() {
            shared.frontend_state == XenbusState::Closed
        } else {
            shared.channels.iter().all(|channel| channel.is_terminated())
        };

        if terminated && !shared.terminated {
            info!(frontend = %self.inner.info.log_id, "Frontend terminated");
        }
        shared.terminated = terminated;
        terminated
    }
}

impl<D: FrontendDevice> Drop for FrontendHandler<D> {
    fn drop(&mut self) {
        let path = &self.inner.info.frontend_state_path;
        if !self.inner.watches.clear_watch_token(path, self.watch) {
            debug!(frontend = %self.inner.info.log_id, "Frontend state watch owned by a newer handler");
        }
        self.inner.release_channels();
        debug!(frontend = %self.inner.info.log_id, "Frontend handler destroyed");
    }
}

impl<D: FrontendDevice> HandlerInner<D> {
    /// Watch callback of the frontend state entry
    fn frontend_state_changed(&self) {
        let value = match self.store.read_uint(&self.info.frontend_state_path) {
            Ok(value) => value,
            Err(e) if e.is_not_found() => {
                debug!(frontend = %self.info.log_id, "Frontend state entry is absent");
                return;
            }
            Err(e) => {
                error!(frontend = %self.info.log_id, "Can't read frontend state: {}", e);
                return;
            }
        };

        let state = match XenbusState::try_from(value) {
            Ok(state) => state,
            Err(e) => {
                warn!(frontend = %self.info.log_id, "Ignoring frontend state {}: {}", log_state(value), e);
                return;
            }
        };

        {
            let mut shared = self.shared.lock();
            if shared.frontend_state == state {
                trace!(frontend = %self.info.log_id, %state, "Frontend state unchanged");
                return;
            }
            shared.frontend_state = state;
        }

        info!(frontend = %self.info.log_id, "Frontend state changed to: {}", state);
        self.on_frontend_state_changed(state);
    }

    fn on_frontend_state_changed(
        &self,
        state: XenbusState,
    ) {
        let result = match state {
            XenbusState::Initialising => self
                .run_hook(|device, ctx| device.on_state_initializing(ctx))
                .map(|()| self.set_backend_state(XenbusState::InitWait)),
            XenbusState::InitWait => self.run_hook(|device, ctx| device.on_state_init_wait(ctx)),
            XenbusState::Initialised => self
                .run_hook(|device, ctx| device.on_state_initialized(ctx))
                .and_then(|()| self.run_hook(|device, ctx| device.on_bind(ctx)))
                .map(|()| self.set_backend_state(XenbusState::Connected)),
            XenbusState::Connected => self.run_hook(|device, ctx| device.on_state_connected(ctx)),
            XenbusState::Closing => {
                // Teardown runs whatever the hook returns.
                if let Err(e) = self.run_hook(|device, ctx| device.on_state_closing(ctx)) {
                    error!(frontend = %self.info.log_id, "Closing hook failed: {}", e);
                }
                self.release_channels();
                self.set_backend_state(XenbusState::Closing);
                self.set_backend_state(XenbusState::Closed);
                Ok(())
            }
            XenbusState::Closed => self
                .run_hook(|device, ctx| device.on_state_closed(ctx))
                .map(|()| self.set_backend_state(XenbusState::InitWait)),
            XenbusState::Reconfiguring => self
                .run_hook(|device, ctx| device.on_state_reconfiguring(ctx))
                .map(|()| self.set_backend_state(XenbusState::Reconfigured)),
            XenbusState::Reconfigured => {
                self.run_hook(|device, ctx| device.on_state_reconfigured(ctx))
            }
            XenbusState::Unknown => {
                warn!(frontend = %self.info.log_id, "Unmodeled frontend state: {}", state);
                Ok(())
            }
        };

        if let Err(e) = result {
            self.on_error(state, e);
        }
    }

    /// Runs one device hook, committing the channels it added on success.
    fn run_hook<F>(
        &self,
        hook: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut D, &mut FrontendContext<'_>) -> Result<()>,
    {
        let mut added = Vec::new();
        let result = {
            let mut device = self.device.lock();
            let mut ctx = FrontendContext::new(&self.info, &self.store, &mut added);
            hook(&mut *device, &mut ctx)
        };

        match result {
            Ok(()) => {
                if !added.is_empty() {
                    debug!(frontend = %self.info.log_id, count = added.len(), "Channels added");
                    self.shared.lock().channels.extend(added);
                }
                Ok(())
            }
            Err(e) => {
                if !added.is_empty() {
                    warn!(
                        frontend = %self.info.log_id,
                        count = added.len(),
                        "Discarding channels added before the failure"
                    );
                }
                Err(e)
            }
        }
    }

    fn on_error(
        &self,
        state: XenbusState,
        e: crate::Error,
    ) {
        error!(frontend = %self.info.log_id, "Handling frontend state {} failed: {}", state, e);

        self.release_channels();
        self.set_backend_state(XenbusState::Closing);
    }

    fn release_channels(&self) {
        let channels = std::mem::take(&mut self.shared.lock().channels);
        if !channels.is_empty() {
            debug!(frontend = %self.info.log_id, count = channels.len(), "Releasing channels");
        }
        // Dropped outside of the lock, channel teardown may block on its worker.
        drop(channels);
    }

    fn set_backend_state(
        &self,
        state: XenbusState,
    ) {
        if let Err(e) = self.write_backend_state(state) {
            error!(frontend = %self.info.log_id, "Can't set backend state {}: {}", state, e);
        }
    }

    /// Writes the backend state entry and its mirror as one step
    fn write_backend_state(
        &self,
        state: XenbusState,
    ) -> Result<()> {
        let mut shared = self.shared.lock();
        self.store.write_uint(&self.info.backend_state_path, state.code())?;

        if shared.backend_state != state {
            info!(frontend = %self.info.log_id, "Set backend state to: {}", state);
        }
        shared.backend_state = state;
        Ok(())
    }
}
