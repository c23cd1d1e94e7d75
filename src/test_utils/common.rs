use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use crate::DataChannel;
use crate::MemoryStore;
use crate::WatchConfig;
use crate::WatchManager;
use crate::XenStore;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until(
    timeout: Duration,
    mut cond: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn fast_watch_config() -> WatchConfig {
    WatchConfig {
        poll_timeout_ms: 10,
        ..WatchConfig::default()
    }
}

pub fn memory_store() -> (Arc<MemoryStore>, XenStore) {
    let mem = Arc::new(MemoryStore::new());
    let store = XenStore::new(mem.clone());
    (mem, store)
}

/// Memory store plus a started watch manager polling every 10ms
pub fn started_watch_manager() -> (Arc<MemoryStore>, WatchManager) {
    let (mem, store) = memory_store();
    let manager = WatchManager::new(store, fast_watch_config());
    manager.start().expect("watch manager should start");
    (mem, manager)
}

/// Counts invocations of a watch callback
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn callback(&self) -> crate::WatchCallback {
        let counter = self.0.clone();
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handle to the flags of a [`FakeChannel`] kept by the test
#[derive(Clone, Default)]
pub struct ChannelTracker {
    terminated: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
}

impl ChannelTracker {
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn channel(
        &self,
        name: &str,
    ) -> FakeChannel {
        FakeChannel {
            name: name.to_string(),
            tracker: self.clone(),
        }
    }
}

pub struct FakeChannel {
    name: String,
    tracker: ChannelTracker,
}

impl DataChannel for FakeChannel {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_terminated(&self) -> bool {
        self.tracker.terminated.load(Ordering::SeqCst)
    }
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        self.tracker.dropped.store(true, Ordering::SeqCst);
    }
}

/// Backend config with a 20ms housekeeping pass and fast watch polling
pub fn fast_backend_config() -> crate::BackendConfig {
    crate::BackendConfig {
        backend: crate::BackendSettings {
            housekeeping_interval_ms: 20,
            ..crate::BackendSettings::default()
        },
        watch: fast_watch_config(),
    }
}
