use std::sync::Arc;

use parking_lot::Mutex;

use super::ChannelTracker;
use crate::ChannelError;
use crate::FrontendContext;
use crate::FrontendDevice;
use crate::RingConfig;
use crate::Result;

/// Hooks run by a [`RecordingDevice`], shared with the test
pub type HookLog = Arc<Mutex<Vec<&'static str>>>;

/// Device binding one [`crate::test_utils::FakeChannel`] per tracker
///
/// `on_bind` reads the ring configuration first, so a frontend that didn't
/// publish it fails the bind. With `fail_after_bind` the device adds its
/// channels and then fails.
pub struct RecordingDevice {
    pub hooks: HookLog,
    pub trackers: Vec<ChannelTracker>,
    pub fail_after_bind: bool,
    pub fail_hook: Option<&'static str>,
}

impl RecordingDevice {
    pub fn new(trackers: Vec<ChannelTracker>) -> Self {
        Self {
            hooks: Arc::new(Mutex::new(Vec::new())),
            trackers,
            fail_after_bind: false,
            fail_hook: None,
        }
    }

    pub fn hook_log(&self) -> HookLog {
        self.hooks.clone()
    }

    fn record(
        &self,
        hook: &'static str,
    ) -> Result<()> {
        self.hooks.lock().push(hook);
        if self.fail_hook == Some(hook) {
            return Err(ChannelError::BindFailure(format!("{hook} failed on purpose")).into());
        }
        Ok(())
    }
}

impl FrontendDevice for RecordingDevice {
    fn on_bind(
        &mut self,
        ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        self.record("on_bind")?;
        let ring = RingConfig::read(ctx.store(), ctx.frontend_path())?;

        for (idx, tracker) in self.trackers.iter().enumerate() {
            let name = format!("ring{}@{}:{}", idx, ring.ring_ref, ring.port);
            ctx.add_ring_buffer(Box::new(tracker.channel(&name)));
        }

        if self.fail_after_bind {
            return Err(ChannelError::BindFailure("failed after adding channels".into()).into());
        }
        Ok(())
    }

    fn on_state_initializing(
        &mut self,
        _ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        self.record("on_state_initializing")
    }

    fn on_state_init_wait(
        &mut self,
        _ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        self.record("on_state_init_wait")
    }

    fn on_state_initialized(
        &mut self,
        _ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        self.record("on_state_initialized")
    }

    fn on_state_connected(
        &mut self,
        _ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        self.record("on_state_connected")
    }

    fn on_state_closing(
        &mut self,
        _ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        self.record("on_state_closing")
    }

    fn on_state_closed(
        &mut self,
        _ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        self.record("on_state_closed")
    }

    fn on_state_reconfiguring(
        &mut self,
        _ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        self.record("on_state_reconfiguring")
    }

    fn on_state_reconfigured(
        &mut self,
        _ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        self.record("on_state_reconfigured")
    }
}

/// Builds one [`RecordingDevice`] with a single channel per frontend and keeps
/// the channel trackers for the test.
#[derive(Default)]
pub struct RecordingFactory {
    pub trackers: Mutex<std::collections::HashMap<(u16, u16), ChannelTracker>>,
    pub fail: bool,
}

impl RecordingFactory {
    pub fn tracker(
        &self,
        dom_id: u16,
        dev_id: u16,
    ) -> ChannelTracker {
        self.trackers.lock().get(&(dom_id, dev_id)).cloned().unwrap_or_default()
    }
}

impl crate::FrontendFactory for RecordingFactory {
    type Device = RecordingDevice;

    fn create(
        &self,
        info: &crate::FrontendInfo,
    ) -> Result<Self::Device> {
        if self.fail {
            return Err(crate::FrontendError::HookFailed {
                hook: "create",
                reason: "factory refused".into(),
            }
            .into());
        }
        let tracker = ChannelTracker::default();
        self.trackers.lock().insert((info.dom_id, info.dev_id), tracker.clone());
        Ok(RecordingDevice::new(vec![tracker]))
    }
}
