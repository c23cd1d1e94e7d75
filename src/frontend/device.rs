use crate::DataChannelPtr;
use crate::FrontendInfo;
use crate::Result;
use crate::XenStore;

/// View of the frontend handed to the device hooks
///
/// Channels added through [`FrontendContext::add_ring_buffer`] are committed to
/// the handler only if the hook returns `Ok`; a failing hook drops them.
pub struct FrontendContext<'a> {
    info: &'a FrontendInfo,
    store: &'a XenStore,
    added: &'a mut Vec<DataChannelPtr>,
}

impl<'a> FrontendContext<'a> {
    pub(crate) fn new(
        info: &'a FrontendInfo,
        store: &'a XenStore,
        added: &'a mut Vec<DataChannelPtr>,
    ) -> Self {
        Self { info, store, added }
    }

    pub fn info(&self) -> &FrontendInfo {
        self.info
    }

    pub fn dom_id(&self) -> u16 {
        self.info.dom_id
    }

    pub fn dev_id(&self) -> u16 {
        self.info.dev_id
    }

    /// Frontend root, where the frontend publishes its configuration.
    pub fn frontend_path(&self) -> &str {
        &self.info.frontend_path
    }

    pub fn backend_path(&self) -> &str {
        &self.info.backend_path
    }

    pub fn store(&self) -> &XenStore {
        self.store
    }

    /// Hands a bound channel over to the handler.
    pub fn add_ring_buffer(
        &mut self,
        channel: DataChannelPtr,
    ) {
        self.added.push(channel);
    }

    /// Channels added by the running hook so far.
    pub fn added_channels(&self) -> usize {
        self.added.len()
    }
}

/// Device specific part of a frontend handler
///
/// Only [`FrontendDevice::on_bind`] is mandatory: it runs when the frontend
/// reaches `Initialised`, reads the ring configuration and adds the bound
/// channels. The state hooks run before the handler writes the matching
/// backend state; returning an error moves the backend to `Closing`.
///
/// # Example
///
/// ```ignore
/// struct MyDevice;
///
/// impl FrontendDevice for MyDevice {
///     fn on_bind(&mut self, ctx: &mut FrontendContext<'_>) -> Result<()> {
///         let ring = RingConfig::read(ctx.store(), ctx.frontend_path())?;
///         let channel = MyRing::bind(ctx.dom_id(), ring)?;
///         ctx.add_ring_buffer(Box::new(channel));
///         Ok(())
///     }
/// }
/// ```
#[allow(unused_variables)]
pub trait FrontendDevice: Send + 'static {
    fn on_bind(
        &mut self,
        ctx: &mut FrontendContext<'_>,
    ) -> Result<()>;

    fn on_state_initializing(
        &mut self,
        ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    fn on_state_init_wait(
        &mut self,
        ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    fn on_state_initialized(
        &mut self,
        ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    fn on_state_connected(
        &mut self,
        ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    fn on_state_closing(
        &mut self,
        ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    fn on_state_closed(
        &mut self,
        ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    fn on_state_reconfiguring(
        &mut self,
        ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    fn on_state_reconfigured(
        &mut self,
        ctx: &mut FrontendContext<'_>,
    ) -> Result<()> {
        Ok(())
    }
}
