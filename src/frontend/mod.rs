//! Frontend lifecycle state machine
//!
//! A [`FrontendHandler`] follows the xenbus handshake of one frontend device
//! and delegates the device specific work to a [`FrontendDevice`].

mod device;
mod handler;
mod state;


pub use device::*;
pub use handler::*;
pub use state::*;
