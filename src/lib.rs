//! Backend framework for Xen paravirtualized split drivers
//!
//! - [`WatchManager`]: multiplexes XenStore change notifications onto one
//!   dispatcher thread
//! - [`FrontendHandler`]: follows the xenbus handshake of one frontend and
//!   drives a [`FrontendDevice`]
//! - [`Backend`]: registry of the frontends served by a backend domain

mod backend;
mod channel;
mod config;
mod errors;
mod frontend;
mod store;
mod utils;
mod watch;

pub use backend::*;
pub use channel::*;
pub use config::*;
pub use errors::*;
pub use frontend::*;
pub use store::*;
pub use watch::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
