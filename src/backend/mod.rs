//! Backend registry
//!
//! A [`Backend`] owns the watch engine and one [`crate::FrontendHandler`] per
//! connected frontend. A housekeeping thread drops the frontends whose
//! channels terminated.

mod registry;


pub use registry::*;
