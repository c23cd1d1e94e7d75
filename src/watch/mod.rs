//! Watch mechanism for XenStore entries
//!
//! [`WatchManager`] turns asynchronous store mutations into callback dispatch
//! on one dedicated thread:
//!
//! ```text
//! FrontendHandler ── set_watch / clear_watch ──► WatchTable
//!                                                   │
//! StoreConnection ── read_watch(poll_timeout) ──► Dispatcher Thread ──► callback()
//! ```
//!
//! Callbacks run one at a time, so every frontend state transition in the
//! process is serialized. A callback must not block, doing so stalls the
//! notifications of every other path.

mod manager;


pub use manager::*;
