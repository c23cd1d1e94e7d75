//! the test_utils folder here will share utils or test components between
//! the unit tests of the backend modules
//!
//! - [`FakeChannel`]: data channel whose termination is driven by the test
//! - [`RecordingDevice`]: device recording every hook it ran
//! - [`wait_until`]: polls a condition while the dispatcher thread works
mod common;
mod device;

pub use common::*;
pub use device::*;
