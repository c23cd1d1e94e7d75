use std::fmt;

use crate::FrontendError;

/// Xenbus protocol state, stored as its decimal code in `<root>/state`
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XenbusState {
    Unknown = 0,
    Initialising = 1,
    /// Finished early initialisation, waiting for information from the peer
    InitWait = 2,
    /// Waiting for a connection from the peer
    Initialised = 3,
    Connected = 4,
    /// The device is being closed due to an error or an unplug event
    Closing = 5,
    Closed = 6,
    Reconfiguring = 7,
    Reconfigured = 8,
}

const STATE_NAMES: [&str; 9] = [
    "Unknown",
    "Initializing",
    "InitWait",
    "Initialized",
    "Connected",
    "Closing",
    "Closed",
    "Reconfiguring",
    "Reconfigured",
];

impl XenbusState {
    pub const fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for XenbusState {
    type Error = FrontendError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => XenbusState::Unknown,
            1 => XenbusState::Initialising,
            2 => XenbusState::InitWait,
            3 => XenbusState::Initialised,
            4 => XenbusState::Connected,
            5 => XenbusState::Closing,
            6 => XenbusState::Closed,
            7 => XenbusState::Reconfiguring,
            8 => XenbusState::Reconfigured,
            _ => return Err(FrontendError::InvalidState(value)),
        })
    }
}

impl fmt::Display for XenbusState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "[{}]", STATE_NAMES[*self as usize])
    }
}

/// Renders a raw state code for logs, `Error!!!` when out of range.
pub fn log_state(value: u32) -> String {
    match XenbusState::try_from(value) {
        Ok(state) => state.to_string(),
        Err(_) => "Error!!!".to_string(),
    }
}

/// Log prefix identifying a frontend: `Dom(<domId>/<devId>)`.
pub fn log_dom_id(
    dom_id: u16,
    dev_id: u16,
) -> String {
    format!("Dom({dom_id}/{dev_id})")
}
