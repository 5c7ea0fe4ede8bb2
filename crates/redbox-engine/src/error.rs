//! Error types for the driver boundary and the session lifecycle.

use thiserror::Error;

use crate::session::SessionState;

/// Status codes reported by the vendor driver.
///
/// Discriminants follow the driver API's numeric `ASE_*` codes so they can be
/// logged next to vendor documentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("hardware input or output is not present or available")]
    NotPresent,
    #[error("hardware is malfunctioning")]
    HwMalfunction,
    #[error("input parameter invalid")]
    InvalidParameter,
    #[error("hardware is in a bad mode or used in a bad mode")]
    InvalidMode,
    #[error("hardware is not running when sample position is inquired")]
    SpNotAdvancing,
    #[error("sample clock or rate cannot be determined or is not present")]
    NoClock,
    #[error("not enough memory for completing the request")]
    NoMemory,
}

impl DriverError {
    /// Numeric status code as defined by the driver API.
    pub fn code(self) -> i32 {
        match self {
            DriverError::NotPresent => -1000,
            DriverError::HwMalfunction => -999,
            DriverError::InvalidParameter => -998,
            DriverError::InvalidMode => -997,
            DriverError::SpNotAdvancing => -996,
            DriverError::NoClock => -995,
            DriverError::NoMemory => -994,
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Lifecycle failures surfaced to the controlling thread.
///
/// Every stage failure is terminal for the session that produced it: the
/// session has already released its driver resources when one of these is
/// returned.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("driver not found: {name}")]
    DriverNotFound { name: String },

    #[error("another session already holds the driver handle")]
    HandleBusy,

    #[error("driver initialization failed: {source}")]
    InitializationFailed {
        #[source]
        source: DriverError,
    },

    #[error("driver did not report a buffer size range: {source}")]
    BufferRangeUnavailable {
        #[source]
        source: DriverError,
    },

    #[error("buffer creation failed: {reason}")]
    BufferCreationFailed { reason: String },

    #[error("stream start failed: {source}")]
    StreamStartFailed {
        #[source]
        source: DriverError,
    },

    /// A query failed; the session is left as it was.
    #[error("driver could not report its channels: {source}")]
    ChannelQueryFailed {
        #[source]
        source: DriverError,
    },

    #[error("{op} is not valid in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },
}

/// Rejected channel topologies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("topology needs at least one output channel")]
    NoOutputs,
    #[error("topology supports at most {max} output channels, got {got}")]
    TooManyOutputs { max: usize, got: usize },
    #[error("output channel {0} is listed twice")]
    DuplicateOutput(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_codes_match_vendor_values() {
        assert_eq!(DriverError::NotPresent.code(), -1000);
        assert_eq!(DriverError::NoClock.code(), -995);
        assert_eq!(DriverError::NoMemory.code(), -994);
    }

    #[test]
    fn session_error_messages_name_the_stage() {
        let err = SessionError::DriverNotFound {
            name: "Missing".to_string(),
        };
        assert_eq!(err.to_string(), "driver not found: Missing");

        let err = SessionError::StreamStartFailed {
            source: DriverError::HwMalfunction,
        };
        assert!(err.to_string().starts_with("stream start failed"));
    }
}
