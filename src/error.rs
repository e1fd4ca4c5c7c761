use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when talking to a Smart Gadget
#[derive(Error, Debug)]
pub enum GadgetError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// The link is not connected, nothing can be submitted
    #[error("Device not connected")]
    NotConnected,

    /// Device disconnected while an operation was outstanding
    #[error("Device disconnected")]
    Disconnected,

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// A forced round trip gave up
    #[error("No confirmation received after {attempts} attempt(s)")]
    RetriesExhausted {
        /// Number of attempts that were made
        attempts: u32,
    },

    /// Buffer is shorter than the value being decoded
    #[error("Buffer too short: need {needed} byte(s) at offset {offset}, have {available}")]
    BufferTooShort {
        /// Width of the requested value in bytes
        needed: usize,
        /// Offset the value was requested at
        offset: usize,
        /// Total length of the buffer
        available: usize,
    },

    /// Invalid parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Transport raised an error while submitting an operation
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Characteristic is not exposed by the connected peripheral
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    /// No service on this peripheral handles the request
    #[error("Service not available: {0}")]
    ServiceNotAvailable(String),

    /// A history download is already running
    #[error("History download already in progress")]
    DownloadInProgress,

    /// Nobody is subscribed to receive downloaded samples
    #[error("No listener registered for downloaded samples")]
    NoListeners,

    /// Payload parsing failed
    #[error("Failed to parse payload: {0}")]
    ParseError(String),
}

/// Result type for Smart Gadget operations
pub type Result<T> = std::result::Result<T, GadgetError>;

impl GadgetError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::ConnectionFailed(_) | Self::NotConnected | Self::Disconnected
        )
    }

    /// Check if retrying the same request may succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::RetriesExhausted { .. } | Self::DownloadInProgress
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = GadgetError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_recoverable());

        let timeout_error = GadgetError::Timeout { timeout_ms: 1500 };
        assert!(!timeout_error.is_connection_error());
        assert!(timeout_error.is_recoverable());

        let busy = GadgetError::DownloadInProgress;
        assert!(busy.is_recoverable());
        assert!(!GadgetError::NoListeners.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = GadgetError::BufferTooShort {
            needed: 4,
            offset: 2,
            available: 5,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("need 4 byte(s) at offset 2"));
        assert!(error_string.contains("have 5"));
    }
}
