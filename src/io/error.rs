// src/io/error.rs
//
// Error taxonomy for the CanHacker driver.
//
// Initialization failures wrap the step that failed. Protocol and transport
// failures are raised to the caller of the operation that hit them; nothing is
// retried internally.

use thiserror::Error;

/// Errors raised by the serial channel, transport, codec and control layers.
#[derive(Debug, Error)]
pub enum IoError {
    /// The serial device could not be opened or went away.
    #[error("{device}: connection failed: {message}")]
    Connection { device: String, message: String },

    /// No response arrived within the allotted time.
    #[error("{device}: timed out waiting for {operation}")]
    Timeout { device: String, operation: String },

    /// Reading from the serial channel failed.
    #[error("{device}: read failed: {message}")]
    Read { device: String, message: String },

    /// Writing or flushing the serial channel failed.
    #[error("{device}: write failed: {message}")]
    Write { device: String, message: String },

    /// Malformed input, negative answer or mismatched response command.
    #[error("{device}: protocol error: {message}")]
    Protocol { device: String, message: String },

    /// Invalid configuration (unsupported bitrate, conflicting options, ...).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Operation issued in a session state that does not allow it.
    #[error("{device}: invalid state: {message}")]
    InvalidState { device: String, message: String },

    /// Operation exists in the command vocabulary but is not supported.
    #[error("{0} is not implemented")]
    Unimplemented(String),

    /// Bus construction aborted; the session is unusable.
    #[error("initialization failed: {0}")]
    Initialization(#[source] Box<IoError>),
}

impl IoError {
    pub fn connection(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Connection {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn timeout(device: impl Into<String>, operation: impl Into<String>) -> Self {
        IoError::Timeout {
            device: device.into(),
            operation: operation.into(),
        }
    }

    pub fn read(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Read {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn write(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Write {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn protocol(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::Protocol {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        IoError::Configuration(message.into())
    }

    pub fn invalid_state(device: impl Into<String>, message: impl Into<String>) -> Self {
        IoError::InvalidState {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn unimplemented(what: impl Into<String>) -> Self {
        IoError::Unimplemented(what.into())
    }

    /// Wrap a failed construction step. Already-wrapped errors are passed through.
    pub fn initialization(cause: IoError) -> Self {
        match cause {
            IoError::Initialization(_) => cause,
            other => IoError::Initialization(Box::new(other)),
        }
    }

    /// Whether this error aborted bus construction.
    pub fn is_initialization(&self) -> bool {
        matches!(self, IoError::Initialization(_))
    }
}

impl From<IoError> for String {
    fn from(e: IoError) -> Self {
        e.to_string()
    }
}
