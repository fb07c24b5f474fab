//! OBD-II Error Types

use crate::session::SessionState;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a byte-stream transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The link could not be opened
    #[error("Failed to open {target}: {reason}")]
    Open { target: String, reason: String },

    /// Writing a command failed after all retries
    #[error("Write failed: {0}")]
    Write(String),

    /// Reading from the link failed
    #[error("Read failed: {0}")]
    Read(String),

    /// No prompt arrived before the deadline
    #[error("Timeout waiting for adapter prompt after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The peer closed the link
    #[error("Link closed by peer")]
    Closed,

    /// Operation attempted on a transport that is not open
    #[error("Transport is not open")]
    NotOpen,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Read(err.to_string())
    }
}

/// Errors that can occur during an adapter session
#[derive(Debug, Clone, Error)]
pub enum ObdError {
    /// Transport fault
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A setup command was not acknowledged as expected
    #[error("Adapter rejected {command}: {response:?}")]
    Initialization { command: String, response: String },

    /// Initialization gave up after the retry budget
    #[error("Initialization failed after {attempts} attempts: {last}")]
    InitializationFailed { attempts: u32, last: String },

    /// No protocol descriptor and the probe PID did not answer
    #[error("Protocol detection failed: {0}")]
    ProtocolDetection(String),

    /// Capability scan found nothing
    #[error("Vehicle reported no supported PIDs")]
    NoSupportedPids,

    /// PID not supported by vehicle
    #[error("PID {0} not supported by vehicle")]
    PidNotSupported(String),

    /// PID missing from the registry
    #[error("Unknown PID {0}")]
    UnknownPid(String),

    /// Operation not allowed in the current state
    #[error("Session is {0:?}")]
    NotReady(SessionState),

    /// Session reached its terminal state
    #[error("Session failed permanently")]
    SessionFailed,

    /// Unexpected trouble-code payload
    #[error("Invalid DTC response: {0}")]
    Dtc(String),

    /// Clear command not positively acknowledged
    #[error("Clear codes not acknowledged: {0:?}")]
    ClearRejected(String),

    /// Invalid response from adapter
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ObdError {
    /// Whether this error came from the link rather than the vehicle
    pub fn is_transport(&self) -> bool {
        matches!(self, ObdError::Transport(_))
    }
}

/// Errors while building a PID registry or loading a profile
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Profile file could not be read
    #[error("Failed to read profile {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Profile file is not valid JSON for the expected shape
    #[error("Invalid profile document: {0}")]
    Parse(#[from] serde_json::Error),

    /// Malformed PID code
    #[error("Invalid PID code {0:?}")]
    InvalidCode(String),

    /// Same code declared twice in one table
    #[error("Duplicate PID code {0}")]
    DuplicateCode(String),

    /// Formula failed to parse
    #[error("PID {code}: {source}")]
    Formula {
        code: String,
        #[source]
        source: crate::formula::FormulaError,
    },

    /// Formula reads bytes the response does not carry
    #[error("PID {code}: formula uses byte {variable} but only {byte_count} bytes are returned")]
    VariableOutOfRange {
        code: String,
        variable: char,
        byte_count: usize,
    },

    /// Declared response length outside what a single PID can carry
    #[error("PID {code}: byte count {byte_count} outside 1..={max}")]
    InvalidByteCount {
        code: String,
        byte_count: usize,
        max: usize,
    },

    /// Range bounds are inverted
    #[error("PID {code}: min {min} exceeds max {max}")]
    InvalidRange { code: String, min: f64, max: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_classification() {
        let err: ObdError = TransportError::Timeout(Duration::from_millis(250)).into();
        assert!(err.is_transport());
        assert_eq!(err.to_string(), "Timeout waiting for adapter prompt after 250ms");
        assert!(!ObdError::PidNotSupported("0142".into()).is_transport());
    }
}
