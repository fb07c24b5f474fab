//! Consumer seam for readings and session events

use obd_protocol::{ParsedReading, SessionState};
use storage::StorageError;

/// Receives everything the scheduler produces.
///
/// Called from the polling tasks; implementations must not block.
pub trait ReadingObserver: Send + Sync {
    /// A freshly polled reading
    fn on_reading(&self, pid: &str, reading: &ParsedReading);

    /// The adapter session changed state
    fn on_session_state(&self, _state: SessionState) {}

    /// A log record could not be written; acquisition continues
    fn on_logging_error(&self, _error: &StorageError) {}
}
