//! Storage Layer
//!
//! Persists polled readings as append-only CSV session logs with size-based
//! rotation.

mod logger;

pub use logger::{LogRecord, LoggerConfig, SessionLogger};

use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Logger is closed")]
    Closed,
    #[error("Lock error: {0}")]
    Lock(String),
}
