//! OBD-II Sampling Scheduler
//!
//! Polls a fast and a slow tier of PIDs on their own cadence, reuses fresh
//! cached values, logs one record per tick and reports readings to an
//! observer. Repeated link failures disconnect the session instead of
//! retrying forever.

mod cache;
mod observer;
mod scheduler;

pub use cache::{CachedValue, ReadingCache};
pub use observer::ReadingObserver;
pub use scheduler::{PollOutcome, SamplingScheduler, SchedulerConfig, SchedulerHandle, Tier};

use obd_protocol::SessionState;
use thiserror::Error;

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Session is {0:?}, expected Ready")]
    SessionNotReady(SessionState),
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),
    #[error("Scheduler already started")]
    AlreadyStarted,
}
