//! OBD-II Protocol Implementation
//!
//! This crate talks to ELM327-compatible OBD-II adapters over TCP, serial or a
//! built-in emulator. It brings the adapter up, discovers the vehicle protocol
//! and supported PIDs, and decodes responses through a formula-driven PID
//! registry that proprietary profiles can extend.

pub mod decoder;
pub mod discovery;
pub mod dtc;
mod error;
pub mod formula;
mod protocol;
pub mod registry;
pub mod session;
mod timing;
pub mod transport;

pub use decoder::{decode, ParsedReading, ReadingIssue};
pub use dtc::{DtcCategory, DtcCode, DtcKind, DtcManager};
pub use error::{ObdError, RegistryError, TransportError};
pub use formula::{Formula, FormulaError};
pub use protocol::ObdProtocol;
pub use registry::{PidDefinition, PidRegistry, Profile};
pub use session::{AdapterSession, ConnectionStatus, SessionConfig, SessionState};
pub use timing::AdaptiveTimeout;
pub use transport::{LinkConfig, Transport, TransportTarget};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
    /// Permanent trouble codes
    pub const PERMANENT_DTC: u8 = 0x0A;
}
