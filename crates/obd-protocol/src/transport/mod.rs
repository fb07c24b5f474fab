//! Byte-stream transports to the adapter
//!
//! One [`Transport`] trait covers TCP/WiFi dongles, serial adapters and the
//! built-in simulator, so the session never branches on the link type.

mod link;
mod serial;
mod simulated;
mod tcp;

pub use serial::SerialTransport;
pub use simulated::SimulatedTransport;
pub use tcp::TcpTransport;

use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// End-of-response prompt the ELM327 prints when ready for a command
pub const PROMPT: u8 = b'>';

/// Command terminator
pub const TERMINATOR: &[u8] = b"\r";

/// Where to find the adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportTarget {
    /// WiFi/Ethernet dongle (`host:port`)
    Tcp { host: String, port: u16 },
    /// Local serial device
    Serial { device: String, baud_rate: u32 },
    /// Built-in emulator
    Simulated,
}

impl fmt::Display for TransportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportTarget::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            TransportTarget::Serial { device, baud_rate } => write!(f, "{device}@{baud_rate}"),
            TransportTarget::Simulated => f.write_str("simulated"),
        }
    }
}

/// Write pacing and retry settings shared by every transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Minimum gap between two commands
    pub min_command_interval: Duration,
    /// Extra write attempts after the first failure
    pub write_retries: u32,
    /// Pause between write attempts
    pub retry_backoff: Duration,
    /// TCP connect deadline
    pub connect_timeout: Duration,
    /// After a timed-out read, how long to wait for the late prompt before the next command
    pub stale_grace: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            min_command_interval: Duration::from_millis(50),
            write_retries: 2,
            retry_backoff: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            stale_grace: Duration::from_millis(200),
        }
    }
}

/// A half-duplex, prompt-terminated byte stream to the adapter
#[async_trait]
pub trait Transport: Send {
    /// Open the link; opening an open link is a no-op
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Send one command, paced and retried
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read until the prompt or until `timeout` elapses
    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Close the link; idempotent
    async fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Human-readable target
    fn describe(&self) -> String;
}

/// Build the transport for a target
pub fn build(target: &TransportTarget, config: LinkConfig) -> Box<dyn Transport> {
    match target {
        TransportTarget::Tcp { host, port } => Box::new(TcpTransport::new(host, *port, config)),
        TransportTarget::Serial { device, baud_rate } => {
            Box::new(SerialTransport::new(device, *baud_rate, config))
        }
        TransportTarget::Simulated => Box::new(SimulatedTransport::new().with_link_config(config)),
    }
}

/// Enforces the minimum spacing between commands
#[derive(Debug, Clone)]
pub(crate) struct Pacer {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl Pacer {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// Sleep until the next command may go out
    pub(crate) async fn wait(&self) {
        if let Some(last) = self.last_sent {
            let ready_at = last + self.interval;
            let now = Instant::now();
            if ready_at > now {
                tokio::time::sleep(ready_at - now).await;
            }
        }
    }

    pub(crate) fn mark_sent(&mut self) {
        self.last_sent = Some(Instant::now());
    }
}
