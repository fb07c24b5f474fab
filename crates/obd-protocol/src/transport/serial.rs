//! USB/Bluetooth-serial ELM327 adapters

use super::link::StreamLink;
use super::{LinkConfig, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

/// Serial transport (8N1, no flow control)
pub struct SerialTransport {
    device: String,
    baud_rate: u32,
    config: LinkConfig,
    link: Option<StreamLink<SerialStream>>,
}

impl SerialTransport {
    /// # Arguments
    /// * `device` - Serial port device path (e.g., "/dev/ttyUSB0" or "COM3")
    /// * `baud_rate` - Baud rate for serial communication
    pub fn new(device: &str, baud_rate: u32, config: LinkConfig) -> Self {
        Self {
            device: device.to_string(),
            baud_rate,
            config,
            link: None,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.link.is_some() {
            return Ok(());
        }

        info!("Opening serial adapter {} at {} baud", self.device, self.baud_rate);
        let port = tokio_serial::new(&self.device, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportError::Open {
                target: self.device.clone(),
                reason: e.to_string(),
            })?;

        self.link = Some(StreamLink::new(port, self.config.clone()));
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.link.as_mut().ok_or(TransportError::NotOpen)?.write(bytes).await
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.link.as_mut().ok_or(TransportError::NotOpen)?.read(timeout).await
    }

    async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            debug!("Closing serial port {}", self.device);
            link.shutdown().await;
        }
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.device, self.baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_device_is_open_error() {
        let mut transport =
            SerialTransport::new("/dev/obd-adapter-that-does-not-exist", 38400, LinkConfig::default());
        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, TransportError::Open { .. }));
        assert!(!transport.is_open());
        assert_eq!(transport.describe(), "/dev/obd-adapter-that-does-not-exist@38400");
    }
}
