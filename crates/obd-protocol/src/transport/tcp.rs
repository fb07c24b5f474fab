//! WiFi/Ethernet ELM327 dongles

use super::link::StreamLink;
use super::{LinkConfig, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// TCP transport (`host:port`, typically `192.168.0.10:35000`)
pub struct TcpTransport {
    host: String,
    port: u16,
    config: LinkConfig,
    link: Option<StreamLink<TcpStream>>,
}

impl TcpTransport {
    pub fn new(host: &str, port: u16, config: LinkConfig) -> Self {
        Self {
            host: host.to_string(),
            port,
            config,
            link: None,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.link.is_some() {
            return Ok(());
        }

        let address = self.address();
        info!("Connecting to adapter at {}", address);
        let open_error = |reason: String| TransportError::Open {
            target: address.clone(),
            reason,
        };

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| open_error("connect timed out".to_string()))?
            .map_err(|e| open_error(e.to_string()))?;
        stream.set_nodelay(true).map_err(|e| open_error(e.to_string()))?;

        self.link = Some(StreamLink::new(stream, self.config.clone()));
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
            debug!("Closing TCP link to {}", self.address());
            link.shutdown().await;
        }
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address())
    }
}
