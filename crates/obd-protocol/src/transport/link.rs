//! Prompt-terminated exchange over any async byte stream

use super::{LinkConfig, Pacer, PROMPT};
use crate::error::TransportError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Shared write/read logic for stream-backed transports (TCP, serial)
pub(crate) struct StreamLink<S> {
    stream: S,
    pacer: Pacer,
    config: LinkConfig,
    /// Bytes received after the last prompt
    pending: Vec<u8>,
    /// A read timed out; its prompt may still arrive
    awaiting_prompt: bool,
}

impl<S> StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(stream: S, config: LinkConfig) -> Self {
        Self {
            stream,
            pacer: Pacer::new(config.min_command_interval),
            config,
            pending: Vec::new(),
            awaiting_prompt: false,
        }
    }

    /// Throw away whatever belongs to an earlier exchange.
    ///
    /// After a timeout the adapter is still answering the old command, so wait
    /// up to `stale_grace` for its prompt; then drop anything else already
    /// readable.
    async fn drain_stale(&mut self) {
        let mut chunk = [0u8; 256];
        if self.awaiting_prompt {
            let deadline = Instant::now() + self.config.stale_grace;
            while !self.pending.contains(&PROMPT) {
                match tokio::time::timeout_at(deadline, self.stream.read(&mut chunk)).await {
                    Ok(Ok(n)) if n > 0 => self.pending.extend_from_slice(&chunk[..n]),
                    Ok(_) => break,
                    Err(_) => {
                        warn!("No prompt after timed-out command; sending anyway");
                        break;
                    }
                }
            }
            self.awaiting_prompt = false;
        }

        // Ready bytes only; a zero timeout still polls the read once
        while let Ok(Ok(n)) = tokio::time::timeout(Duration::ZERO, self.stream.read(&mut chunk)).await {
            if n == 0 {
                break;
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }

        if !self.pending.is_empty() {
            debug!(
                "Discarding {} stale bytes before next command",
                self.pending.len()
            );
            self.pending.clear();
        }
    }

    /// Paced write with bounded retry
    pub(crate) async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.pacer.wait().await;
        self.drain_stale().await;

        let mut attempt = 0;
        loop {
            let result = async {
                self.stream.write_all(bytes).await?;
                self.stream.flush().await
            }
            .await;

            match result {
                Ok(()) => {
                    self.pacer.mark_sent();
                    return Ok(());
                }
                Err(e) if attempt < self.config.write_retries => {
                    attempt += 1;
                    warn!("Write failed (attempt {}): {}", attempt, e);
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(e) => return Err(TransportError::Write(e.to_string())),
            }
        }
    }

    /// Accumulate until the prompt byte or the deadline
    pub(crate) async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 256];

        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == PROMPT) {
                let rest = self.pending.split_off(pos + 1);
                let response = std::mem::replace(&mut self.pending, rest);
                return Ok(response);
            }

            let n = match tokio::time::timeout_at(deadline, self.stream.read(&mut chunk)).await {
                Err(_) => {
                    self.awaiting_prompt = true;
                    return Err(TransportError::Timeout(timeout));
                }
                Ok(Err(e)) => return Err(TransportError::Read(e.to_string())),
                Ok(Ok(0)) => return Err(TransportError::Closed),
                Ok(Ok(n)) => n,
            };
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    pub(crate) async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Stream shutdown error ignored: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LinkConfig {
        LinkConfig {
            min_command_interval: Duration::from_millis(1),
            stale_grace: Duration::from_millis(50),
            ..LinkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_read_until_prompt() {
        let (mut adapter, host) = tokio::io::duplex(64);
        let mut link = StreamLink::new(host, config());

        link.write(b"010C\r").await.unwrap();
        let mut cmd = [0u8; 5];
        adapter.read_exact(&mut cmd).await.unwrap();
        assert_eq!(&cmd, b"010C\r");

        adapter.write_all(b"41 0C ").await.unwrap();
        adapter.write_all(b"1A F8\r\r>").await.unwrap();
        let response = link.read(Duration::from_millis(500)).await.unwrap();
        assert_eq!(response, b"41 0C 1A F8\r\r>");
    }

    #[tokio::test]
    async fn test_read_timeout_is_typed() {
        let (_adapter, host) = tokio::io::duplex(64);
        let mut link = StreamLink::new(host, config());
        let err = link.read(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_closed_peer() {
        let (adapter, host) = tokio::io::duplex(64);
        drop(adapter);
        let mut link = StreamLink::new(host, config());
        assert_eq!(
            link.read(Duration::from_millis(100)).await.unwrap_err(),
            TransportError::Closed
        );
    }

    #[tokio::test]
    async fn test_stale_bytes_discarded_on_next_write() {
        let (mut adapter, host) = tokio::io::duplex(64);
        let mut link = StreamLink::new(host, config());

        // Late reply to a timed-out command, then the real one
        adapter.write_all(b"41 0D").await.unwrap();
        assert!(link.read(Duration::from_millis(20)).await.is_err());

        link.write(b"0105\r").await.unwrap();
        adapter.write_all(b"41 05 7B\r>").await.unwrap();
        let response = link.read(Duration::from_millis(200)).await.unwrap();
        assert_eq!(response, b"41 05 7B\r>");
    }

    #[tokio::test]
    async fn test_late_tail_never_reaches_next_command() {
        let (mut adapter, host) = tokio::io::duplex(64);
        let mut link = StreamLink::new(host, config());
        let mut cmd = [0u8; 5];

        link.write(b"010D\r").await.unwrap();
        adapter.read_exact(&mut cmd).await.unwrap();
        adapter.write_all(b"41 0D").await.unwrap();
        assert_eq!(
            link.read(Duration::from_millis(20)).await.unwrap_err(),
            TransportError::Timeout(Duration::from_millis(20))
        );

        // The slow adapter finishes the old answer after the host gave up
        adapter.write_all(b" 55\r\r>").await.unwrap();

        link.write(b"0105\r").await.unwrap();
        adapter.read_exact(&mut cmd).await.unwrap();
        assert_eq!(&cmd, b"0105\r");
        adapter.write_all(b"41 05 7B\r\r>").await.unwrap();
        let response = link.read(Duration::from_millis(200)).await.unwrap();
        assert_eq!(response, b"41 05 7B\r\r>");
    }

    #[tokio::test]
    async fn test_waits_for_prompt_of_timed_out_command() {
        let (mut adapter, host) = tokio::io::duplex(64);
        let mut link = StreamLink::new(host, config());

        adapter.write_all(b"41 0D").await.unwrap();
        assert!(link.read(Duration::from_millis(20)).await.is_err());

        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            adapter.write_all(b" 55\r\r>").await.unwrap();
            let mut cmd = [0u8; 5];
            adapter.read_exact(&mut cmd).await.unwrap();
            assert_eq!(&cmd, b"0105\r");
            adapter.write_all(b"41 05 7B\r\r>").await.unwrap();
            adapter
        });

        link.write(b"0105\r").await.unwrap();
        let response = link.read(Duration::from_millis(500)).await.unwrap();
        assert_eq!(response, b"41 05 7B\r\r>");
        late.await.unwrap();
    }
}
