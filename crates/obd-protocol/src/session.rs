//! ELM327 adapter session
//!
//! Owns the transport and drives the adapter through reset, setup, protocol
//! detection and PID discovery. Every exchange goes through one async mutex,
//! so at most one command is ever in flight and each response is matched to
//! the command that produced it.

use crate::decoder::{self, response_lines, ParsedReading, ReadingIssue};
use crate::discovery;
use crate::error::{ObdError, TransportError};
use crate::protocol::ObdProtocol;
use crate::registry::PidRegistry;
use crate::timing::AdaptiveTimeout;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Adapter session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    ProtocolDetecting,
    PidScanning,
    Ready,
    /// Transport fault; exchanges are still attempted
    Error,
    /// Initialization retries exhausted (terminal)
    Failed,
    /// Closed by request or by the failure policy; needs `reconnect()`
    Disconnected,
}

impl SessionState {
    /// Whether commands may be sent in this state
    pub fn accepts_commands(&self) -> bool {
        matches!(
            self,
            SessionState::Initializing
                | SessionState::ProtocolDetecting
                | SessionState::PidScanning
                | SessionState::Ready
                | SessionState::Error
        )
    }
}

/// Coarse status shown to users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Ready, but without a protocol descriptor from the adapter
    Degraded,
    Error,
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Keep CAN/J1850 headers in responses (`ATH1`)
    pub headers: bool,
    /// Protocol to force, `Auto` for adapter search
    pub protocol: ObdProtocol,
    /// Initialization attempts after the first before giving up
    pub max_init_retries: u32,
    /// Pause between initialization attempts
    pub init_retry_delay: Duration,
    /// Floor of the adaptive timeout
    pub base_timeout: Duration,
    /// Ceiling of the adaptive timeout
    pub max_timeout: Duration,
    /// Multiplier applied to the p95 latency
    pub timeout_margin: f64,
    /// Number of latencies kept for the p95
    pub latency_window: usize,
    /// Wait for `ATZ` and for bus search
    pub reset_timeout: Duration,
    /// Wait for setup commands
    pub setup_timeout: Duration,
    /// PID sent to verify the bus when no protocol descriptor is available
    pub probe_pid: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            headers: false,
            protocol: ObdProtocol::Auto,
            max_init_retries: 2,
            init_retry_delay: Duration::from_millis(500),
            base_timeout: Duration::from_millis(250),
            max_timeout: Duration::from_secs(2),
            timeout_margin: 1.5,
            latency_window: 20,
            reset_timeout: Duration::from_secs(3),
            setup_timeout: Duration::from_secs(1),
            probe_pid: "0100".to_string(),
        }
    }
}

/// Everything behind the single in-flight command
struct Link {
    transport: Box<dyn Transport>,
    timeout: AdaptiveTimeout,
}

#[derive(Debug, Default)]
struct SessionStatus {
    protocol: Option<String>,
    protocol_family: Option<ObdProtocol>,
    supported: Option<BTreeSet<String>>,
    error_counts: HashMap<String, u32>,
    last_successful_command: Option<String>,
    last_error: Option<String>,
    degraded: bool,
}

/// Stateful connection to one ELM327 adapter
pub struct AdapterSession {
    config: SessionConfig,
    registry: Arc<PidRegistry>,
    link: tokio::sync::Mutex<Link>,
    status: Mutex<SessionStatus>,
    state_tx: watch::Sender<SessionState>,
}

/// Current Unix time in milliseconds
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl AdapterSession {
    pub fn new(transport: Box<dyn Transport>, registry: Arc<PidRegistry>, config: SessionConfig) -> Self {
        let timeout = AdaptiveTimeout::new(
            config.base_timeout,
            config.max_timeout,
            config.timeout_margin,
            config.latency_window,
        );
        let (state_tx, _) = watch::channel(SessionState::Uninitialized);
        Self {
            config,
            registry,
            link: tokio::sync::Mutex::new(Link { transport, timeout }),
            status: Mutex::new(SessionStatus::default()),
            state_tx,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &PidRegistry {
        &self.registry
    }

    fn status_guard(&self) -> MutexGuard<'_, SessionStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            info!("Adapter session -> {:?}", next);
        }
    }

    /// Receiver of state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.state() {
            SessionState::Uninitialized | SessionState::Disconnected => ConnectionStatus::Disconnected,
            SessionState::Initializing | SessionState::ProtocolDetecting | SessionState::PidScanning => {
                ConnectionStatus::Connecting
            }
            SessionState::Ready if self.status_guard().degraded => ConnectionStatus::Degraded,
            SessionState::Ready => ConnectionStatus::Connected,
            SessionState::Error | SessionState::Failed => ConnectionStatus::Error,
        }
    }

    /// Protocol descriptor reported by the adapter
    pub fn protocol(&self) -> Option<String> {
        self.status_guard().protocol.clone()
    }

    /// Protocol family parsed from the descriptor
    pub fn protocol_family(&self) -> Option<ObdProtocol> {
        self.status_guard().protocol_family
    }

    /// `None` until discovery has run
    pub fn supported_pids(&self) -> Option<BTreeSet<String>> {
        self.status_guard().supported.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.status_guard().degraded
    }

    /// Faults recorded for one command since connect
    pub fn error_count(&self, command: &str) -> u32 {
        self.status_guard()
            .error_counts
            .get(&command.to_ascii_uppercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn last_successful_command(&self) -> Option<String> {
        self.status_guard().last_successful_command.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.status_guard().last_error.clone()
    }

    /// Current response timeout
    pub async fn current_timeout(&self) -> Duration {
        self.link.lock().await.timeout.current()
    }

    /// Open the transport and bring the adapter to `Ready`.
    ///
    /// Each attempt runs reset, setup, protocol detection and PID discovery.
    /// After `1 + max_init_retries` failed attempts the session is `Failed`.
    pub async fn connect(&self) -> Result<(), ObdError> {
        match self.state() {
            SessionState::Ready => return Ok(()),
            SessionState::Failed => return Err(ObdError::SessionFailed),
            _ => {}
        }

        let attempts = self.config.max_init_retries + 1;
        let mut last = String::new();
        for attempt in 1..=attempts {
            self.set_state(SessionState::Initializing);
            match self.initialize().await {
                Ok(()) => {
                    self.set_state(SessionState::Ready);
                    info!(
                        "Adapter ready: protocol {}, {} supported PIDs",
                        self.protocol().unwrap_or_else(|| "unknown".to_string()),
                        self.supported_pids().map(|s| s.len()).unwrap_or(0)
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!("Initialization attempt {}/{} failed: {}", attempt, attempts, e);
                    last = e.to_string();
                    self.status_guard().last_error = Some(last.clone());
                    self.set_state(SessionState::Error);
                    self.link.lock().await.transport.close().await;
                    if attempt < attempts {
                        tokio::time::sleep(self.config.init_retry_delay).await;
                    }
                }
            }
        }

        error!("Adapter initialization gave up after {} attempts", attempts);
        self.set_state(SessionState::Failed);
        Err(ObdError::InitializationFailed { attempts, last })
    }

    async fn initialize(&self) -> Result<(), ObdError> {
        {
            let mut link = self.link.lock().await;
            info!("Opening adapter link {}", link.transport.describe());
            link.transport.open().await?;
            link.timeout.reset();
        }
        self.reset_discovery();

        let banner = self.execute_with_timeout("ATZ", Some(self.config.reset_timeout)).await?;
        expect_banner(&banner)?;

        let headers = if self.config.headers { "ATH1" } else { "ATH0" };
        for command in ["ATE0", "ATL0", headers, "ATS0"] {
            let response = self.execute_with_timeout(command, Some(self.config.setup_timeout)).await?;
            expect_ok(command, &response)?;
        }

        self.set_state(SessionState::ProtocolDetecting);
        match discovery::detect_protocol(self).await? {
            Some(label) => {
                let family = ObdProtocol::from_descriptor(&label);
                let mut status = self.status_guard();
                status.protocol = Some(label);
                status.protocol_family = family;
                status.degraded = false;
            }
            None => {
                let probe = self.config.probe_pid.clone();
                let response = self
                    .execute_with_timeout(&probe, Some(self.config.reset_timeout))
                    .await?;
                if discovery::parse_capability_response(&probe, &response).is_none() {
                    return Err(ObdError::ProtocolDetection(format!(
                        "no protocol descriptor and probe {probe} unanswered"
                    )));
                }
                warn!("Adapter gave no protocol descriptor; continuing degraded");
                self.status_guard().degraded = true;
            }
        }

        self.set_state(SessionState::PidScanning);
        let supported = discovery::scan_supported_pids(self).await?;
        if supported.is_empty() {
            return Err(ObdError::NoSupportedPids);
        }
        debug!("Supported PIDs: {:?}", supported);
        self.status_guard().supported = Some(supported);
        Ok(())
    }

    fn reset_discovery(&self) {
        let mut status = self.status_guard();
        status.protocol = None;
        status.protocol_family = None;
        status.supported = None;
        status.degraded = false;
    }

    /// Close the link (after any in-flight command) and release session state
    pub async fn disconnect(&self) {
        {
            let mut link = self.link.lock().await;
            link.transport.close().await;
            link.timeout.reset();
        }
        {
            let mut status = self.status_guard();
            let last_error = status.last_error.take();
            *status = SessionStatus {
                last_error,
                ..SessionStatus::default()
            };
        }
        if self.state() != SessionState::Failed {
            self.set_state(SessionState::Disconnected);
        }
        info!("Adapter session closed");
    }

    /// Disconnect because the link is considered lost
    pub async fn mark_disconnected(&self, reason: &str) {
        warn!("Marking adapter disconnected: {}", reason);
        self.status_guard().last_error = Some(reason.to_string());
        self.disconnect().await;
    }

    /// Tear down and run a fresh connect
    pub async fn reconnect(&self) -> Result<(), ObdError> {
        if self.state() == SessionState::Failed {
            return Err(ObdError::SessionFailed);
        }
        info!("Reconnecting adapter");
        self.disconnect().await;
        self.connect().await
    }

    /// Send one command and return the raw response text
    pub async fn execute(&self, command: &str) -> Result<String, ObdError> {
        self.execute_with_timeout(command, None).await
    }

    /// Send one command; `None` uses the adaptive timeout
    pub async fn execute_with_timeout(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String, ObdError> {
        let state = self.state();
        if !state.accepts_commands() {
            return Err(ObdError::NotReady(state));
        }

        let command = command.trim().to_ascii_uppercase();
        let mut link = self.link.lock().await;
        let wait = timeout.unwrap_or_else(|| link.timeout.current());
        debug!("-> {} (timeout {}ms)", command, wait.as_millis());

        let link = &mut *link;
        let result = async {
            let mut frame = command.clone().into_bytes();
            frame.extend_from_slice(crate::transport::TERMINATOR);
            link.transport.write(&frame).await?;
            // Pacing happens inside write; only the adapter's turnaround counts
            let sent = Instant::now();
            let bytes = link.transport.read(wait).await?;
            Ok::<_, TransportError>((bytes, sent.elapsed()))
        }
        .await;

        match result {
            Ok((bytes, latency)) => {
                if timeout.is_none() {
                    link.timeout.record(latency);
                }
                let text = String::from_utf8_lossy(&bytes).into_owned();
                debug!("<- {:?}", text);
                self.note_success(&command);
                Ok(text)
            }
            Err(e) => {
                self.note_failure(&command, &e.to_string());
                Err(e.into())
            }
        }
    }

    fn note_success(&self, command: &str) {
        self.status_guard().last_successful_command = Some(command.to_string());
        if self.state() == SessionState::Error {
            self.set_state(SessionState::Ready);
        }
    }

    fn note_failure(&self, command: &str, reason: &str) {
        warn!("Command {} failed: {}", command, reason);
        {
            let mut status = self.status_guard();
            *status.error_counts.entry(command.to_string()).or_insert(0) += 1;
            status.last_error = Some(format!("{command}: {reason}"));
        }
        if self.state() == SessionState::Ready {
            self.set_state(SessionState::Error);
        }
    }

    /// Read and decode one PID.
    ///
    /// Unknown codes and mode 01 codes the vehicle did not advertise are
    /// refused before anything is sent.
    pub async fn read_pid(&self, code: &str) -> Result<ParsedReading, ObdError> {
        let def = self
            .registry
            .get(code)
            .ok_or_else(|| ObdError::UnknownPid(code.to_string()))?;

        let refused = def.mode() == crate::mode::CURRENT_DATA
            && self
                .status_guard()
                .supported
                .as_ref()
                .is_some_and(|supported| !supported.contains(def.code()));
        if refused {
            return Err(ObdError::PidNotSupported(def.code().to_string()));
        }

        let raw = self.execute(def.code()).await?;
        let reading = decoder::decode(def, &raw, now_ms());
        match reading.reason {
            Some(ReadingIssue::OutOfRange) | None => {}
            Some(issue) => debug!("{} decoded with issue: {}", def.code(), issue),
        }
        Ok(reading)
    }

    /// Battery voltage at the adapter (`ATRV`)
    pub async fn read_voltage(&self) -> Result<f64, ObdError> {
        let raw = self.execute("ATRV").await?;
        parse_voltage(&raw).ok_or_else(|| ObdError::InvalidResponse(raw.trim().to_string()))
    }
}

/// Non-empty, non-echo lines with surrounding whitespace and prompts removed
pub(crate) fn text_lines(raw: &str, command: Option<&str>) -> Vec<String> {
    raw.split(['\r', '\n'])
        .map(|line| line.replace('>', "").trim().to_string())
        .filter(|line| !line.is_empty())
        .filter(|line| command.map_or(true, |c| !line.eq_ignore_ascii_case(c)))
        .collect()
}

fn expect_banner(raw: &str) -> Result<(), ObdError> {
    let has_banner = !response_lines(raw, Some("ATZ")).is_empty();
    if has_banner {
        Ok(())
    } else {
        Err(ObdError::Initialization {
            command: "ATZ".to_string(),
            response: raw.trim().to_string(),
        })
    }
}

pub(crate) fn expect_ok(command: &str, raw: &str) -> Result<(), ObdError> {
    if text_lines(raw, Some(command))
        .iter()
        .any(|line| line.eq_ignore_ascii_case("OK"))
    {
        Ok(())
    } else {
        Err(ObdError::Initialization {
            command: command.to_string(),
            response: raw.trim().to_string(),
        })
    }
}

fn parse_voltage(raw: &str) -> Option<f64> {
    text_lines(raw, Some("ATRV"))
        .iter()
        .rev()
        .find_map(|line| line.trim_end_matches(['V', 'v']).trim().parse::<f64>().ok())
}
