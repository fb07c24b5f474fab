//! Daemon configuration
//!
//! Loaded from an optional TOML file (`OBD_CONFIG`, default
//! `obd-daemon.toml`) layered under `OBD_`-prefixed environment variables.
//! Nested keys use double underscores, e.g. `OBD_TRANSPORT__KIND=tcp` or
//! `OBD_SCHEDULER__FAST_PIDS=010C,010D`.

use config::{Config, Environment, File, FileFormat};
use obd_protocol::{LinkConfig, ObdProtocol, SessionConfig, TransportTarget};
use obd_scheduler::SchedulerConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use storage::LoggerConfig;
use thiserror::Error;

/// Default configuration file
pub const DEFAULT_CONFIG_FILE: &str = "obd-daemon.toml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Serial,
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
    pub device: String,
    pub baud_rate: u32,
    pub min_command_interval_ms: u64,
    pub write_retries: u32,
    pub retry_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    pub stale_grace_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            kind: TransportKind::Simulated,
            host: "192.168.0.10".to_string(),
            port: 35000,
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 38400,
            min_command_interval_ms: 50,
            write_retries: 2,
            retry_backoff_ms: 100,
            connect_timeout_ms: 5000,
            stale_grace_ms: 200,
        }
    }
}

impl TransportSettings {
    pub fn target(&self) -> TransportTarget {
        match self.kind {
            TransportKind::Tcp => TransportTarget::Tcp {
                host: self.host.clone(),
                port: self.port,
            },
            TransportKind::Serial => TransportTarget::Serial {
                device: self.device.clone(),
                baud_rate: self.baud_rate,
            },
            TransportKind::Simulated => TransportTarget::Simulated,
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            min_command_interval: Duration::from_millis(self.min_command_interval_ms),
            write_retries: self.write_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            stale_grace: Duration::from_millis(self.stale_grace_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub headers: bool,
    /// `auto`, a protocol number (`6`) or a descriptor
    pub protocol: String,
    pub max_init_retries: u32,
    pub init_retry_delay_ms: u64,
    pub base_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub timeout_margin: f64,
    pub latency_window: usize,
    pub reset_timeout_ms: u64,
    pub setup_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            headers: defaults.headers,
            protocol: "auto".to_string(),
            max_init_retries: defaults.max_init_retries,
            init_retry_delay_ms: defaults.init_retry_delay.as_millis() as u64,
            base_timeout_ms: defaults.base_timeout.as_millis() as u64,
            max_timeout_ms: defaults.max_timeout.as_millis() as u64,
            timeout_margin: defaults.timeout_margin,
            latency_window: defaults.latency_window,
            reset_timeout_ms: defaults.reset_timeout.as_millis() as u64,
            setup_timeout_ms: defaults.setup_timeout.as_millis() as u64,
        }
    }
}

impl SessionSettings {
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let protocol = self
            .protocol
            .parse::<ObdProtocol>()
            .map_err(ConfigError::Invalid)?;
        Ok(SessionConfig {
            headers: self.headers,
            protocol,
            max_init_retries: self.max_init_retries,
            init_retry_delay: Duration::from_millis(self.init_retry_delay_ms),
            base_timeout: Duration::from_millis(self.base_timeout_ms),
            max_timeout: Duration::from_millis(self.max_timeout_ms),
            timeout_margin: self.timeout_margin,
            latency_window: self.latency_window,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            setup_timeout: Duration::from_millis(self.setup_timeout_ms),
            ..SessionConfig::default()
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub fast_period_ms: u64,
    pub slow_period_ms: u64,
    pub fast_pids: Vec<String>,
    pub slow_pids: Vec<String>,
    pub max_failed_reads: u32,
    pub default_stale_after_ms: u64,
    pub stale_after_ms: HashMap<String, u64>,
    pub cache_retention_ms: u64,
    pub scenario: Option<String>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            fast_period_ms: defaults.fast_period.as_millis() as u64,
            slow_period_ms: defaults.slow_period.as_millis() as u64,
            fast_pids: defaults.fast_pids,
            slow_pids: defaults.slow_pids,
            max_failed_reads: defaults.max_failed_reads,
            default_stale_after_ms: defaults.default_stale_after.as_millis() as u64,
            stale_after_ms: HashMap::new(),
            cache_retention_ms: defaults.cache_retention.as_millis() as u64,
            scenario: None,
        }
    }
}

impl SchedulerSettings {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let normalize = |pid: &String| pid.trim().to_ascii_uppercase();
        SchedulerConfig {
            fast_period: Duration::from_millis(self.fast_period_ms),
            slow_period: Duration::from_millis(self.slow_period_ms),
            fast_pids: self.fast_pids.iter().map(normalize).collect(),
            slow_pids: self.slow_pids.iter().map(normalize).collect(),
            max_failed_reads: self.max_failed_reads,
            default_stale_after: Duration::from_millis(self.default_stale_after_ms),
            stale_after: self
                .stale_after_ms
                .iter()
                .map(|(pid, ms)| (normalize(pid), Duration::from_millis(*ms)))
                .collect(),
            cache_retention: Duration::from_millis(self.cache_retention_ms),
            scenario: self.scenario.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub enabled: bool,
    pub directory: PathBuf,
    pub prefix: String,
    pub max_size_bytes: u64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        let defaults = LoggerConfig::default();
        Self {
            enabled: true,
            directory: defaults.directory,
            prefix: defaults.prefix,
            max_size_bytes: defaults.max_size_bytes,
        }
    }
}

impl LoggingSettings {
    pub fn logger_config(&self, columns: Vec<String>) -> LoggerConfig {
        LoggerConfig {
            directory: self.directory.clone(),
            prefix: self.prefix.clone(),
            max_size_bytes: self.max_size_bytes,
            columns,
            ..LoggerConfig::default()
        }
    }
}

/// Proprietary PID profile to overlay on the standard table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    pub directory: PathBuf,
    pub name: Option<String>,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("profiles"),
            name: None,
        }
    }
}

/// Complete daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub transport: TransportSettings,
    pub session: SessionSettings,
    pub scheduler: SchedulerSettings,
    pub logging: LoggingSettings,
    pub profile: ProfileSettings,
}

impl AppConfig {
    /// Load from `OBD_CONFIG` (or the default file, if present) plus the environment
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("OBD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let settings = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("OBD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("scheduler.fast_pids")
                    .with_list_parse_key("scheduler.slow_pids"),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        let scheduler = &self.scheduler;
        if scheduler.fast_period_ms == 0 || scheduler.slow_period_ms == 0 {
            return invalid("scheduler periods must be non-zero");
        }
        if scheduler.fast_pids.is_empty() && scheduler.slow_pids.is_empty() {
            return invalid("scheduler has no PIDs to poll");
        }
        if scheduler.max_failed_reads == 0 {
            return invalid("scheduler.max_failed_reads must be at least 1");
        }
        if self.logging.enabled && self.logging.max_size_bytes == 0 {
            return invalid("logging.max_size_bytes must be non-zero");
        }
        if self.session.latency_window == 0 {
            return invalid("session.latency_window must be non-zero");
        }
        if self.session.timeout_margin < 1.0 {
            return invalid("session.timeout_margin must be at least 1.0");
        }
        if self.session.base_timeout_ms == 0 || self.session.max_timeout_ms < self.session.base_timeout_ms {
            return invalid("session timeouts must satisfy 0 < base_timeout_ms <= max_timeout_ms");
        }
        if self.transport.kind == TransportKind::Serial && self.transport.baud_rate == 0 {
            return invalid("transport.baud_rate must be non-zero");
        }
        self.session.session_config()?;
        Ok(())
    }
}
