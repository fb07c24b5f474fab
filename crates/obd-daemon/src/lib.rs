//! OBD-II Acquisition Daemon
//!
//! Wires the adapter session, the sampling scheduler and the session logger
//! together and runs them until shutdown or until the link is lost.

pub mod config;

use anyhow::Context;
use crate::config::AppConfig;
use obd_protocol::transport::{self, Transport};
use obd_protocol::{AdapterSession, DtcManager, ParsedReading, PidRegistry, Profile, SessionState};
use obd_scheduler::{ReadingObserver, SamplingScheduler};
use std::future::Future;
use std::sync::Arc;
use storage::{SessionLogger, StorageError};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize logging; `RUST_LOG` filters, `OBD_LOG_JSON=1` switches to JSON lines
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("OBD_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true);

    let result = if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {e}");
    }
}

/// Reports readings and session changes through `tracing`
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ReadingObserver for TracingObserver {
    fn on_reading(&self, pid: &str, reading: &ParsedReading) {
        match (reading.value, reading.reason) {
            (Some(value), None) => debug!("{} = {} {}", pid, value, reading.unit),
            (value, reason) => debug!(
                "{} = {:?} {} ({})",
                pid,
                value,
                reading.unit,
                reason.map(|r| r.as_str()).unwrap_or("invalid")
            ),
        }
    }

    fn on_session_state(&self, state: SessionState) {
        info!("Session state: {:?}", state);
    }

    fn on_logging_error(&self, error: &StorageError) {
        warn!("Session log write failed: {}", error);
    }
}

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The shutdown future resolved
    Shutdown,
    /// The session dropped out of the usable states
    LinkLost(SessionState),
}

/// Standard PID table plus the configured profile, if any
pub fn build_registry(config: &AppConfig) -> anyhow::Result<PidRegistry> {
    let registry = PidRegistry::standard();
    match &config.profile.name {
        Some(name) => {
            let profile = Profile::load(&config.profile.directory, name)
                .with_context(|| format!("loading profile {name}"))?;
            Ok(registry.with_profile(profile))
        }
        None => Ok(registry),
    }
}

/// Transport for the configured target; not yet opened
pub fn build_transport(config: &AppConfig) -> Box<dyn Transport> {
    let target = config.transport.target();
    info!("Using adapter at {}", target);
    transport::build(&target, config.transport.link_config())
}

/// Session over the configured transport; not yet connected
pub fn build_session(config: &AppConfig) -> anyhow::Result<AdapterSession> {
    let registry = Arc::new(build_registry(config)?);
    let link = build_transport(config);
    Ok(AdapterSession::new(link, registry, config.session.session_config()?))
}

/// Run against the configured adapter until Ctrl-C or link loss
pub async fn run(config: AppConfig) -> anyhow::Result<RunOutcome> {
    let session = Arc::new(build_session(&config)?);
    run_session(&config, session, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    })
    .await
}

/// Connect, report diagnostics, then sample until `shutdown` resolves or the
/// session stops accepting commands
pub async fn run_session<F>(
    config: &AppConfig,
    session: Arc<AdapterSession>,
    shutdown: F,
) -> anyhow::Result<RunOutcome>
where
    F: Future<Output = ()>,
{
    session
        .connect()
        .await
        .context("connecting to the adapter")?;
    info!("Connection status: {:?}", session.status());

    report_diagnostics(&session).await;

    let scheduler_config = config.scheduler.scheduler_config();
    let logger = if config.logging.enabled {
        let logger_config = config.logging.logger_config(scheduler_config.columns());
        Some(Arc::new(
            SessionLogger::open(logger_config).context("opening the session log")?,
        ))
    } else {
        None
    };

    let scheduler = Arc::new(SamplingScheduler::new(
        Arc::clone(&session),
        logger.clone(),
        Arc::new(TracingObserver),
        scheduler_config,
    ));
    let handle = scheduler.start().context("starting the sampler")?;

    let mut states = session.subscribe();
    let outcome = tokio::select! {
        _ = shutdown => RunOutcome::Shutdown,
        state = async { states.wait_for(|s| !s.accepts_commands()).await.map(|s| *s) } => {
            RunOutcome::LinkLost(state.unwrap_or_else(|_| session.state()))
        }
    };

    handle.stop().await;
    if let Some(logger) = logger {
        if let Err(e) = logger.close() {
            warn!("Failed to close session log: {}", e);
        }
    }
    session.disconnect().await;

    match outcome {
        RunOutcome::Shutdown => info!("Stopped on request"),
        RunOutcome::LinkLost(state) => warn!(
            "Stopped: session {:?} ({})",
            state,
            session.last_error().unwrap_or_default()
        ),
    }
    Ok(outcome)
}

async fn report_diagnostics(session: &AdapterSession) {
    match DtcManager::new(session).read().await {
        Ok(codes) if codes.is_empty() => info!("No stored trouble codes"),
        Ok(codes) => {
            let list: Vec<String> = codes.iter().map(ToString::to_string).collect();
            warn!("{} stored trouble codes: {}", codes.len(), list.join(", "));
        }
        Err(e) => warn!("Failed to read trouble codes: {}", e),
    }

    match session.read_voltage().await {
        Ok(volts) => info!("Battery voltage: {:.1} V", volts),
        Err(e) => warn!("Failed to read battery voltage: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use obd_protocol::transport::SimulatedTransport;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn test_config(directory: PathBuf) -> AppConfig {
        let mut config = AppConfig::default();
        config.scheduler.fast_period_ms = 20;
        config.scheduler.slow_period_ms = 60;
        config.logging.directory = directory;
        config
    }

    fn session(transport: SimulatedTransport) -> Arc<AdapterSession> {
        Arc::new(AdapterSession::new(
            Box::new(transport),
            Arc::new(PidRegistry::standard()),
            Default::default(),
        ))
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("obd-daemon-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_build_session_uses_configured_target() {
        let mut config = AppConfig::default();
        config.transport.kind = TransportKind::Tcp;
        config.transport.host = "10.0.0.5".to_string();
        config.transport.port = 35001;
        let transport = build_transport(&config);
        assert_eq!(transport.describe(), "tcp://10.0.0.5:35001");
        assert!(!transport.is_open());

        config.transport.kind = TransportKind::Serial;
        config.transport.device = "/dev/ttyACM0".to_string();
        config.transport.baud_rate = 115200;
        assert_eq!(build_transport(&config).describe(), "/dev/ttyACM0@115200");

        let session = build_session(&config).unwrap();
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_missing_profile_is_an_error() {
        let mut config = AppConfig::default();
        config.profile.directory = temp_dir();
        config.profile.name = Some("nonexistent".to_string());
        let err = build_registry(&config).unwrap_err();
        assert!(format!("{err:#}").contains("nonexistent"));
    }

    #[tokio::test]
    async fn test_run_logs_until_shutdown() {
        let directory = temp_dir();
        let config = test_config(directory.clone());
        let session = session(SimulatedTransport::new());

        let outcome = run_session(&config, Arc::clone(&session), tokio::time::sleep(Duration::from_millis(300)))
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Shutdown);
        assert_eq!(session.state(), SessionState::Disconnected);

        let files: Vec<_> = std::fs::read_dir(&directory).unwrap().collect();
        assert_eq!(files.len(), 1);
        let path = files[0].as_ref().unwrap().path();
        let contents = std::fs::read_to_string(path).unwrap();
        let mut lines = contents.lines();
        assert!(lines.next().unwrap().starts_with("timestamp,scenario,010C,010D"));
        assert!(lines.count() >= 2);

        std::fs::remove_dir_all(&directory).ok();
    }

    #[tokio::test]
    async fn test_run_ends_when_link_is_lost() {
        let directory = temp_dir();
        let mut config = test_config(directory.clone());
        config.logging.enabled = false;
        let transport = SimulatedTransport::new();
        let failure = transport.failure_switch();
        let session = session(transport);

        let run = tokio::spawn({
            let session = Arc::clone(&session);
            async move { run_session(&config, session, std::future::pending()).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        failure.store(true, Ordering::SeqCst);

        let outcome = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RunOutcome::LinkLost(SessionState::Disconnected));
        assert!(session.last_error().is_some());
        assert!(!directory.exists());
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let transport = SimulatedTransport::new();
        transport.failure_switch().store(true, Ordering::SeqCst);
        let session = session(transport);
        let config = test_config(temp_dir());

        let err = run_session(&config, session, std::future::pending())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("connecting to the adapter"));
    }
}
