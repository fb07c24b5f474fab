//! OBD-II Acquisition Daemon - Main Entry Point

use obd_daemon::config::AppConfig;
use obd_daemon::{init_logging, run, RunOutcome};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    info!("=== OBD-II Acquisition Daemon v{} ===", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load()?;
    info!(
        "Sampling {} fast PIDs every {} ms and {} slow PIDs every {} ms",
        config.scheduler.fast_pids.len(),
        config.scheduler.fast_period_ms,
        config.scheduler.slow_pids.len(),
        config.scheduler.slow_period_ms
    );

    match run(config).await? {
        RunOutcome::Shutdown => Ok(()),
        RunOutcome::LinkLost(state) => anyhow::bail!("adapter link lost (session {state:?})"),
    }
}
