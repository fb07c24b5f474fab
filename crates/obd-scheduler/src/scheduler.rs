//! Sampling Scheduler Implementation

use crate::cache::{CachedValue, ReadingCache};
use crate::observer::ReadingObserver;
use crate::SchedulerError;
use obd_protocol::{AdapterSession, SessionState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use storage::{LogRecord, SessionLogger};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Configuration for the sampling scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Period of the fast tier (default: 200 ms)
    pub fast_period: Duration,
    /// Period of the slow tier (default: 2 s)
    pub slow_period: Duration,
    /// PIDs polled every fast period
    pub fast_pids: Vec<String>,
    /// PIDs polled every slow period
    pub slow_pids: Vec<String>,
    /// Consecutive failed reads before the session is marked disconnected
    pub max_failed_reads: u32,
    /// Staleness window for PIDs without their own
    pub default_stale_after: Duration,
    /// Per-PID staleness windows
    pub stale_after: HashMap<String, Duration>,
    /// Cache entries older than this are evicted
    pub cache_retention: Duration,
    /// Tag written with every log record
    pub scenario: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fast_period: Duration::from_millis(200),
            slow_period: Duration::from_secs(2),
            fast_pids: ["010C", "010D", "0104", "0111"].map(String::from).to_vec(),
            slow_pids: ["0105", "010F", "012F", "0142"].map(String::from).to_vec(),
            max_failed_reads: 3,
            default_stale_after: Duration::from_millis(150),
            stale_after: HashMap::new(),
            cache_retention: Duration::from_secs(60),
            scenario: None,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.fast_period.is_zero() || self.slow_period.is_zero() {
            return Err(SchedulerError::InvalidConfig("tier periods must be non-zero".into()));
        }
        if self.fast_pids.is_empty() && self.slow_pids.is_empty() {
            return Err(SchedulerError::InvalidConfig("no PIDs to poll".into()));
        }
        if self.max_failed_reads == 0 {
            return Err(SchedulerError::InvalidConfig("max_failed_reads must be at least 1".into()));
        }
        Ok(())
    }

    pub fn period(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Fast => self.fast_period,
            Tier::Slow => self.slow_period,
        }
    }

    pub fn pids(&self, tier: Tier) -> &[String] {
        match tier {
            Tier::Fast => &self.fast_pids,
            Tier::Slow => &self.slow_pids,
        }
    }

    /// Every polled PID in log column order, without duplicates
    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for pid in self.fast_pids.iter().chain(&self.slow_pids) {
            if !columns.contains(pid) {
                columns.push(pid.clone());
            }
        }
        columns
    }
}

/// Polling cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Fast,
    Slow,
}

/// What one tier tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// PIDs read from the vehicle
    pub polled: usize,
    /// PIDs served from the cache
    pub reused: usize,
    /// Reads that failed at the link level
    pub failed: usize,
    /// PIDs refused by the session (unknown or unsupported)
    pub skipped: usize,
    /// The failure policy disconnected the session during this tick
    pub disconnected: bool,
}

/// Drives the fast and slow polling tiers over one session
pub struct SamplingScheduler {
    session: Arc<AdapterSession>,
    logger: Option<Arc<SessionLogger>>,
    observer: Arc<dyn ReadingObserver>,
    config: SchedulerConfig,
    cache: Mutex<ReadingCache>,
    consecutive_failures: AtomicU32,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl SamplingScheduler {
    pub fn new(
        session: Arc<AdapterSession>,
        logger: Option<Arc<SessionLogger>>,
        observer: Arc<dyn ReadingObserver>,
        config: SchedulerConfig,
    ) -> Self {
        let cache = ReadingCache::new(
            config.default_stale_after,
            config.stale_after.clone(),
            config.cache_retention,
        );
        let (stop_tx, _) = watch::channel(false);
        Self {
            session,
            logger,
            observer,
            config,
            cache: Mutex::new(cache),
            consecutive_failures: AtomicU32::new(0),
            started: AtomicBool::new(false),
            stop_tx,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn cache_guard(&self) -> MutexGuard<'_, ReadingCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached readings with age and staleness
    pub fn snapshot(&self) -> Vec<CachedValue> {
        self.cache_guard().snapshot()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Poll every PID of one tier once.
    ///
    /// Fresh cache entries are reused; new readings are cached, logged as one
    /// record and forwarded to the observer.
    pub async fn poll_tier(&self, tier: Tier) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        if self.is_stopped() {
            return outcome;
        }

        let mut record = LogRecord::new(now_ms()).with_scenario(self.config.scenario.clone());

        for pid in self.config.pids(tier) {
            if self.cache_guard().fresh(pid).is_some() {
                outcome.reused += 1;
                continue;
            }
            if !self.session.state().accepts_commands() {
                debug!("{:?} tier: session {:?}, skipping rest of tick", tier, self.session.state());
                break;
            }

            match self.session.read_pid(pid).await {
                Ok(reading) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    record.insert(pid, reading.value);
                    self.observer.on_reading(pid, &reading);
                    self.cache_guard().insert(reading);
                    outcome.polled += 1;
                }
                Err(e) if e.is_transport() => {
                    outcome.failed += 1;
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(
                        "Read {} failed ({}/{}): {}",
                        pid, failures, self.config.max_failed_reads, e
                    );
                    if failures >= self.config.max_failed_reads {
                        self.give_up(failures).await;
                        outcome.disconnected = true;
                        break;
                    }
                }
                Err(e) => {
                    outcome.skipped += 1;
                    debug!("{} not polled: {}", pid, e);
                }
            }
        }

        if tier == Tier::Slow {
            let evicted = self.cache_guard().evict_stale();
            if evicted > 0 {
                debug!("Evicted {} expired cache entries", evicted);
            }
        }

        if !record.is_empty() {
            if let Some(logger) = &self.logger {
                // File I/O stays off the runtime workers
                let logger = Arc::clone(logger);
                match tokio::task::spawn_blocking(move || logger.write(&record)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("Failed to write log record: {}", e);
                        self.observer.on_logging_error(&e);
                    }
                    Err(e) => warn!("Log writer task failed: {}", e),
                }
            }
        }

        outcome
    }

    async fn give_up(&self, failures: u32) {
        error!(
            "{} consecutive failed reads, marking adapter disconnected",
            failures
        );
        self.session
            .mark_disconnected(&format!("{failures} consecutive failed reads"))
            .await;
        self.request_stop();
    }

    /// Spawn both tiers and the session-state forwarder
    pub fn start(self: Arc<Self>) -> Result<SchedulerHandle, SchedulerError> {
        self.config.validate()?;
        let state = self.session.state();
        if state != SessionState::Ready {
            return Err(SchedulerError::SessionNotReady(state));
        }
        if self.started.swap(true, Ordering::SeqCst) || self.is_stopped() {
            return Err(SchedulerError::AlreadyStarted);
        }

        info!(
            "Starting sampler: {} fast PIDs every {:?}, {} slow PIDs every {:?}",
            self.config.fast_pids.len(),
            self.config.fast_period,
            self.config.slow_pids.len(),
            self.config.slow_period
        );

        let mut tasks = Vec::new();
        for tier in [Tier::Fast, Tier::Slow] {
            if !self.config.pids(tier).is_empty() {
                tasks.push(tokio::spawn(Arc::clone(&self).run_tier(tier)));
            }
        }
        tasks.push(tokio::spawn(Arc::clone(&self).forward_states()));

        Ok(SchedulerHandle {
            scheduler: self,
            tasks,
        })
    }

    async fn run_tier(self: Arc<Self>, tier: Tier) {
        let mut stop = self.stop_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.period(tier));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }
            // Not raced against `stop`: an exchange is never abandoned midway
            let outcome = self.poll_tier(tier).await;
            if outcome.disconnected {
                break;
            }
        }
        debug!("{:?} tier stopped", tier);
    }

    async fn forward_states(self: Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();
        let mut states = self.session.subscribe();
        loop {
            tokio::select! {
                biased;
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    self.observer.on_session_state(state);
                }
                _ = stop.changed() => break,
            }
        }
    }
}

/// Running scheduler tasks
pub struct SchedulerHandle {
    scheduler: Arc<SamplingScheduler>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn scheduler(&self) -> &Arc<SamplingScheduler> {
        &self.scheduler
    }

    /// Whether every task has exited (stop requested or session given up)
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }

    /// Signal both tiers and wait for them; an in-flight poll completes first
    pub async fn stop(self) {
        info!("Stopping sampler");
        self.scheduler.request_stop();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Sampler task ended abnormally: {}", e);
            }
        }
        info!("Sampler stopped");
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::transport::SimulatedTransport;
    use obd_protocol::{ParsedReading, PidRegistry, SessionConfig};
    use storage::{LoggerConfig, StorageError};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        readings: Mutex<Vec<(String, Option<f64>)>>,
        states: Mutex<Vec<SessionState>>,
        logging_errors: AtomicU32,
        state_tx: Mutex<Option<mpsc::UnboundedSender<SessionState>>>,
    }

    impl ReadingObserver for Recorder {
        fn on_reading(&self, pid: &str, reading: &ParsedReading) {
            self.readings.lock().unwrap().push((pid.to_string(), reading.value));
        }

        fn on_session_state(&self, state: SessionState) {
            self.states.lock().unwrap().push(state);
            if let Some(tx) = self.state_tx.lock().unwrap().as_ref() {
                let _ = tx.send(state);
            }
        }

        fn on_logging_error(&self, _error: &StorageError) {
            self.logging_errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn ready_session(transport: SimulatedTransport) -> Arc<AdapterSession> {
        let session = Arc::new(AdapterSession::new(
            Box::new(transport),
            Arc::new(PidRegistry::standard()),
            SessionConfig::default(),
        ));
        session.connect().await.unwrap();
        session
    }

    fn config(fast: &[&str], slow: &[&str]) -> SchedulerConfig {
        SchedulerConfig {
            fast_period: Duration::from_millis(20),
            slow_period: Duration::from_millis(50),
            fast_pids: fast.iter().map(|p| p.to_string()).collect(),
            slow_pids: slow.iter().map(|p| p.to_string()).collect(),
            default_stale_after: Duration::ZERO,
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_poll_forwards_and_caches() {
        let session = ready_session(SimulatedTransport::new().with_response("010C", "41 0C 1A F8")).await;
        let recorder = Arc::new(Recorder::default());
        let scheduler = SamplingScheduler::new(session, None, recorder.clone(), config(&["010C", "010D"], &[]));

        let outcome = scheduler.poll_tier(Tier::Fast).await;
        assert_eq!(outcome.polled, 2);
        assert_eq!(recorder.readings.lock().unwrap()[0], ("010C".to_string(), Some(1726.0)));
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].reading.value, Some(1726.0));
    }

    #[tokio::test]
    async fn test_fresh_cache_entry_is_reused() {
        let transport = SimulatedTransport::new();
        let sent = transport.sent_commands();
        let session = ready_session(transport).await;
        let mut cfg = config(&["010C"], &["010C", "0105"]);
        cfg.stale_after.insert("010C".to_string(), Duration::from_secs(60));
        let scheduler = SamplingScheduler::new(session, None, Arc::new(Recorder::default()), cfg);

        scheduler.poll_tier(Tier::Fast).await;
        let before = sent.lock().unwrap().len();
        let outcome = scheduler.poll_tier(Tier::Slow).await;

        assert_eq!(outcome.reused, 1);
        assert_eq!(outcome.polled, 1);
        let sent = sent.lock().unwrap();
        assert_eq!(&sent[before..], ["0105"]);
    }

    #[tokio::test]
    async fn test_three_failed_polls_disconnect() {
        let transport = SimulatedTransport::new();
        let failing = transport.failure_switch();
        let session = ready_session(transport).await;
        let scheduler = SamplingScheduler::new(
            Arc::clone(&session),
            None,
            Arc::new(Recorder::default()),
            config(&["010C"], &[]),
        );

        failing.store(true, Ordering::SeqCst);
        assert_eq!(scheduler.poll_tier(Tier::Fast).await.failed, 1);
        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(scheduler.poll_tier(Tier::Fast).await.failed, 1);

        let outcome = scheduler.poll_tier(Tier::Fast).await;
        assert!(outcome.disconnected);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(scheduler.is_stopped());
        assert!(session.last_error().unwrap().contains("3 consecutive failed reads"));

        // Stopped: nothing more is attempted
        assert_eq!(scheduler.poll_tier(Tier::Fast).await, PollOutcome::default());
    }

    #[tokio::test]
    async fn test_success_resets_failure_counter() {
        let transport = SimulatedTransport::new();
        let failing = transport.failure_switch();
        let session = ready_session(transport).await;
        let scheduler = SamplingScheduler::new(
            Arc::clone(&session),
            None,
            Arc::new(Recorder::default()),
            config(&["010C"], &[]),
        );

        for _ in 0..2 {
            failing.store(true, Ordering::SeqCst);
            scheduler.poll_tier(Tier::Fast).await;
            scheduler.poll_tier(Tier::Fast).await;
            assert_eq!(scheduler.consecutive_failures(), 2);
            failing.store(false, Ordering::SeqCst);
            scheduler.poll_tier(Tier::Fast).await;
            assert_eq!(scheduler.consecutive_failures(), 0);
        }
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_unsupported_pid_is_not_a_failure() {
        let session = ready_session(SimulatedTransport::new().with_supported_pids(&[0x0C])).await;
        let scheduler = SamplingScheduler::new(
            session,
            None,
            Arc::new(Recorder::default()),
            config(&["010C", "0105"], &[]),
        );
        for _ in 0..4 {
            let outcome = scheduler.poll_tier(Tier::Fast).await;
            assert_eq!((outcome.polled, outcome.skipped), (1, 1));
        }
        assert_eq!(scheduler.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_tick_writes_one_log_record() {
        let directory = std::env::temp_dir().join(format!("obd-sched-{}", uuid::Uuid::new_v4()));
        let cfg = config(&["010C", "010D"], &[]);
        let logger = Arc::new(
            SessionLogger::open(LoggerConfig {
                directory: directory.clone(),
                columns: cfg.columns(),
                ..LoggerConfig::default()
            })
            .unwrap(),
        );
        let session = ready_session(SimulatedTransport::new()).await;
        let scheduler = SamplingScheduler::new(session, Some(Arc::clone(&logger)), Arc::new(Recorder::default()), cfg);

        scheduler.poll_tier(Tier::Fast).await;
        scheduler.poll_tier(Tier::Fast).await;
        logger.close().unwrap();

        let contents = std::fs::read_to_string(&logger.files()[0]).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,scenario,010C,010D");
        assert_eq!(lines[1].split(',').count(), 4);
        std::fs::remove_dir_all(directory).unwrap();
    }

    #[tokio::test]
    async fn test_logging_error_reported_and_polling_continues() {
        let directory = std::env::temp_dir().join(format!("obd-sched-{}", uuid::Uuid::new_v4()));
        let logger = Arc::new(
            SessionLogger::open(LoggerConfig {
                directory: directory.clone(),
                ..LoggerConfig::default()
            })
            .unwrap(),
        );
        logger.close().unwrap();
        let recorder = Arc::new(Recorder::default());
        let session = ready_session(SimulatedTransport::new()).await;
        let scheduler = SamplingScheduler::new(session, Some(logger), recorder.clone(), config(&["010C"], &[]));

        assert_eq!(scheduler.poll_tier(Tier::Fast).await.polled, 1);
        assert_eq!(recorder.logging_errors.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.readings.lock().unwrap().len(), 1);
        std::fs::remove_dir_all(directory).unwrap();
    }

    #[tokio::test]
    async fn test_running_tiers_stop_cleanly() {
        let session = ready_session(SimulatedTransport::new()).await;
        let recorder = Arc::new(Recorder::default());
        let scheduler = Arc::new(SamplingScheduler::new(
            Arc::clone(&session),
            None,
            recorder.clone(),
            config(&["010C"], &["0105"]),
        ));

        let handle = Arc::clone(&scheduler).start().unwrap();
        assert!(matches!(
            Arc::clone(&scheduler).start(),
            Err(SchedulerError::AlreadyStarted)
        ));
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop().await;

        let readings = recorder.readings.lock().unwrap();
        assert!(readings.iter().any(|(pid, _)| pid == "010C"));
        assert!(readings.iter().any(|(pid, _)| pid == "0105"));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_running_scheduler_reports_disconnect() {
        let transport = SimulatedTransport::new();
        let failing = transport.failure_switch();
        let session = ready_session(transport).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            state_tx: Mutex::new(Some(tx)),
            ..Recorder::default()
        });
        let scheduler = Arc::new(SamplingScheduler::new(
            Arc::clone(&session),
            None,
            recorder.clone(),
            config(&["010C"], &[]),
        ));
        let handle = scheduler.start().unwrap();

        failing.store(true, Ordering::SeqCst);
        let disconnected = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(state) = rx.recv().await {
                if state == SessionState::Disconnected {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(disconnected);

        tokio::time::timeout(Duration::from_secs(1), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_start_requires_ready_session() {
        let session = Arc::new(AdapterSession::new(
            Box::new(SimulatedTransport::new()),
            Arc::new(PidRegistry::standard()),
            SessionConfig::default(),
        ));
        let scheduler = Arc::new(SamplingScheduler::new(
            session,
            None,
            Arc::new(Recorder::default()),
            config(&["010C"], &[]),
        ));
        assert!(matches!(
            scheduler.start(),
            Err(SchedulerError::SessionNotReady(SessionState::Uninitialized))
        ));
    }

    #[test]
    fn test_config_validation_and_columns() {
        assert!(SchedulerConfig::default().validate().is_ok());
        let mut cfg = config(&["010C"], &["010C", "0105"]);
        assert_eq!(cfg.columns(), ["010C", "0105"]);
        cfg.fast_period = Duration::ZERO;
        assert!(cfg.validate().is_err());
        assert!(config(&[], &[]).validate().is_err());
    }
}
