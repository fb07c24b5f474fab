//! CSV Session Logger

use crate::StorageError;
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Logger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Directory receiving the log files
    pub directory: PathBuf,
    /// File name prefix
    pub prefix: String,
    /// File extension without the dot
    pub extension: String,
    /// Rotate once a file reaches this size
    pub max_size_bytes: u64,
    /// PID columns, in output order
    pub columns: Vec<String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            prefix: "obd_session".to_string(),
            extension: "csv".to_string(),
            max_size_bytes: 10 * 1024 * 1024,
            columns: Vec::new(),
        }
    }
}

/// One poll cycle worth of values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp_ms: u64,
    pub values: BTreeMap<String, Option<f64>>,
    pub scenario: Option<String>,
}

impl LogRecord {
    pub fn new(timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            ..Self::default()
        }
    }

    pub fn with_scenario(mut self, scenario: Option<String>) -> Self {
        self.scenario = scenario;
        self
    }

    pub fn insert(&mut self, pid: &str, value: Option<f64>) {
        self.values.insert(pid.to_string(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

struct ActiveFile {
    writer: csv::Writer<File>,
    path: PathBuf,
}

struct LoggerState {
    file: Option<ActiveFile>,
    next_sequence: u32,
    written: Vec<PathBuf>,
}

/// Append-only CSV log shared by every polling tier
pub struct SessionLogger {
    config: LoggerConfig,
    state: Mutex<LoggerState>,
}

fn format_timestamp(timestamp_ms: u64) -> String {
    i64::try_from(timestamp_ms)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

fn format_value(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl SessionLogger {
    /// Create the directory if needed and open the first file
    pub fn open(config: LoggerConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.directory)?;
        let mut state = LoggerState {
            file: None,
            next_sequence: 1,
            written: Vec::new(),
        };
        let file = Self::create_file(&config, &mut state)?;
        info!("Session log opened at {}", file.path.display());
        state.file = Some(file);

        Ok(Self {
            config,
            state: Mutex::new(state),
        })
    }

    fn file_path(config: &LoggerConfig, sequence: u32) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        config.directory.join(format!(
            "{}_{}_{:04}.{}",
            config.prefix, stamp, sequence, config.extension
        ))
    }

    fn create_file(config: &LoggerConfig, state: &mut LoggerState) -> Result<ActiveFile, StorageError> {
        let mut path = Self::file_path(config, state.next_sequence);
        while path.exists() {
            state.next_sequence += 1;
            path = Self::file_path(config, state.next_sequence);
        }
        state.next_sequence += 1;

        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new().flexible(false).from_writer(file);

        let mut header = vec!["timestamp".to_string(), "scenario".to_string()];
        header.extend(config.columns.iter().cloned());
        writer.write_record(&header)?;
        writer.flush()?;

        state.written.push(path.clone());
        Ok(ActiveFile { writer, path })
    }

    /// Append one row, then rotate if the file reached the size threshold
    pub fn write(&self, record: &LogRecord) -> Result<(), StorageError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| StorageError::Lock(e.to_string()))?;
        let file = state.file.as_mut().ok_or(StorageError::Closed)?;

        let mut row = Vec::with_capacity(self.config.columns.len() + 2);
        row.push(format_timestamp(record.timestamp_ms));
        row.push(record.scenario.clone().unwrap_or_default());
        for column in &self.config.columns {
            row.push(format_value(record.values.get(column).copied().flatten()));
        }
        file.writer.write_record(&row)?;
        file.writer.flush()?;

        let size = file.writer.get_ref().metadata()?.len();
        if size >= self.config.max_size_bytes {
            debug!(
                "Rotating {} at {} bytes",
                file.path.display(),
                size
            );
            let next = Self::create_file(&self.config, &mut state)?;
            info!("Session log rotated to {}", next.path.display());
            state.file = Some(next);
        }
        Ok(())
    }

    /// Flush and release the current file; later writes fail with `Closed`
    pub fn close(&self) -> Result<(), StorageError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| StorageError::Lock(e.to_string()))?;
        if let Some(mut file) = state.file.take() {
            file.writer.flush()?;
            info!("Session log closed: {}", file.path.display());
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.file.is_none()).unwrap_or(true)
    }

    /// File currently being written
    pub fn current_path(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.file.as_ref().map(|f| f.path.clone()))
    }

    /// Every file opened by this logger, oldest first
    pub fn files(&self) -> Vec<PathBuf> {
        self.state
            .lock()
            .map(|s| s.written.clone())
            .unwrap_or_default()
    }

    pub fn columns(&self) -> &[String] {
        &self.config.columns
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn temp_config(max_size_bytes: u64) -> LoggerConfig {
        LoggerConfig {
            directory: std::env::temp_dir().join(format!("obd-logger-{}", uuid::Uuid::new_v4())),
            prefix: "test".to_string(),
            extension: "csv".to_string(),
            max_size_bytes,
            columns: vec!["010C".to_string(), "010D".to_string()],
        }
    }

    fn record() -> LogRecord {
        let mut record = LogRecord::new(1_700_000_000_123).with_scenario(Some("idle".to_string()));
        record.insert("010C", Some(1726.0));
        record.insert("010D", None);
        record
    }

    #[test]
    fn test_header_and_row_format() {
        let config = temp_config(1 << 20);
        let logger = SessionLogger::open(config.clone()).unwrap();
        logger.write(&record()).unwrap();
        logger.close().unwrap();

        let path = &logger.files()[0];
        let contents = fs::read_to_string(path).unwrap();
        assert_eq!(
            contents,
            "timestamp,scenario,010C,010D\n2023-11-14T22:13:20.123Z,idle,1726,\n"
        );

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("test_"));
        assert!(name.ends_with("_0001.csv"));
        // prefix_YYYYmmdd_HHMMSS_NNNN.csv
        assert_eq!(name.len(), "test_20240101_120000_0001.csv".len());
        fs::remove_dir_all(&config.directory).unwrap();
    }

    #[test]
    fn test_rotates_exactly_once() {
        let header_len = "timestamp,scenario,010C,010D\n".len() as u64;
        let row_len = "2023-11-14T22:13:20.123Z,idle,1726,\n".len() as u64;
        let max = header_len + row_len * 3;
        let config = temp_config(max);
        let logger = SessionLogger::open(config.clone()).unwrap();

        // Third row reaches the threshold, the next three stay below it
        for _ in 0..5 {
            logger.write(&record()).unwrap();
        }

        let files = logger.files();
        assert_eq!(files.len(), 2);
        assert_ne!(files[0], files[1]);
        let first = fs::metadata(&files[0]).unwrap().len();
        assert!(first >= max);
        assert!(first <= max + row_len);
        let second = fs::metadata(&files[1]).unwrap().len();
        assert_eq!(second, header_len + row_len * 2);
        assert!(files[1].to_str().unwrap().ends_with("_0002.csv"));
        fs::remove_dir_all(&config.directory).unwrap();
    }

    #[test]
    fn test_write_after_close_fails() {
        let config = temp_config(1 << 20);
        let logger = SessionLogger::open(config.clone()).unwrap();
        logger.close().unwrap();
        assert!(logger.is_closed());
        assert!(matches!(logger.write(&record()), Err(StorageError::Closed)));
        logger.close().unwrap();
        fs::remove_dir_all(&config.directory).unwrap();
    }

    #[test]
    fn test_concurrent_writers_share_one_file() {
        let config = temp_config(1 << 20);
        let logger = Arc::new(SessionLogger::open(config.clone()).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let logger = Arc::clone(&logger);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        logger.write(&record()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let contents = fs::read_to_string(logger.current_path().unwrap()).unwrap();
        assert_eq!(contents.lines().count(), 101);
        fs::remove_dir_all(&config.directory).unwrap();
    }
}
