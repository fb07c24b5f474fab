//! Per-PID staleness cache

use obd_protocol::ParsedReading;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct CacheEntry {
    reading: ParsedReading,
    fetched_at: Instant,
}

/// A cached reading with its age
#[derive(Debug, Clone, Serialize)]
pub struct CachedValue {
    pub pid: String,
    pub reading: ParsedReading,
    #[serde(with = "millis")]
    pub age: Duration,
    /// Older than the PID's staleness window
    pub stale: bool,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Latest reading per PID
pub struct ReadingCache {
    entries: HashMap<String, CacheEntry>,
    default_window: Duration,
    windows: HashMap<String, Duration>,
    retention: Duration,
}

impl ReadingCache {
    /// # Arguments
    /// * `default_window` - Staleness window for PIDs without their own
    /// * `windows` - Per-PID staleness windows
    /// * `retention` - Age after which `evict_stale` drops an entry
    pub fn new(
        default_window: Duration,
        windows: HashMap<String, Duration>,
        retention: Duration,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            default_window,
            windows,
            retention,
        }
    }

    pub fn window(&self, pid: &str) -> Duration {
        self.windows.get(pid).copied().unwrap_or(self.default_window)
    }

    pub fn insert(&mut self, reading: ParsedReading) {
        self.insert_at(reading, Instant::now());
    }

    pub fn insert_at(&mut self, reading: ParsedReading, fetched_at: Instant) {
        self.entries
            .insert(reading.pid.clone(), CacheEntry { reading, fetched_at });
    }

    /// Reading younger than the PID's window
    pub fn fresh(&self, pid: &str) -> Option<&ParsedReading> {
        self.entries
            .get(pid)
            .filter(|e| e.fetched_at.elapsed() < self.window(pid))
            .map(|e| &e.reading)
    }

    /// Every entry, sorted by PID, with age and staleness
    pub fn snapshot(&self) -> Vec<CachedValue> {
        let mut values: Vec<CachedValue> = self
            .entries
            .iter()
            .map(|(pid, entry)| {
                let age = entry.fetched_at.elapsed();
                CachedValue {
                    pid: pid.clone(),
                    reading: entry.reading.clone(),
                    age,
                    stale: age >= self.window(pid),
                }
            })
            .collect();
        values.sort_by(|a, b| a.pid.cmp(&b.pid));
        values
    }

    /// Drop entries older than the retention period; returns how many
    pub fn evict_stale(&mut self) -> usize {
        let before = self.entries.len();
        let retention = self.retention;
        self.entries
            .retain(|_, entry| entry.fetched_at.elapsed() < retention);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::PidRegistry;

    fn reading(pid: &str, raw: &str) -> ParsedReading {
        PidRegistry::standard().decode(pid, raw, 0)
    }

    fn cache() -> ReadingCache {
        let windows = HashMap::from([("0105".to_string(), Duration::from_secs(60))]);
        ReadingCache::new(Duration::from_millis(100), windows, Duration::from_secs(300))
    }

    #[test]
    fn test_fresh_respects_per_pid_window() {
        let mut cache = cache();
        let old = Instant::now() - Duration::from_secs(5);
        cache.insert_at(reading("010C", "41 0C 1A F8"), old);
        cache.insert_at(reading("0105", "41 05 7B"), old);

        assert!(cache.fresh("010C").is_none());
        assert_eq!(cache.fresh("0105").and_then(|r| r.value), Some(83.0));
        assert!(cache.fresh("010D").is_none());
    }

    #[test]
    fn test_snapshot_flags_stale_entries() {
        let mut cache = cache();
        cache.insert_at(reading("010C", "41 0C 1A F8"), Instant::now() - Duration::from_secs(1));
        cache.insert(reading("010D", "41 0D 32"));

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].pid, "010C");
        assert!(snapshot[0].stale);
        assert!(snapshot[0].age >= Duration::from_secs(1));
        assert!(!snapshot[1].stale);
    }

    #[test]
    fn test_evict_stale_drops_only_expired() {
        let mut cache = ReadingCache::new(
            Duration::from_millis(100),
            HashMap::new(),
            Duration::from_millis(500),
        );
        cache.insert_at(reading("010C", "41 0C 1A F8"), Instant::now() - Duration::from_secs(2));
        cache.insert(reading("010D", "41 0D 32"));

        assert_eq!(cache.evict_stale(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.fresh("010D").is_some());
    }
}
