//! Activity counters for the receiver.
//!
//! Tracks how many readings, crossings and labels the agent has handled so
//! that an operator can see at a glance whether samples are being produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Activity statistics for the current process, optionally persisted.
#[derive(Debug)]
pub struct ActivityLog {
    /// Readings handed to the detector
    readings_processed: AtomicU64,
    /// Stream lines that could not be parsed
    malformed_lines: AtomicU64,
    /// Crossings emitted by the detector
    crossings_detected: AtomicU64,
    /// Crossings swallowed by an open debounce window
    crossings_suppressed: AtomicU64,
    /// Labeling invocations
    labels_attempted: AtomicU64,
    /// Labeled records written
    labels_stored: AtomicU64,
    /// Labeling invocations that wrote nothing
    labels_failed: AtomicU64,
    /// Stored records per class
    label_active: AtomicU64,
    label_idle: AtomicU64,
    label_suppressed: AtomicU64,
    /// Process start time
    started_at: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl ActivityLog {
    /// Create a new activity log.
    pub fn new() -> Self {
        Self {
            readings_processed: AtomicU64::new(0),
            malformed_lines: AtomicU64::new(0),
            crossings_detected: AtomicU64::new(0),
            crossings_suppressed: AtomicU64::new(0),
            labels_attempted: AtomicU64::new(0),
            labels_stored: AtomicU64::new(0),
            labels_failed: AtomicU64::new(0),
            label_active: AtomicU64::new(0),
            label_idle: AtomicU64::new(0),
            label_suppressed: AtomicU64::new(0),
            started_at: Utc::now(),
            persist_path: None,
        }
    }

    /// Create an activity log that resumes from and saves to `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!("Could not load previous activity stats: {}", e);
        }

        log
    }

    pub fn record_reading(&self) {
        self.readings_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_line(&self) {
        self.malformed_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_crossing(&self) {
        self.crossings_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suppressed_crossing(&self) {
        self.crossings_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_label_attempt(&self) {
        self.labels_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_label_failed(&self) {
        self.labels_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stored labeled record of the given class.
    pub fn record_label_stored(&self, label: i32) {
        self.labels_stored.fetch_add(1, Ordering::Relaxed);
        let counter = match label {
            1 => &self.label_active,
            -1 => &self.label_suppressed,
            _ => &self.label_idle,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn stats(&self) -> ActivityStats {
        ActivityStats {
            readings_processed: self.readings_processed.load(Ordering::Relaxed),
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
            crossings_detected: self.crossings_detected.load(Ordering::Relaxed),
            crossings_suppressed: self.crossings_suppressed.load(Ordering::Relaxed),
            labels_attempted: self.labels_attempted.load(Ordering::Relaxed),
            labels_stored: self.labels_stored.load(Ordering::Relaxed),
            labels_failed: self.labels_failed.load(Ordering::Relaxed),
            label_counts: LabelCounts {
                active: self.label_active.load(Ordering::Relaxed),
                idle: self.label_idle.load(Ordering::Relaxed),
                suppressed: self.label_suppressed.load(Ordering::Relaxed),
            },
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Activity:\n\
             - Readings processed: {}\n\
             - Malformed lines: {}\n\
             - Crossings detected: {} ({} suppressed)\n\
             - Labels attempted: {}\n\
             - Labels stored: {} (active {}, idle {}, suppressed {})\n\
             - Labels failed: {}\n\
             - Uptime: {} seconds",
            stats.readings_processed,
            stats.malformed_lines,
            stats.crossings_detected,
            stats.crossings_suppressed,
            stats.labels_attempted,
            stats.labels_stored,
            stats.label_counts.active,
            stats.label_counts.idle,
            stats.label_counts.suppressed,
            stats.labels_failed,
            stats.uptime_secs
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                readings_processed: stats.readings_processed,
                malformed_lines: stats.malformed_lines,
                crossings_detected: stats.crossings_detected,
                crossings_suppressed: stats.crossings_suppressed,
                labels_attempted: stats.labels_attempted,
                labels_stored: stats.labels_stored,
                labels_failed: stats.labels_failed,
                label_counts: stats.label_counts,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                let pairs = [
                    (&self.readings_processed, persisted.readings_processed),
                    (&self.malformed_lines, persisted.malformed_lines),
                    (&self.crossings_detected, persisted.crossings_detected),
                    (&self.crossings_suppressed, persisted.crossings_suppressed),
                    (&self.labels_attempted, persisted.labels_attempted),
                    (&self.labels_stored, persisted.labels_stored),
                    (&self.labels_failed, persisted.labels_failed),
                    (&self.label_active, persisted.label_counts.active),
                    (&self.label_idle, persisted.label_counts.idle),
                    (&self.label_suppressed, persisted.label_counts.suppressed),
                ];
                for (counter, value) in pairs {
                    counter.store(value, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Stored-label counts per class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCounts {
    pub active: u64,
    pub idle: u64,
    pub suppressed: u64,
}

/// Snapshot of activity statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityStats {
    pub readings_processed: u64,
    pub malformed_lines: u64,
    pub crossings_detected: u64,
    pub crossings_suppressed: u64,
    pub labels_attempted: u64,
    pub labels_stored: u64,
    pub labels_failed: u64,
    pub label_counts: LabelCounts,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    readings_processed: u64,
    malformed_lines: u64,
    crossings_detected: u64,
    crossings_suppressed: u64,
    labels_attempted: u64,
    labels_stored: u64,
    labels_failed: u64,
    label_counts: LabelCounts,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared activity log.
pub type SharedActivityLog = Arc<ActivityLog>;

/// Create a new shared activity log.
pub fn create_shared_log() -> SharedActivityLog {
    Arc::new(ActivityLog::new())
}

/// Create a new shared activity log with persistence.
pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedActivityLog {
    Arc::new(ActivityLog::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_counts_by_class() {
        let log = ActivityLog::new();

        log.record_label_stored(1);
        log.record_label_stored(1);
        log.record_label_stored(0);
        log.record_label_stored(-1);

        let stats = log.stats();
        assert_eq!(stats.labels_stored, 4);
        assert_eq!(
            stats.label_counts,
            LabelCounts {
                active: 2,
                idle: 1,
                suppressed: 1
            }
        );
    }

    #[test]
    fn test_persistence_resumes_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.json");

        let log = ActivityLog::with_persistence(path.clone());
        log.record_reading();
        log.record_reading();
        log.record_crossing();
        log.save().unwrap();

        let resumed = ActivityLog::with_persistence(path);
        let stats = resumed.stats();
        assert_eq!(stats.readings_processed, 2);
        assert_eq!(stats.crossings_detected, 1);
    }

    #[test]
    fn test_summary_format() {
        let log = ActivityLog::new();
        log.record_suppressed_crossing();
        let summary = log.summary();

        assert!(summary.contains("Readings processed"));
        assert!(summary.contains("1 suppressed"));
    }
}
