//! Turning a pose window into a labeled training record.
//!
//! Shared by the crossing pipeline and the baseline scheduler: fetch a
//! window ending at a timestamp, normalize it, and store it with a label.

use crate::activity::SharedActivityLog;
use crate::core::normalize::{Normalizer, UnsupportedShape};
use crate::store::pose::LabeledPoseRecord;
use crate::store::{PoseError, PoseStore, RecordWriter, StoreError};
use serde::Serialize;

/// Why a labeling pass wrote nothing.
#[derive(Debug)]
pub enum LabelingError {
    /// Fewer valid pose samples than a window needs
    InsufficientData { found: usize, required: usize },
    /// Samples could not be brought into the body layout
    Malformed(String),
    /// Reading poses or writing the record failed
    Persistence(StoreError),
}

impl std::fmt::Display for LabelingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelingError::InsufficientData { found, required } => {
                write!(f, "Insufficient pose data: {found} of {required} samples")
            }
            LabelingError::Malformed(msg) => write!(f, "Malformed pose window: {msg}"),
            LabelingError::Persistence(e) => write!(f, "Persistence error: {e}"),
        }
    }
}

impl std::error::Error for LabelingError {}

impl From<PoseError> for LabelingError {
    fn from(e: PoseError) -> Self {
        match e {
            PoseError::InsufficientData { found, required } => {
                LabelingError::InsufficientData { found, required }
            }
            PoseError::Store(e) => LabelingError::Persistence(e),
        }
    }
}

impl From<UnsupportedShape> for LabelingError {
    fn from(e: UnsupportedShape) -> Self {
        LabelingError::Malformed(e.to_string())
    }
}

/// Summary of a stored labeled record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelOutcome {
    pub label: i32,
    pub timestamp_ms: i64,
    pub samples: usize,
    pub documents: usize,
}

/// Runs labeling passes.
#[derive(Clone)]
pub struct Labeler {
    poses: PoseStore,
    records: RecordWriter,
    normalizer: Normalizer,
    activity: SharedActivityLog,
    version: Option<String>,
}

impl Labeler {
    pub fn new(
        poses: PoseStore,
        records: RecordWriter,
        activity: SharedActivityLog,
        version: Option<String>,
    ) -> Self {
        Self {
            poses,
            records,
            normalizer: Normalizer::default(),
            activity,
            version,
        }
    }

    pub fn poses(&self) -> &PoseStore {
        &self.poses
    }

    pub fn records(&self) -> &RecordWriter {
        &self.records
    }

    /// Label the window of `window_secs` ending at `timestamp_ms`. A window
    /// of zero seconds or less takes the most recent samples instead.
    pub fn label(
        &self,
        label: i32,
        timestamp_ms: i64,
        window_secs: f64,
    ) -> Result<LabelOutcome, LabelingError> {
        self.activity.record_label_attempt();
        let result = self.run(label, timestamp_ms, window_secs);
        match &result {
            Ok(outcome) => {
                self.activity.record_label_stored(label);
                tracing::info!(
                    label,
                    timestamp = timestamp_ms,
                    samples = outcome.samples,
                    "Labeled pose window stored"
                );
            }
            Err(e) => {
                self.activity.record_label_failed();
                tracing::warn!(label, timestamp = timestamp_ms, "Error inserting labeled poses: {}", e);
            }
        }
        result
    }

    fn run(&self, label: i32, timestamp_ms: i64, window_secs: f64) -> Result<LabelOutcome, LabelingError> {
        let window = if window_secs > 0.0 {
            self.poses.fetch_window(timestamp_ms, window_secs)?
        } else {
            self.poses.fetch_latest(timestamp_ms)?
        };
        let normalized = self.normalizer.normalize(&window.to_tensor())?;

        let record = LabeledPoseRecord {
            poses: normalized,
            label,
            timestamp_ms,
            past_time_secs: window_secs,
            version: self.version.clone(),
            local_time: self.records.local_time(),
        };
        let ids = self
            .poses
            .store_labeled(&record)
            .map_err(LabelingError::Persistence)?;

        Ok(LabelOutcome {
            label,
            timestamp_ms,
            samples: window.len(),
            documents: ids.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::create_shared_log;
    use crate::config::StorageConfig;
    use crate::core::windowing::PoseShape;
    use crate::store::{DocumentStore, MemoryStore, Query};
    use serde_json::{json, Value};
    use std::sync::Arc;

    const T: i64 = 1_700_781_155_079;

    fn labeler(store: Arc<MemoryStore>) -> (Labeler, SharedActivityLog) {
        let activity = create_shared_log();
        let poses = PoseStore::new(
            store.clone(),
            "results",
            "labeled_poses",
            "pose_detector",
            PoseShape::BODY_25,
            10,
        );
        let records = RecordWriter::new(store, StorageConfig::default(), chrono_tz::UTC);
        (
            Labeler::new(poses, records, activity.clone(), Some("v1".to_string())),
            activity,
        )
    }

    fn seed(store: &MemoryStore, count: i64) {
        for i in 0..count {
            let pose: Vec<Value> = (0..3)
                .map(|c| Value::Array((0..25).map(|v| json!([(c * 25 + v) as f64 + 1.0])).collect()))
                .collect();
            store
                .insert(
                    "results",
                    json!({"service": "pose_detector", "timestamp": T - i * 200, "pose": pose}),
                )
                .unwrap();
        }
    }

    #[test]
    fn test_label_stores_normalized_window() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 20);
        let (labeler, activity) = labeler(store.clone());

        let outcome = labeler.label(1, T, 5.0).unwrap();
        assert_eq!(outcome.samples, 10);
        assert_eq!(outcome.documents, 1);

        let doc = &store.find("labeled_poses", &Query::new()).unwrap()[0];
        assert_eq!(doc["label"], json!(1));
        assert_eq!(doc["version"], json!("v1"));
        // (axes, frames, joints, persons) = (2, 10, 15, 1)
        assert_eq!(doc["pose"].as_array().unwrap().len(), 2);
        assert_eq!(doc["pose"][0].as_array().unwrap().len(), 10);
        assert_eq!(doc["pose"][0][0].as_array().unwrap().len(), 15);

        let stats = activity.stats();
        assert_eq!(stats.labels_stored, 1);
        assert_eq!(stats.label_counts.active, 1);
    }

    #[test]
    fn test_insufficient_data_is_reported_and_counted() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 3);
        let (labeler, activity) = labeler(store.clone());

        let err = labeler.label(0, T, 5.0).unwrap_err();
        assert!(matches!(err, LabelingError::InsufficientData { found: 3, required: 10 }));
        assert_eq!(store.count("labeled_poses"), 0);
        assert_eq!(activity.stats().labels_failed, 1);
        assert_eq!(activity.stats().labels_attempted, 1);
    }

    #[test]
    fn test_zero_window_takes_latest_samples() {
        let store = Arc::new(MemoryStore::new());
        // one sample every 200ms, far outside any 5s window before T + 60s
        seed(&store, 10);
        let (labeler, _) = labeler(store.clone());

        assert!(matches!(
            labeler.label(0, T + 60_000, 5.0),
            Err(LabelingError::InsufficientData { found: 0, .. })
        ));
        let outcome = labeler.label(0, T + 60_000, 0.0).unwrap();
        assert_eq!(outcome.samples, 10);

        let doc = &store.find("labeled_poses", &Query::new()).unwrap()[0];
        assert_eq!(doc["past_time"], json!(0.0));
        assert_eq!(doc["label"], json!(0));
    }
}
