//! Windowed access to pose detector output and labeled pose records.

use super::records::TRAINING_SERVICE;
use super::{DocumentId, Query, SharedStore, SortOrder, StoreError};
use crate::core::windowing::{downsample_indices, PoseSample, PoseShape, PoseTensor, PoseWindow};
use serde_json::{json, Value};

/// Pose retrieval and labeled-record failures.
#[derive(Debug)]
pub enum PoseError {
    /// Fewer valid samples than a window needs
    InsufficientData { found: usize, required: usize },
    Store(StoreError),
}

impl std::fmt::Display for PoseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoseError::InsufficientData { found, required } => write!(
                f,
                "Only {found} of {required} poses found, is the pose detector running?"
            ),
            PoseError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PoseError {}

impl From<StoreError> for PoseError {
    fn from(e: StoreError) -> Self {
        PoseError::Store(e)
    }
}

/// A normalized window ready to be stored.
#[derive(Debug, Clone)]
pub struct LabeledPoseRecord {
    /// `(batches, axes, frames, joints, persons)`; one document per batch
    pub poses: PoseTensor,
    pub label: i32,
    /// Capture instant the window ends at, UTC ms
    pub timestamp_ms: i64,
    /// Window length in seconds
    pub past_time_secs: f64,
    pub version: Option<String>,
    pub local_time: String,
}

impl LabeledPoseRecord {
    /// Documents for every batch in the record.
    pub fn documents(&self) -> Vec<Value> {
        (0..self.poses.batches())
            .map(|n| {
                let mut doc = json!({
                    "pose": self.poses.batch_to_json(n),
                    "label": self.label,
                    "local_time": self.local_time,
                    "service": TRAINING_SERVICE,
                    "timestamp": self.timestamp_ms,
                    "past_time": self.past_time_secs,
                });
                if let (Some(version), Value::Object(fields)) = (&self.version, &mut doc) {
                    fields.insert("version".to_string(), json!(version));
                }
                doc
            })
            .collect()
    }
}

/// Reads pose windows from the detector collection and writes labeled records.
#[derive(Clone)]
pub struct PoseStore {
    store: SharedStore,
    pose_collection: String,
    labeled_collection: String,
    service: String,
    shape: PoseShape,
    window_size: usize,
}

impl PoseStore {
    pub fn new(
        store: SharedStore,
        pose_collection: impl Into<String>,
        labeled_collection: impl Into<String>,
        service: impl Into<String>,
        shape: PoseShape,
        window_size: usize,
    ) -> Self {
        Self {
            store,
            pose_collection: pose_collection.into(),
            labeled_collection: labeled_collection.into(),
            service: service.into(),
            shape,
            window_size,
        }
    }

    /// Number of samples in a window.
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn shape(&self) -> PoseShape {
        self.shape
    }

    fn base_query(&self) -> Query {
        Query::new()
            .eq("service", self.service.as_str())
            .not_null("pose")
    }

    /// Parse documents into samples, logging and dropping malformed ones.
    fn accept(&self, docs: &[Value]) -> Vec<PoseSample> {
        docs.iter()
            .filter_map(|doc| {
                let id = doc.get("_id").cloned().unwrap_or(Value::Null);
                let Some(timestamp_ms) = doc.get("timestamp").and_then(Value::as_i64) else {
                    tracing::warn!("Pose document {} has no numeric timestamp", id);
                    return None;
                };
                match PoseSample::from_json(timestamp_ms, &doc["pose"], self.shape) {
                    Ok(sample) => Some(sample),
                    Err(e) => {
                        tracing::warn!("Unexpected pose shape for document {}: {}", id, e);
                        None
                    }
                }
            })
            .collect()
    }

    fn complete(&self, samples: Vec<PoseSample>) -> Result<PoseWindow, PoseError> {
        if samples.len() < self.window_size {
            return Err(PoseError::InsufficientData {
                found: samples.len(),
                required: self.window_size,
            });
        }
        Ok(PoseWindow::new(self.shape, samples))
    }

    /// Window of N samples spread evenly over `[timestamp - past_secs, timestamp]`.
    pub fn fetch_window(&self, timestamp_ms: i64, past_secs: f64) -> Result<PoseWindow, PoseError> {
        let start = timestamp_ms as f64 - past_secs * 1000.0;
        let query = self
            .base_query()
            .gte("timestamp", start)
            .lte("timestamp", timestamp_ms as f64)
            .sort("timestamp", SortOrder::Ascending);

        let docs = self.store.find(&self.pose_collection, &query)?;
        let valid = self.accept(&docs);
        let picked = downsample_indices(valid.len(), self.window_size)
            .into_iter()
            .map(|i| valid[i].clone())
            .collect();

        tracing::debug!(
            candidates = docs.len(),
            valid = valid.len(),
            "Fetched pose window ending at {}",
            timestamp_ms
        );
        self.complete(picked)
    }

    /// The N most recent samples at or before `timestamp`.
    pub fn fetch_latest(&self, timestamp_ms: i64) -> Result<PoseWindow, PoseError> {
        let query = self
            .base_query()
            .lte("timestamp", timestamp_ms as f64)
            .sort("timestamp", SortOrder::Descending)
            .limit(self.window_size);

        let docs = self.store.find(&self.pose_collection, &query)?;
        self.complete(self.accept(&docs))
    }

    /// Persist a labeled record, one document per batch.
    pub fn store_labeled(&self, record: &LabeledPoseRecord) -> Result<Vec<DocumentId>, StoreError> {
        self.store
            .insert_many(&self.labeled_collection, record.documents())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentStore, MemoryStore};
    use std::sync::Arc;

    const T: i64 = 1_700_784_151_580;

    fn pose_json(fill: f64) -> Value {
        let shape = PoseShape::BODY_25;
        Value::Array(
            (0..shape.axes)
                .map(|_| {
                    Value::Array(
                        (0..shape.joints)
                            .map(|_| json!([fill]))
                            .collect(),
                    )
                })
                .collect(),
        )
    }

    fn seeded(timestamps: impl IntoIterator<Item = i64>) -> (Arc<MemoryStore>, PoseStore) {
        let store = Arc::new(MemoryStore::new());
        for ts in timestamps {
            store
                .insert(
                    "results",
                    json!({"service": "pose_detector", "timestamp": ts, "pose": pose_json(1.0)}),
                )
                .unwrap();
        }
        let poses = PoseStore::new(
            store.clone(),
            "results",
            "labeled_poses",
            "pose_detector",
            PoseShape::BODY_25,
            10,
        );
        (store, poses)
    }

    #[test]
    fn test_window_spans_the_range() {
        // 50 samples every 100ms over the 5s before T, inserted out of order
        let (_, poses) = seeded((0..50).rev().map(|i| T - 4_900 + i * 100));
        let window = poses.fetch_window(T, 5.0).unwrap();

        assert_eq!(window.len(), 10);
        let times: Vec<i64> = window.samples().iter().map(|s| s.timestamp_ms).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert!(times.windows(2).all(|w| w[1] - w[0] == 500));
        assert_eq!(window.span_ms(), 4_500);
    }

    #[test]
    fn test_window_ignores_samples_outside_range() {
        let (_, poses) = seeded((0..10).map(|i| T + 1 + i).chain((0..10).map(|i| T - 10_000 - i)));
        assert!(matches!(
            poses.fetch_window(T, 5.0),
            Err(PoseError::InsufficientData { found: 0, required: 10 })
        ));
    }

    #[test]
    fn test_insufficient_samples_write_nothing() {
        let (store, poses) = seeded((0..9).map(|i| T - i * 100));
        let err = poses.fetch_window(T, 5.0).unwrap_err();
        assert!(matches!(err, PoseError::InsufficientData { found: 9, required: 10 }));
        assert!(matches!(
            poses.fetch_latest(T),
            Err(PoseError::InsufficientData { found: 9, .. })
        ));
        assert_eq!(store.count("labeled_poses"), 0);
    }

    #[test]
    fn test_malformed_samples_are_excluded() {
        let (store, poses) = seeded((0..10).map(|i| T - i * 100));
        store
            .insert(
                "results",
                json!({"service": "pose_detector", "timestamp": T - 50, "pose": [[1.0, 2.0]]}),
            )
            .unwrap();
        let window = poses.fetch_window(T, 5.0).unwrap();
        assert_eq!(window.len(), 10);
        assert!(window.samples().iter().all(|s| s.timestamp_ms != T - 50));
    }

    #[test]
    fn test_latest_takes_most_recent() {
        let (_, poses) = seeded((0..20).map(|i| T - i * 1_000));
        let window = poses.fetch_latest(T - 500).unwrap();
        let times: Vec<i64> = window.samples().iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(times.first(), Some(&(T - 10_000)));
        assert_eq!(times.last(), Some(&(T - 1_000)));
    }

    #[test]
    fn test_store_single_batch_record() {
        let (store, poses) = seeded((0..10).map(|i| T - i * 100));
        let window = poses.fetch_window(T, 5.0).unwrap();
        let record = LabeledPoseRecord {
            poses: window.to_tensor(),
            label: 1,
            timestamp_ms: T,
            past_time_secs: 5.0,
            version: Some("testing".to_string()),
            local_time: "2023-11-23 16:02:31".to_string(),
        };

        let ids = poses.store_labeled(&record).unwrap();
        assert_eq!(ids.len(), 1);

        let doc = &store.find("labeled_poses", &Query::new()).unwrap()[0];
        assert_eq!(doc["label"], json!(1));
        assert_eq!(doc["version"], json!("testing"));
        assert_eq!(doc["past_time"], json!(5.0));
        assert_eq!(doc["pose"][0].as_array().unwrap().len(), 10);
    }
}
