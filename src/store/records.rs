//! Writers for the notification, training-log and labeled-pose records.

use super::{DocumentId, SharedStore, StoreError};
use crate::config::StorageConfig;
use chrono::Utc;
use chrono_tz::Tz;
use serde_json::{json, Value};

/// `service` field of records written on behalf of the training service.
pub const TRAINING_SERVICE: &str = "Training Service";

/// Format of the human-readable `local_time` field.
const LOCAL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Builds and inserts the agent's own records.
#[derive(Clone)]
pub struct RecordWriter {
    store: SharedStore,
    collections: StorageConfig,
    timezone: Tz,
}

impl RecordWriter {
    pub fn new(store: SharedStore, collections: StorageConfig, timezone: Tz) -> Self {
        Self {
            store,
            collections,
            timezone,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Current wall-clock time in the configured timezone.
    pub fn local_time(&self) -> String {
        Utc::now()
            .with_timezone(&self.timezone)
            .format(LOCAL_TIME_FORMAT)
            .to_string()
    }

    /// Record that the detector changed status because of a crossing.
    pub fn status_change(
        &self,
        device_name: &str,
        label: i32,
        timestamp_ms: i64,
        duration_secs: f64,
    ) -> Result<DocumentId, StoreError> {
        self.store.insert(
            &self.collections.notification_collection,
            json!({
                "service": device_name,
                "label_status": label,
                "timestamp": timestamp_ms,
                "duration": duration_secs,
            }),
        )
    }

    /// Publish a free-form message to notification subscribers.
    pub fn notify(&self, message: Value) -> Result<DocumentId, StoreError> {
        self.store.insert(
            &self.collections.notification_collection,
            json!({
                "message": message,
                "local_time": self.local_time(),
                "timestamp": Utc::now().timestamp_millis(),
            }),
        )
    }

    /// Append training-service logs.
    pub fn training_logs(&self, logs: Value) -> Result<DocumentId, StoreError> {
        self.store.insert(
            &self.collections.training_logs_collection,
            json!({
                "logs": logs,
                "local_time": self.local_time(),
                "service": TRAINING_SERVICE,
                "timestamp": Utc::now().timestamp_millis(),
            }),
        )
    }
}
