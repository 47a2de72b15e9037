//! Process supervisor.
//!
//! [`TriggerReceiver`] owns every long-lived piece of the agent: the detector
//! task, the stream consumer, the crossing dispatcher, the baseline
//! scheduler and the change feed notifier. The HTTP layer and the CLI talk
//! to it through the control operations below.

use crate::activity::{ActivityStats, LabelCounts, SharedActivityLog};
use crate::camera::{CameraTarget, VideoClipRequester};
use crate::config::{check_save_time, trigger_interval_from_minutes, CaptureMode, Config};
use crate::core::detector::{DetectorError, DetectorHandle, DetectorSettings, DetectorStatus, EventCrossing};
use crate::core::labeling::{LabelOutcome, Labeler, LabelingError};
use crate::core::pipeline::{EventPipeline, PipelineSettings};
use crate::core::scheduler::{LabelScheduler, SchedulerContext};
use crate::core::windowing::PoseShape;
use crate::notifier::{ChangeFeedNotifier, LatencySummary};
use crate::store::{DocumentId, PoseStore, RecordWriter, SharedStore, StoreError};
use crate::stream::{ConsumerTask, StreamConsumer};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Control operation failures.
#[derive(Debug)]
pub enum ControlError {
    /// Status outside {1, 0, -1}
    InvalidStatus(i32),
    /// A setting failed validation
    InvalidValue(String),
    /// An HTTP client could not be created
    Client(String),
    /// A collection that does not take documents from outside the agent
    UnknownCollection(String),
    Persistence(StoreError),
    Detector(DetectorError),
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::InvalidStatus(status) => write!(f, "Invalid status value: {status}"),
            ControlError::InvalidValue(msg) => write!(f, "Invalid value: {msg}"),
            ControlError::Client(msg) => write!(f, "Client error: {msg}"),
            ControlError::UnknownCollection(name) => {
                write!(f, "Collection {name} does not accept external documents")
            }
            ControlError::Persistence(e) => write!(f, "Persistence error: {e}"),
            ControlError::Detector(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ControlError {}

impl From<StoreError> for ControlError {
    fn from(e: StoreError) -> Self {
        ControlError::Persistence(e)
    }
}

impl From<DetectorError> for ControlError {
    fn from(e: DetectorError) -> Self {
        ControlError::Detector(e)
    }
}

/// Result of `start` / `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Started,
    AlreadyStarted,
    Stopped,
    AlreadyStopped,
}

impl std::fmt::Display for ControlOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            ControlOutcome::Started => "Started",
            ControlOutcome::AlreadyStarted => "Already started",
            ControlOutcome::Stopped => "Stopped",
            ControlOutcome::AlreadyStopped => "Already stopped",
        };
        write!(f, "{message}")
    }
}

/// Partial settings update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub stream_base_url: Option<String>,
    pub device_name: Option<String>,
    pub value_key: Option<String>,
    pub threshold: Option<f64>,
    /// Debounce window in seconds
    pub save_time: Option<u64>,
    /// Auto-tagging interval in minutes
    pub trigger_time: Option<f64>,
    pub camera_base_url: Option<String>,
    pub camera_name_list: Option<Vec<String>>,
    pub status: Option<i32>,
}

impl SettingsUpdate {
    fn touches_stream(&self) -> bool {
        self.stream_base_url.is_some() || self.device_name.is_some() || self.value_key.is_some()
    }

    /// Check every field and convert it, before anything is applied.
    fn validate(&self) -> Result<CheckedUpdate, ControlError> {
        if let Some(threshold) = self.threshold {
            if !(threshold.is_finite() && threshold > 0.0) {
                return Err(ControlError::InvalidValue(format!(
                    "threshold must be positive, got {threshold}"
                )));
            }
        }
        let save_time = self
            .save_time
            .map(|secs| {
                let save_time = Duration::from_secs(secs);
                check_save_time(save_time).map(|_| save_time)
            })
            .transpose()
            .map_err(ControlError::InvalidValue)?;
        let interval = self
            .trigger_time
            .map(trigger_interval_from_minutes)
            .transpose()
            .map_err(ControlError::InvalidValue)?;
        if let Some(name) = &self.device_name {
            if name.trim().is_empty() {
                return Err(ControlError::InvalidValue("device_name is empty".to_string()));
            }
        }
        let status = self
            .status
            .map(|s| DetectorStatus::from_label(s).ok_or(ControlError::InvalidStatus(s)))
            .transpose()?;

        Ok(CheckedUpdate {
            status,
            save_time,
            interval,
        })
    }
}

/// Converted values of a validated [`SettingsUpdate`].
struct CheckedUpdate {
    status: Option<DetectorStatus>,
    save_time: Option<Duration>,
    interval: Option<Duration>,
}

/// Everything `get_info` reports.
#[derive(Debug, Clone, Serialize)]
pub struct ReceiverInfo {
    pub running: bool,
    pub stream_url: String,
    pub device_name: String,
    pub value_key: String,
    pub threshold: f64,
    pub save_time: u64,
    pub trigger_time: f64,
    pub camera_base_url: String,
    pub camera_name_list: Vec<String>,
    pub capture: CaptureMode,
    pub status: i32,
    pub event_in_flight: bool,
    pub has_pose: bool,
    pub auto_tagging: bool,
    pub label_count: LabelCounts,
    pub activity: ActivityStats,
    pub notification_latency: LatencySummary,
}

/// Build the labeler for a configuration.
pub fn build_labeler(config: &Config, store: SharedStore, activity: SharedActivityLog) -> Result<Labeler, ControlError> {
    let timezone: Tz = config
        .labeling
        .timezone
        .parse()
        .map_err(|_| ControlError::InvalidValue(format!("unknown timezone {}", config.labeling.timezone)))?;
    let storage = &config.storage;

    let poses = PoseStore::new(
        store.clone(),
        storage.pose_collection.as_str(),
        storage.labeled_collection.as_str(),
        storage.pose_service.as_str(),
        PoseShape::BODY_25,
        config.labeling.poses_per_window,
    );
    let records = RecordWriter::new(store, storage.clone(), timezone);
    Ok(Labeler::new(poses, records, activity, config.labeling.version.clone()))
}

fn pipeline_settings(config: &Config) -> PipelineSettings {
    PipelineSettings {
        device_name: config.stream.device_name.clone(),
        camera: CameraTarget::new(config.camera.base_url.as_str(), config.camera.camera_names.clone()),
        capture: config.camera.capture,
        settle_delay: config.labeling.settle_delay,
    }
}

/// The running agent.
pub struct TriggerReceiver {
    settings: Arc<RwLock<Config>>,
    store: SharedStore,
    activity: SharedActivityLog,
    records: RecordWriter,
    labeler: Labeler,
    detector: DetectorHandle,
    scheduler: LabelScheduler,
    notifier: ChangeFeedNotifier,
    pose_available: Arc<AtomicBool>,
    consumer: Mutex<Option<ConsumerTask>>,
    dispatcher: JoinHandle<()>,
}

impl TriggerReceiver {
    /// Wire up the agent. Must be called inside a tokio runtime. Nothing is
    /// consumed until [`TriggerReceiver::start`].
    pub fn new(config: Config, store: SharedStore, activity: SharedActivityLog) -> Result<Self, ControlError> {
        config
            .validate()
            .map_err(|e| ControlError::InvalidValue(e.to_string()))?;
        let initial_status = DetectorStatus::from_label(config.detector.initial_status)
            .ok_or(ControlError::InvalidStatus(config.detector.initial_status))?;

        let labeler = build_labeler(&config, store.clone(), activity.clone())?;
        let records = labeler.records().clone();
        let cameras = VideoClipRequester::new().map_err(|e| ControlError::Client(e.to_string()))?;
        let pipeline = EventPipeline::new(records.clone(), cameras, labeler.clone());

        let (detector, crossings) = DetectorHandle::spawn(
            DetectorSettings {
                threshold: config.detector.threshold,
                save_time: config.detector.save_time,
                initial_status,
            },
            activity.clone(),
        );

        let pose_available = Arc::new(AtomicBool::new(true));
        let scheduler = LabelScheduler::new(
            SchedulerContext {
                detector: detector.clone(),
                labeler: labeler.clone(),
                pose_available: pose_available.clone(),
                settle_delay: config.labeling.settle_delay,
            },
            config
                .labeling
                .trigger_interval()
                .map_err(|e| ControlError::InvalidValue(e.to_string()))?,
        );
        let notifier = ChangeFeedNotifier::new(
            store.clone(),
            config.storage.notification_collection.as_str(),
            config.storage.notify_field.as_str(),
        );

        let settings = Arc::new(RwLock::new(config));
        let dispatcher = tokio::spawn(dispatch(crossings, pipeline, settings.clone()));

        Ok(Self {
            settings,
            store,
            activity,
            records,
            labeler,
            detector,
            scheduler,
            notifier,
            pose_available,
            consumer: Mutex::new(None),
            dispatcher,
        })
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn activity(&self) -> &SharedActivityLog {
        &self.activity
    }

    pub fn notifier(&self) -> &ChangeFeedNotifier {
        &self.notifier
    }

    pub fn detector(&self) -> &DetectorHandle {
        &self.detector
    }

    /// Current settings.
    pub async fn config(&self) -> Config {
        self.settings.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.consumer.lock().await.is_some()
    }

    /// Start consuming the stream and, if configured, auto-tagging.
    pub async fn start(&self) -> Result<ControlOutcome, ControlError> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return Ok(ControlOutcome::AlreadyStarted);
        }

        let config = self.settings.read().await.clone();
        let task = StreamConsumer::new(config.stream.clone(), self.detector.clone(), self.activity.clone())
            .map_err(|e| ControlError::Client(e.to_string()))?
            .spawn();
        *consumer = Some(task);

        if config.labeling.auto_tagging {
            self.scheduler.start();
        }
        tracing::info!(device = %config.stream.device_name, "Receiver started");
        Ok(ControlOutcome::Started)
    }

    /// Stop consuming and auto-tagging, waiting for the consumer to exit.
    pub async fn stop(&self) -> ControlOutcome {
        let mut consumer = self.consumer.lock().await;
        let Some(task) = consumer.take() else {
            return ControlOutcome::AlreadyStopped;
        };
        task.stop().await;
        self.scheduler.stop();
        tracing::info!("Receiver stopped");
        ControlOutcome::Stopped
    }

    pub async fn info(&self) -> Result<ReceiverInfo, ControlError> {
        let snapshot = self.detector.snapshot().await?;
        let running = self.is_running().await;
        let config = self.settings.read().await;
        let activity = self.activity.stats();

        Ok(ReceiverInfo {
            running,
            stream_url: config.stream.stream_url(),
            device_name: config.stream.device_name.clone(),
            value_key: config.stream.value_key.clone(),
            threshold: snapshot.threshold,
            save_time: snapshot.save_time.as_secs(),
            trigger_time: config.labeling.trigger_interval_minutes,
            camera_base_url: config.camera.base_url.clone(),
            camera_name_list: config.camera.camera_names.clone(),
            capture: config.camera.capture,
            status: snapshot.status.label(),
            event_in_flight: snapshot.event_in_flight,
            has_pose: self.pose_available.load(Ordering::Acquire),
            auto_tagging: self.scheduler.is_enabled(),
            label_count: activity.label_counts,
            activity,
            notification_latency: self.notifier.latency(),
        })
    }

    /// Apply a partial update. Restarts the consumer when a stream setting
    /// changed while running.
    pub async fn update(&self, update: SettingsUpdate) -> Result<ReceiverInfo, ControlError> {
        let checked = update.validate()?;

        {
            let mut config = self.settings.write().await;
            if let Some(url) = &update.stream_base_url {
                config.stream.base_url = url.clone();
            }
            if let Some(name) = &update.device_name {
                config.stream.device_name = name.clone();
            }
            if let Some(key) = &update.value_key {
                config.stream.value_key = key.clone();
            }
            if let Some(threshold) = update.threshold {
                config.detector.threshold = threshold;
                self.detector.set_threshold(threshold).await?;
            }
            if let Some(save_time) = checked.save_time {
                config.detector.save_time = save_time;
                self.detector.set_save_time(save_time).await?;
            }
            if let (Some(minutes), Some(interval)) = (update.trigger_time, checked.interval) {
                config.labeling.trigger_interval_minutes = minutes;
                self.scheduler.set_interval(interval);
            }
            if let Some(url) = &update.camera_base_url {
                config.camera.base_url = url.clone();
            }
            if let Some(names) = &update.camera_name_list {
                config.camera.camera_names = names.clone();
            }
        }

        if let Some(status) = checked.status {
            self.detector.set_status(status).await?;
        }

        if update.touches_stream() && self.is_running().await {
            tracing::info!("Stream settings changed, restarting consumer");
            self.stop().await;
            self.start().await?;
        }

        self.info().await
    }

    /// Override the detector status with a numeric label.
    pub async fn change_status(&self, label: i32) -> Result<DetectorStatus, ControlError> {
        let status = DetectorStatus::from_label(label).ok_or(ControlError::InvalidStatus(label))?;
        Ok(self.detector.set_status(status).await?)
    }

    pub async fn check_status(&self) -> Result<DetectorStatus, ControlError> {
        Ok(self.detector.status().await?)
    }

    /// Record what the pose detector last reported.
    pub fn set_pose_available(&self, available: bool) {
        self.pose_available.store(available, Ordering::Release);
        tracing::debug!("Pose detector reports data: {}", available);
    }

    pub fn pose_available(&self) -> bool {
        self.pose_available.load(Ordering::Acquire)
    }

    pub fn start_auto_labeling(&self) {
        self.scheduler.start();
    }

    pub fn stop_auto_labeling(&self) {
        self.scheduler.stop();
    }

    pub fn auto_labeling(&self) -> bool {
        self.scheduler.is_enabled()
    }

    /// Publish a message to notification subscribers.
    pub fn notify(&self, message: Value) -> Result<DocumentId, StoreError> {
        self.records.notify(message)
    }

    /// Store training-service logs.
    pub fn store_training_logs(&self, logs: Value) -> Result<DocumentId, StoreError> {
        self.records.training_logs(logs)
    }

    /// Insert documents written by the pose detector or the training
    /// service. Only the pose, notification and training-log collections
    /// accept them, and every document must be a JSON object.
    pub async fn ingest(&self, collection: &str, documents: Vec<Value>) -> Result<Vec<DocumentId>, ControlError> {
        {
            let config = self.settings.read().await;
            let storage = &config.storage;
            let accepted = [
                &storage.pose_collection,
                &storage.notification_collection,
                &storage.training_logs_collection,
            ];
            if !accepted.iter().any(|c| c.as_str() == collection) {
                return Err(ControlError::UnknownCollection(collection.to_string()));
            }
        }
        if let Some(position) = documents.iter().position(|d| !d.is_object()) {
            return Err(ControlError::InvalidValue(format!(
                "document {position} is not a JSON object"
            )));
        }

        let count = documents.len();
        let ids = self.store.insert_many(collection, documents)?;
        tracing::debug!(collection, count, "Ingested external documents");
        Ok(ids)
    }

    /// Label the current debounce-length window ending at `timestamp_ms`.
    pub async fn label_now(&self, label: DetectorStatus, timestamp_ms: i64) -> Result<LabelOutcome, LabelingError> {
        let window = self.settings.read().await.detector.save_time;
        self.labeler.label(label.label(), timestamp_ms, window.as_secs_f64())
    }

    /// Stop everything. Used at process exit.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.scheduler.stop();
        self.notifier.shutdown();
    }
}

impl Drop for TriggerReceiver {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Run a pipeline for every crossing, each on its own task.
async fn dispatch(
    mut crossings: mpsc::UnboundedReceiver<EventCrossing>,
    pipeline: EventPipeline,
    settings: Arc<RwLock<Config>>,
) {
    while let Some(crossing) = crossings.recv().await {
        let current = pipeline_settings(&*settings.read().await);
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let report = pipeline.on_crossing(crossing, current).await;
            tracing::debug!(
                timestamp = crossing.timestamp_ms,
                notified = report.notification.is_some(),
                cameras = report.cameras_accepted,
                labeled = report.label.is_some(),
                "Crossing pipeline finished"
            );
        });
    }
}
