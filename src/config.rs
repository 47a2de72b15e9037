//! Configuration for the trigger label agent.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Inbound sensor stream
    pub stream: StreamConfig,

    /// Crossing detection
    pub detector: DetectorConfig,

    /// Video segmenter collaborator
    pub camera: CameraConfig,

    /// Labeling and auto-tagging
    pub labeling: LabelingConfig,

    /// Collection names and store persistence
    pub storage: StorageConfig,

    /// HTTP control surface
    pub server: ServerSection,

    /// Path for the activity log and store snapshot
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("trigger-label-agent");

        Self {
            stream: StreamConfig::default(),
            detector: DetectorConfig::default(),
            camera: CameraConfig::default(),
            labeling: LabelingConfig::default(),
            storage: StorageConfig::default(),
            server: ServerSection::default(),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit path, falling back to defaults
    /// when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("trigger-label-agent")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Reject values the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.detector.threshold.is_finite() && self.detector.threshold > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "detector.threshold must be positive, got {}",
                self.detector.threshold
            )));
        }
        check_save_time(self.detector.save_time)
            .map_err(|e| ConfigError::Invalid(format!("detector.{e}")))?;
        if ![1, 0, -1].contains(&self.detector.initial_status) {
            return Err(ConfigError::Invalid(format!(
                "detector.initial_status must be one of 1, 0, -1, got {}",
                self.detector.initial_status
            )));
        }
        self.labeling.trigger_interval()?;
        if self.labeling.poses_per_window == 0 {
            return Err(ConfigError::Invalid(
                "labeling.poses_per_window must be at least 1".to_string(),
            ));
        }
        if self.labeling.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "labeling.timezone is not a known timezone: {}",
                self.labeling.timezone
            )));
        }
        Ok(())
    }

    /// Path of the persisted activity counters.
    pub fn activity_path(&self) -> PathBuf {
        self.data_path.join("activity.json")
    }

    /// Path of the persisted store snapshot, if persistence is enabled.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.storage
            .snapshot_file
            .as_ref()
            .map(|file| self.data_path.join(file))
    }
}

/// Inbound sensor stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Base URL of the data service, e.g. `http://host:9001/api/data`
    pub base_url: String,
    /// Sensor device to subscribe to
    pub device_name: String,
    /// Key inside `values` holding the monitored metric
    pub value_key: String,
    /// Server-side down-sampling frequency (0 = every sample)
    pub frequency: u32,
    /// Fixed delay before reconnecting after a transport failure
    #[serde(rename = "reconnect_backoff_secs", with = "duration_serde")]
    pub reconnect_backoff: Duration,
    /// Maximum silence on the stream before the connection is considered dead
    #[serde(rename = "read_timeout_secs", with = "duration_serde")]
    pub read_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9001/api/data".to_string(),
            device_name: "power-meter-14".to_string(),
            value_key: "Current".to_string(),
            frequency: 0,
            reconnect_backoff: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
        }
    }
}

impl StreamConfig {
    /// Full URL of the device stream.
    pub fn stream_url(&self) -> String {
        format!(
            "{}/kafka_stream/{}?frequency={}",
            self.base_url.trim_end_matches('/'),
            self.device_name,
            self.frequency
        )
    }
}

/// Crossing detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Minimum rise between consecutive readings that counts as a crossing
    pub threshold: f64,
    /// Debounce window, also the length of the captured window
    #[serde(rename = "save_time_secs", with = "duration_serde")]
    pub save_time: Duration,
    /// Status label at startup (1, 0 or -1)
    pub initial_status: i32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 15.0,
            save_time: Duration::from_secs(5),
            initial_status: 0,
        }
    }
}

/// Which retention call a crossing issues against the video segmenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Keep the footage recorded before the crossing
    Past,
    /// Keep the footage recorded after the crossing
    Next,
}

/// Video segmenter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Base URL of the segmenter, e.g. `http://host:9095/api/v1/web_stream`
    pub base_url: String,
    /// Cameras whose footage is retained on a crossing
    pub camera_names: Vec<String>,
    pub capture: CaptureMode,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9095/api/v1/web_stream".to_string(),
            camera_names: vec!["pi-cam-3".to_string(), "pi-cam-6".to_string()],
            capture: CaptureMode::Past,
        }
    }
}

/// Labeling and auto-tagging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelingConfig {
    /// Period of baseline labeling, fractional minutes allowed
    pub trigger_interval_minutes: f64,
    /// Delay between a trigger and the pose fetch, so in-flight poses land first
    #[serde(rename = "settle_delay_secs", with = "duration_serde")]
    pub settle_delay: Duration,
    /// Number of pose samples in one labeled window
    pub poses_per_window: usize,
    /// Whether baseline labeling starts enabled
    pub auto_tagging: bool,
    /// Timezone of the human-readable `local_time` record field
    pub timezone: String,
    /// Optional version tag written on labeled records
    pub version: Option<String>,
}

impl Default for LabelingConfig {
    fn default() -> Self {
        Self {
            trigger_interval_minutes: 5.0,
            settle_delay: Duration::from_secs(10),
            poses_per_window: 10,
            auto_tagging: true,
            timezone: "America/Los_Angeles".to_string(),
            version: None,
        }
    }
}

impl LabelingConfig {
    /// Trigger interval as a duration.
    pub fn trigger_interval(&self) -> Result<Duration, ConfigError> {
        trigger_interval_from_minutes(self.trigger_interval_minutes).map_err(ConfigError::Invalid)
    }
}

/// Shortest accepted auto-tagging interval.
pub const MIN_TRIGGER_INTERVAL: Duration = Duration::from_secs(1);

/// Longest accepted auto-tagging interval.
pub const MAX_TRIGGER_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest accepted debounce window.
pub const MAX_SAVE_TIME: Duration = Duration::from_secs(60 * 60);

/// Convert fractional minutes to an auto-tagging interval within
/// [`MIN_TRIGGER_INTERVAL`]..=[`MAX_TRIGGER_INTERVAL`].
pub fn trigger_interval_from_minutes(minutes: f64) -> Result<Duration, String> {
    let interval = Duration::try_from_secs_f64(minutes * 60.0)
        .map_err(|_| format!("trigger interval must be a positive number of minutes, got {minutes}"))?;
    if !(MIN_TRIGGER_INTERVAL..=MAX_TRIGGER_INTERVAL).contains(&interval) {
        return Err(format!(
            "trigger interval must be between {}s and {}s, got {minutes} minutes",
            MIN_TRIGGER_INTERVAL.as_secs(),
            MAX_TRIGGER_INTERVAL.as_secs()
        ));
    }
    Ok(interval)
}

/// Check a debounce window against `1s..=MAX_SAVE_TIME`.
pub fn check_save_time(save_time: Duration) -> Result<(), String> {
    if save_time < Duration::from_secs(1) || save_time > MAX_SAVE_TIME {
        return Err(format!(
            "save_time must be between 1 and {} seconds, got {}",
            MAX_SAVE_TIME.as_secs(),
            save_time.as_secs()
        ));
    }
    Ok(())
}

/// Collection names and store persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Status-change and message notifications (watched by the notifier)
    pub notification_collection: String,
    /// Raw pose detector output
    pub pose_collection: String,
    /// Labeled training samples
    pub labeled_collection: String,
    /// Training service logs
    pub training_logs_collection: String,
    /// `service` field value of pose detector documents
    pub pose_service: String,
    /// Document field pushed to notification subscribers
    pub notify_field: String,
    /// File name (under `data_path`) of the store snapshot, `None` disables persistence
    pub snapshot_file: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            notification_collection: "notification".to_string(),
            pose_collection: "results".to_string(),
            labeled_collection: "labeled_poses".to_string(),
            training_logs_collection: "training_logs".to_string(),
            pose_service: "pose_detector".to_string(),
            notify_field: "message".to_string(),
            snapshot_file: Some("store.json".to_string()),
        }
    }
}

/// HTTP control surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.detector.threshold, 15.0);
        assert_eq!(config.detector.save_time, Duration::from_secs(5));
        assert_eq!(config.stream.reconnect_backoff, Duration::from_secs(10));
        assert_eq!(config.labeling.poses_per_window, 10);
        assert_eq!(config.camera.capture, CaptureMode::Past);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stream_url() {
        let stream = StreamConfig {
            base_url: "http://meter:9001/api/data/".to_string(),
            device_name: "power-meter-1".to_string(),
            frequency: 2,
            ..StreamConfig::default()
        };
        assert_eq!(
            stream.stream_url(),
            "http://meter:9001/api/data/kafka_stream/power-meter-1?frequency=2"
        );
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"detector": {"threshold": 8.5, "save_time_secs": 3}, "labeling": {"trigger_interval_minutes": 0.1}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.detector.threshold, 8.5);
        assert_eq!(config.detector.save_time, Duration::from_secs(3));
        assert_eq!(config.labeling.trigger_interval().unwrap(), Duration::from_secs(6));
        assert_eq!(config.stream.device_name, "power-meter-14");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.camera.camera_names = vec!["cam-a".to_string()];
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.camera.camera_names, vec!["cam-a".to_string()]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.detector.initial_status = 2;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.labeling.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.detector.threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trigger_interval_bounds() {
        assert_eq!(trigger_interval_from_minutes(0.5), Ok(Duration::from_secs(30)));
        assert_eq!(trigger_interval_from_minutes(24.0 * 60.0), Ok(MAX_TRIGGER_INTERVAL));
        for minutes in [1e-12, 0.0, -1.0, 1e20, f64::NAN, f64::INFINITY, 24.0 * 60.0 + 1.0] {
            assert!(
                trigger_interval_from_minutes(minutes).is_err(),
                "{minutes} minutes accepted"
            );
        }
    }

    #[test]
    fn test_validate_rejects_out_of_range_durations() {
        let mut config = Config::default();
        config.labeling.trigger_interval_minutes = 1e-12;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.labeling.trigger_interval_minutes = 1e20;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.detector.save_time = MAX_SAVE_TIME + Duration::from_secs(1);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.detector.save_time = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"labeling": {"trigger_interval_minutes": 1e-12}}"#).unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.server.port, 5000);
    }
}
