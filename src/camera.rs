//! Client for the video segmenting service.
//!
//! The segmenter keeps a rolling buffer per camera. A crossing asks it to
//! retain either the footage before the crossing (`save_past`) or the
//! footage that follows (`save_next`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where and for which cameras to request footage.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraTarget {
    /// Segmenter base URL, e.g. `http://host:9095/api/v1/web_stream`
    pub base_url: String,
    pub camera_names: Vec<String>,
}

impl CameraTarget {
    pub fn new(base_url: impl Into<String>, camera_names: Vec<String>) -> Self {
        Self {
            base_url: base_url.into(),
            camera_names,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    /// URL of the retroactive retention endpoint.
    pub fn save_past_url(&self) -> String {
        self.endpoint("save_past")
    }

    /// URL of the forward retention endpoint.
    pub fn save_next_url(&self) -> String {
        self.endpoint("save_next")
    }
}

/// Camera client error types.
#[derive(Debug)]
pub enum CameraError {
    /// Network/HTTP error
    Network(String),
    /// Segmenter returned an error response
    Server { status: u16, message: String },
}

impl std::fmt::Display for CameraError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraError::Network(msg) => write!(f, "Segmenter network error: {msg}"),
            CameraError::Server { status, message } => {
                write!(f, "Segmenter server error ({status}): {message}")
            }
        }
    }
}

impl std::error::Error for CameraError {}

/// Body of `POST save_past`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavePastRequest {
    pub camera_name: String,
    /// Window start, UTC ms
    pub start_time: i64,
    /// Window end, UTC ms
    pub stop_time: i64,
    /// Start and stop are absolute timestamps rather than offsets
    pub is_timestamps: bool,
}

/// Body of `POST save_next`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SaveNextRequest {
    pub camera_name: String,
    /// Seconds of footage to keep from now on
    pub save_time: u64,
}

/// Optional status message in segmenter responses.
#[derive(Debug, Clone, Deserialize)]
pub struct SegmenterResponse {
    pub status: Option<String>,
}

/// Requests video retention from the segmenter.
#[derive(Clone)]
pub struct VideoClipRequester {
    client: reqwest::Client,
}

impl VideoClipRequester {
    /// Create a requester with a 10 second request timeout.
    pub fn new() -> Result<Self, CameraError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CameraError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn post<B: Serialize>(&self, url: &str, body: &B) -> Result<Option<String>, CameraError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| CameraError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CameraError::Server {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response
            .json::<SegmenterResponse>()
            .await
            .ok()
            .and_then(|r| r.status))
    }

    /// Ask one camera to keep the footage in `[start_ms, stop_ms]`.
    pub async fn save_past(
        &self,
        target: &CameraTarget,
        camera_name: &str,
        start_ms: i64,
        stop_ms: i64,
    ) -> Result<Option<String>, CameraError> {
        let body = SavePastRequest {
            camera_name: camera_name.to_string(),
            start_time: start_ms,
            stop_time: stop_ms,
            is_timestamps: true,
        };
        self.post(&target.save_past_url(), &body).await
    }

    /// Ask one camera to keep the next `save_time` of footage.
    pub async fn save_next(
        &self,
        target: &CameraTarget,
        camera_name: &str,
        save_time: Duration,
    ) -> Result<Option<String>, CameraError> {
        let body = SaveNextRequest {
            camera_name: camera_name.to_string(),
            save_time: save_time.as_secs(),
        };
        self.post(&target.save_next_url(), &body).await
    }

    /// Request the window before `timestamp_ms` from every camera.
    ///
    /// Failures are logged per camera and never retried. Returns the number
    /// of cameras that accepted the request.
    pub async fn request_past_window(
        &self,
        target: &CameraTarget,
        timestamp_ms: i64,
        window: Duration,
    ) -> usize {
        let start_ms = window_start(timestamp_ms, window);
        let mut accepted = 0;
        for camera in &target.camera_names {
            match self.save_past(target, camera, start_ms, timestamp_ms).await {
                Ok(status) => {
                    accepted += 1;
                    tracing::info!(
                        camera = %camera,
                        start = start_ms,
                        stop = timestamp_ms,
                        "Past video retained: {}",
                        status.as_deref().unwrap_or("Operation completed")
                    );
                }
                Err(e) => tracing::warn!(camera = %camera, "Error saving past video: {}", e),
            }
        }
        accepted
    }

    /// Request the next `window` of footage from every camera.
    pub async fn request_next_window(&self, target: &CameraTarget, window: Duration) -> usize {
        let mut accepted = 0;
        for camera in &target.camera_names {
            match self.save_next(target, camera, window).await {
                Ok(status) => {
                    accepted += 1;
                    tracing::info!(
                        camera = %camera,
                        "Next video save scheduled: {}",
                        status.as_deref().unwrap_or("Operation completed")
                    );
                }
                Err(e) => tracing::warn!(camera = %camera, "Error scheduling next video save: {}", e),
            }
        }
        accepted
    }
}

/// Start of the window of length `window` ending at `timestamp_ms`.
fn window_start(timestamp_ms: i64, window: Duration) -> i64 {
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    timestamp_ms.saturating_sub(window_ms)
}
