//! Side effects of a detected crossing.
//!
//! Each step is independent: a failed notification does not prevent the
//! video request, and a failed video request does not prevent labeling.

use crate::camera::{CameraTarget, VideoClipRequester};
use crate::config::CaptureMode;
use crate::core::detector::EventCrossing;
use crate::core::labeling::{LabelOutcome, Labeler};
use crate::store::{DocumentId, RecordWriter};
use std::time::Duration;

/// Settings read when a crossing is dispatched.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub device_name: String,
    pub camera: CameraTarget,
    pub capture: CaptureMode,
    /// Wait before fetching poses so in-flight detector output lands first
    pub settle_delay: Duration,
}

/// What a pipeline run managed to do.
#[derive(Debug, Default)]
pub struct CrossingReport {
    pub notification: Option<DocumentId>,
    pub cameras_accepted: usize,
    pub label: Option<LabelOutcome>,
}

/// Runs the notification, video retention and labeling steps for a crossing.
#[derive(Clone)]
pub struct EventPipeline {
    records: RecordWriter,
    cameras: VideoClipRequester,
    labeler: Labeler,
}

impl EventPipeline {
    pub fn new(records: RecordWriter, cameras: VideoClipRequester, labeler: Labeler) -> Self {
        Self {
            records,
            cameras,
            labeler,
        }
    }

    pub async fn on_crossing(&self, crossing: EventCrossing, settings: PipelineSettings) -> CrossingReport {
        let mut report = CrossingReport::default();
        let label = crossing.label.label();
        let window = crossing.window;

        match self.records.status_change(
            &settings.device_name,
            label,
            crossing.timestamp_ms,
            window.as_secs_f64(),
        ) {
            Ok(id) => report.notification = Some(id),
            Err(e) => tracing::error!(
                device = %settings.device_name,
                timestamp = crossing.timestamp_ms,
                "Error recording status change: {}",
                e
            ),
        }

        report.cameras_accepted = match settings.capture {
            CaptureMode::Past => {
                self.cameras
                    .request_past_window(&settings.camera, crossing.timestamp_ms, window)
                    .await
            }
            CaptureMode::Next => self.cameras.request_next_window(&settings.camera, window).await,
        };

        tokio::time::sleep(settings.settle_delay).await;

        report.label = self
            .labeler
            .label(label, crossing.timestamp_ms, window.as_secs_f64())
            .ok();

        report
    }
}
