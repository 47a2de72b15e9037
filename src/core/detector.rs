//! Threshold-crossing detector.
//!
//! The detector state lives inside a single task that receives commands over
//! a channel. Stream readings, debounce resets and operator overrides all go
//! through the same queue, so state transitions are applied one at a time in
//! arrival order.

use crate::activity::SharedActivityLog;
use crate::stream::SensorReading;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Capacity of the command queue.
const COMMAND_QUEUE: usize = 1024;

/// Detector status, doubling as the training label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorStatus {
    /// No event; baseline label 0
    Idle,
    /// Inside a crossing's debounce window; label 1
    Active,
    /// Operator-marked negative class; label -1
    Suppressed,
}

impl DetectorStatus {
    /// Numeric label written on training records.
    pub fn label(self) -> i32 {
        match self {
            DetectorStatus::Active => 1,
            DetectorStatus::Idle => 0,
            DetectorStatus::Suppressed => -1,
        }
    }

    /// Parse a numeric label; only 1, 0 and -1 are valid.
    pub fn from_label(label: i32) -> Option<Self> {
        match label {
            1 => Some(DetectorStatus::Active),
            0 => Some(DetectorStatus::Idle),
            -1 => Some(DetectorStatus::Suppressed),
            _ => None,
        }
    }
}

impl std::fmt::Display for DetectorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Emitted once per debounce window when a crossing is detected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventCrossing {
    /// Timestamp of the reading that crossed, UTC ms
    pub timestamp_ms: i64,
    pub label: DetectorStatus,
    /// Debounce window in force when the crossing happened
    pub window: Duration,
    pub previous_value: f64,
    pub value: f64,
}

/// Detector tuning.
#[derive(Debug, Clone, Copy)]
pub struct DetectorSettings {
    pub threshold: f64,
    pub save_time: Duration,
    pub initial_status: DetectorStatus,
}

/// Point-in-time view of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectorSnapshot {
    pub status: DetectorStatus,
    pub previous_value: Option<f64>,
    pub event_in_flight: bool,
    pub threshold: f64,
    #[serde(serialize_with = "serialize_secs")]
    pub save_time: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// The detector task is gone.
#[derive(Debug)]
pub enum DetectorError {
    Closed,
}

impl std::fmt::Display for DetectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectorError::Closed => write!(f, "Detector task has stopped"),
        }
    }
}

impl std::error::Error for DetectorError {}

enum Command {
    Process(SensorReading),
    Reset { generation: u64 },
    SetStatus(DetectorStatus, oneshot::Sender<DetectorStatus>),
    SetThreshold(f64),
    SetSaveTime(Duration),
    Snapshot(oneshot::Sender<DetectorSnapshot>),
}

/// State owned exclusively by the detector task.
struct DetectorState {
    status: DetectorStatus,
    previous_value: Option<f64>,
    event_in_flight: bool,
    threshold: f64,
    save_time: Duration,
    /// Incremented whenever a debounce window opens or is closed early
    generation: u64,
}

impl DetectorState {
    fn snapshot(&self) -> DetectorSnapshot {
        DetectorSnapshot {
            status: self.status,
            previous_value: self.previous_value,
            event_in_flight: self.event_in_flight,
            threshold: self.threshold,
            save_time: self.save_time,
        }
    }
}

/// Outcome of feeding one reading.
#[derive(Debug, PartialEq)]
enum Step {
    Tracked,
    Crossed(EventCrossing),
    Suppressed,
}

impl DetectorState {
    fn process(&mut self, reading: SensorReading) -> Step {
        if !reading.value.is_finite() {
            return Step::Tracked;
        }

        match self.previous_value {
            Some(previous) if reading.value - previous >= self.threshold => {
                if self.event_in_flight {
                    return Step::Suppressed;
                }
                self.status = DetectorStatus::Active;
                self.event_in_flight = true;
                self.generation += 1;
                Step::Crossed(EventCrossing {
                    timestamp_ms: reading.timestamp_ms,
                    label: DetectorStatus::Active,
                    window: self.save_time,
                    previous_value: previous,
                    value: reading.value,
                })
            }
            _ => {
                self.previous_value = Some(reading.value);
                Step::Tracked
            }
        }
    }

    fn set_status(&mut self, status: DetectorStatus) {
        self.status = status;
        if status == DetectorStatus::Idle && self.event_in_flight {
            self.event_in_flight = false;
            self.generation += 1;
        }
    }
}

/// Cloneable handle to the detector task.
#[derive(Clone)]
pub struct DetectorHandle {
    tx: mpsc::Sender<Command>,
}

impl DetectorHandle {
    /// Spawn the detector task.
    ///
    /// Returns the handle and the receiving end of the crossing channel. The
    /// task ends once every handle has been dropped.
    pub fn spawn(
        settings: DetectorSettings,
        activity: SharedActivityLog,
    ) -> (Self, mpsc::UnboundedReceiver<EventCrossing>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let (crossing_tx, crossing_rx) = mpsc::unbounded_channel();

        let state = DetectorState {
            status: settings.initial_status,
            previous_value: None,
            event_in_flight: false,
            threshold: settings.threshold,
            save_time: settings.save_time,
            generation: 0,
        };

        tokio::spawn(run(state, rx, tx.downgrade(), crossing_tx, activity));

        (Self { tx }, crossing_rx)
    }

    async fn send(&self, command: Command) -> Result<(), DetectorError> {
        self.tx.send(command).await.map_err(|_| DetectorError::Closed)
    }

    /// Feed one reading.
    pub async fn process(&self, reading: SensorReading) -> Result<(), DetectorError> {
        self.send(Command::Process(reading)).await
    }

    /// Override the status. Setting `Idle` closes an open debounce window.
    pub async fn set_status(&self, status: DetectorStatus) -> Result<DetectorStatus, DetectorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetStatus(status, reply)).await?;
        rx.await.map_err(|_| DetectorError::Closed)
    }

    pub async fn set_threshold(&self, threshold: f64) -> Result<(), DetectorError> {
        self.send(Command::SetThreshold(threshold)).await
    }

    /// Change the debounce window; applies to the next crossing.
    pub async fn set_save_time(&self, save_time: Duration) -> Result<(), DetectorError> {
        self.send(Command::SetSaveTime(save_time)).await
    }

    pub async fn snapshot(&self) -> Result<DetectorSnapshot, DetectorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply)).await?;
        rx.await.map_err(|_| DetectorError::Closed)
    }

    pub async fn status(&self) -> Result<DetectorStatus, DetectorError> {
        Ok(self.snapshot().await?.status)
    }
}

async fn run(
    mut state: DetectorState,
    mut rx: mpsc::Receiver<Command>,
    weak_tx: mpsc::WeakSender<Command>,
    crossings: mpsc::UnboundedSender<EventCrossing>,
    activity: SharedActivityLog,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Process(reading) => match state.process(reading) {
                Step::Crossed(crossing) => {
                    tracing::info!(
                        previous = crossing.previous_value,
                        value = crossing.value,
                        timestamp = crossing.timestamp_ms,
                        "Crossing detected, status -> {}",
                        state.status
                    );
                    activity.record_crossing();
                    schedule_reset(&weak_tx, state.generation, state.save_time);
                    if crossings.send(crossing).is_err() {
                        tracing::warn!("Crossing receiver dropped, event not dispatched");
                    }
                }
                Step::Suppressed => {
                    tracing::debug!(
                        value = reading.value,
                        "Crossing inside open debounce window ignored"
                    );
                    activity.record_suppressed_crossing();
                }
                Step::Tracked => {}
            },
            Command::Reset { generation } => {
                if generation == state.generation && state.event_in_flight {
                    state.status = DetectorStatus::Idle;
                    state.event_in_flight = false;
                    tracing::info!("Debounce window closed, status -> {}", state.status);
                }
            }
            Command::SetStatus(status, reply) => {
                state.set_status(status);
                tracing::info!("Status changed to {}", state.status);
                let _ = reply.send(state.status);
            }
            Command::SetThreshold(threshold) => {
                state.threshold = threshold;
            }
            Command::SetSaveTime(save_time) => {
                state.save_time = save_time;
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(state.snapshot());
            }
        }
    }
    tracing::debug!("Detector task finished");
}

/// Arm the one-shot timer that closes the debounce window.
fn schedule_reset(weak_tx: &mpsc::WeakSender<Command>, generation: u64, after: Duration) {
    let weak_tx = weak_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        if let Some(tx) = weak_tx.upgrade() {
            let _ = tx.send(Command::Reset { generation }).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::create_shared_log;
    use tokio::sync::mpsc::error::TryRecvError;

    fn settings(threshold: f64, save_secs: u64) -> DetectorSettings {
        DetectorSettings {
            threshold,
            save_time: Duration::from_secs(save_secs),
            initial_status: DetectorStatus::Idle,
        }
    }

    fn state(threshold: f64) -> DetectorState {
        DetectorState {
            status: DetectorStatus::Idle,
            previous_value: None,
            event_in_flight: false,
            threshold,
            save_time: Duration::from_secs(5),
            generation: 0,
        }
    }

    #[test]
    fn test_crossing_requires_rise_of_threshold() {
        let mut s = state(15.0);
        assert_eq!(s.process(SensorReading::new(10.0, 1)), Step::Tracked);
        assert_eq!(s.process(SensorReading::new(24.9, 2)), Step::Tracked);
        assert_eq!(s.previous_value, Some(24.9));
        assert!(matches!(
            s.process(SensorReading::new(39.9, 3)),
            Step::Crossed(_)
        ));
        // the crossing reading does not become the new baseline
        assert_eq!(s.previous_value, Some(24.9));
    }

    #[test]
    fn test_falling_values_never_cross() {
        let mut s = state(5.0);
        for (i, v) in [100.0, 80.0, 50.0, 10.0].into_iter().enumerate() {
            assert_eq!(s.process(SensorReading::new(v, i as i64)), Step::Tracked);
        }
        assert_eq!(s.status, DetectorStatus::Idle);
    }

    #[test]
    fn test_non_finite_reading_does_not_advance() {
        let mut s = state(5.0);
        s.process(SensorReading::new(1.0, 1));
        s.process(SensorReading::new(f64::NAN, 2));
        assert_eq!(s.previous_value, Some(1.0));
    }

    #[test]
    fn test_manual_idle_closes_window() {
        let mut s = state(5.0);
        s.process(SensorReading::new(0.0, 1));
        s.process(SensorReading::new(10.0, 2));
        assert!(s.event_in_flight);
        let generation = s.generation;
        s.set_status(DetectorStatus::Idle);
        assert!(!s.event_in_flight);
        assert_ne!(s.generation, generation);
    }

    #[test]
    fn test_status_labels() {
        for label in [1, 0, -1] {
            assert_eq!(DetectorStatus::from_label(label).unwrap().label(), label);
        }
        assert!(DetectorStatus::from_label(2).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_crossing_per_debounce_window() {
        let activity = create_shared_log();
        let (detector, mut crossings) = DetectorHandle::spawn(settings(15.0, 5), activity.clone());

        detector.process(SensorReading::new(10.0, 1_000)).await.unwrap();
        detector.process(SensorReading::new(12.0, 2_000)).await.unwrap();
        detector.process(SensorReading::new(28.0, 3_000)).await.unwrap();

        let crossing = crossings.recv().await.unwrap();
        assert_eq!(crossing.timestamp_ms, 3_000);
        assert_eq!(crossing.label, DetectorStatus::Active);
        assert_eq!(crossing.window, Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(2)).await;
        detector.process(SensorReading::new(30.0, 5_000)).await.unwrap();

        let snapshot = detector.snapshot().await.unwrap();
        assert_eq!(snapshot.status, DetectorStatus::Active);
        assert!(snapshot.event_in_flight);
        assert!(matches!(crossings.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(activity.stats().crossings_suppressed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_timer_resets_to_idle() {
        let (detector, mut crossings) = DetectorHandle::spawn(settings(5.0, 5), create_shared_log());

        detector.process(SensorReading::new(0.0, 1)).await.unwrap();
        detector.process(SensorReading::new(6.0, 2)).await.unwrap();
        crossings.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        let snapshot = detector.snapshot().await.unwrap();
        assert_eq!(snapshot.status, DetectorStatus::Idle);
        assert!(!snapshot.event_in_flight);

        // a fresh window can open again
        detector.process(SensorReading::new(12.0, 3)).await.unwrap();
        assert_eq!(crossings.recv().await.unwrap().timestamp_ms, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reset_ignored_after_manual_override() {
        let (detector, mut crossings) = DetectorHandle::spawn(settings(5.0, 5), create_shared_log());

        detector.process(SensorReading::new(0.0, 1)).await.unwrap();
        detector.process(SensorReading::new(6.0, 2)).await.unwrap();
        crossings.recv().await.unwrap();

        // close the first window by hand after 3s, then open a second one
        tokio::time::sleep(Duration::from_secs(3)).await;
        detector.set_status(DetectorStatus::Idle).await.unwrap();
        detector.process(SensorReading::new(12.0, 3)).await.unwrap();
        crossings.recv().await.unwrap();

        // the first window's timer fires at t=5s and must not close the second
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let snapshot = detector.snapshot().await.unwrap();
        assert!(snapshot.event_in_flight);
        assert_eq!(snapshot.status, DetectorStatus::Active);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!detector.snapshot().await.unwrap().event_in_flight);
    }

    #[tokio::test]
    async fn test_reconfiguration_applies_to_next_reading() {
        let (detector, mut crossings) = DetectorHandle::spawn(settings(50.0, 5), create_shared_log());

        detector.process(SensorReading::new(0.0, 1)).await.unwrap();
        detector.process(SensorReading::new(10.0, 2)).await.unwrap();
        detector.set_threshold(5.0).await.unwrap();
        detector.set_save_time(Duration::from_secs(9)).await.unwrap();
        detector.process(SensorReading::new(16.0, 3)).await.unwrap();

        let crossing = crossings.recv().await.unwrap();
        assert_eq!(crossing.previous_value, 10.0);
        assert_eq!(crossing.window, Duration::from_secs(9));
        assert_eq!(detector.snapshot().await.unwrap().threshold, 5.0);
    }
}
