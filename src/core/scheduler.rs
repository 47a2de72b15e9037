//! Periodic baseline labeling.
//!
//! A ticker fires every trigger interval. Each fire labels the current
//! detector status unless an event is in flight, the pose detector has
//! reported no data, or the previous pass is still running.

use crate::config::MIN_TRIGGER_INTERVAL;
use crate::core::detector::DetectorHandle;
use crate::core::labeling::Labeler;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Collaborators of a labeling pass.
#[derive(Clone)]
pub struct SchedulerContext {
    pub detector: DetectorHandle,
    pub labeler: Labeler,
    /// Last availability reported by the pose detector
    pub pose_available: Arc<AtomicBool>,
    pub settle_delay: Duration,
}

/// Why a fire did not label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    Disabled,
    Busy,
    EventInFlight,
    NoPoseData,
    DetectorGone,
}

impl std::fmt::Display for Skip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Skip::Disabled => "auto-tagging disabled",
            Skip::Busy => "previous pass still running",
            Skip::EventInFlight => "event in flight",
            Skip::NoPoseData => "pose detector reports no data",
            Skip::DetectorGone => "detector stopped",
        };
        write!(f, "{reason}")
    }
}

/// Clears the busy flag when a pass ends, however it ends.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic labeler with a mutable interval.
pub struct LabelScheduler {
    context: SchedulerContext,
    enabled: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
    interval: watch::Sender<Duration>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LabelScheduler {
    /// Intervals below [`MIN_TRIGGER_INTERVAL`] are raised to it.
    pub fn new(context: SchedulerContext, interval: Duration) -> Self {
        let (interval, _) = watch::channel(interval.max(MIN_TRIGGER_INTERVAL));
        Self {
            context,
            enabled: Arc::new(AtomicBool::new(false)),
            busy: Arc::new(AtomicBool::new(false)),
            interval,
            task: Mutex::new(None),
        }
    }

    /// Enable auto-tagging and start the ticker if it is not running.
    pub fn start(&self) {
        self.enabled.store(true, Ordering::Release);

        let Ok(mut task) = self.task.lock() else {
            tracing::error!("Scheduler lock poisoned, auto-tagging not started");
            return;
        };
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        *task = Some(tokio::spawn(run(
            self.context.clone(),
            self.enabled.clone(),
            self.busy.clone(),
            self.interval.subscribe(),
        )));
        tracing::info!(
            "Auto-tagging scheduled every {:?}",
            *self.interval.borrow()
        );
    }

    /// Disable auto-tagging and cancel the ticker. A pass already past its
    /// checks runs to completion.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
                tracing::info!("Auto-tagging stopped");
            }
        }
    }

    /// Change the interval. The ticker restarts from now with the new period.
    /// Intervals below [`MIN_TRIGGER_INTERVAL`] are raised to it.
    pub fn set_interval(&self, interval: Duration) {
        self.interval.send_replace(interval.max(MIN_TRIGGER_INTERVAL));
    }

    pub fn interval(&self) -> Duration {
        *self.interval.borrow()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for LabelScheduler {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn run(
    context: SchedulerContext,
    enabled: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
    mut interval: watch::Receiver<Duration>,
) {
    loop {
        let period = *interval.borrow_and_update();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = interval.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    tracing::info!("Auto-tagging interval changed to {:?}", *interval.borrow());
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(skip) = fire(&context, &enabled, &busy) {
                        tracing::debug!("Auto-tagging skipped: {}", skip);
                    }
                }
            }
        }
    }
}

/// Claim the busy flag and label on a separate task.
fn fire(context: &SchedulerContext, enabled: &AtomicBool, busy: &Arc<AtomicBool>) -> Result<(), Skip> {
    if !enabled.load(Ordering::Acquire) {
        return Err(Skip::Disabled);
    }
    if busy.swap(true, Ordering::AcqRel) {
        return Err(Skip::Busy);
    }

    let guard = BusyGuard(busy.clone());
    let context = context.clone();
    tokio::spawn(async move {
        let _guard = guard;
        if let Err(skip) = label_pass(&context).await {
            tracing::debug!("Auto-tagging skipped: {}", skip);
        }
    });
    Ok(())
}

async fn label_pass(context: &SchedulerContext) -> Result<(), Skip> {
    let snapshot = context
        .detector
        .snapshot()
        .await
        .map_err(|_| Skip::DetectorGone)?;
    if snapshot.event_in_flight {
        return Err(Skip::EventInFlight);
    }
    if !context.pose_available.load(Ordering::Acquire) {
        return Err(Skip::NoPoseData);
    }

    let label = snapshot.status.label();
    let timestamp_ms = Utc::now().timestamp_millis();
    tracing::info!("Time for auto label insertion, current label: {}", label);

    tokio::time::sleep(context.settle_delay).await;
    // failures are logged by the labeler
    let _ = context
        .labeler
        .label(label, timestamp_ms, snapshot.save_time.as_secs_f64());
    Ok(())
}
