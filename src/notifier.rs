//! Change feed to subscriber push.
//!
//! One watcher task per notifier reads the store's change feed, keeps
//! inserts and updates on the notification collection, and broadcasts them
//! to every connected subscriber with the delay since the document's
//! timestamp. Subscribers that connect late miss earlier events.

use crate::store::{ChangeEvent, Operation, SharedStore};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use statrs::statistics::{Data, OrderStatistics, Statistics};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Name of the pushed event.
pub const NOTIFICATION_EVENT: &str = "notifications";

/// Buffered pushes per subscriber before it starts lagging.
const SUBSCRIBER_CAPACITY: usize = 256;

/// Number of latency values kept for the summary.
const LATENCY_WINDOW: usize = 512;

/// Payload pushed to subscribers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    pub event: &'static str,
    pub data: Value,
    /// Document timestamp, UTC ms
    pub timestamp: Option<i64>,
    /// Delay between the document timestamp and the push
    pub latency_ms: Option<f64>,
}

/// Latency over the most recent pushes.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct LatencySummary {
    pub count: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
}

#[derive(Default)]
struct LatencyWindow {
    values: VecDeque<f64>,
}

impl LatencyWindow {
    fn push(&mut self, value: f64) {
        if self.values.len() == LATENCY_WINDOW {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    fn summary(&self) -> LatencySummary {
        if self.values.is_empty() {
            return LatencySummary::default();
        }
        let mean_ms = self.values.iter().mean();
        let mut data = Data::new(self.values.iter().copied().collect::<Vec<f64>>());
        LatencySummary {
            count: self.values.len(),
            mean_ms,
            median_ms: data.median(),
            p95_ms: data.percentile(95),
        }
    }
}

/// Republishes store mutations to real-time subscribers.
pub struct ChangeFeedNotifier {
    store: SharedStore,
    collection: String,
    field: String,
    tx: broadcast::Sender<Notification>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    latencies: Arc<Mutex<LatencyWindow>>,
}

impl ChangeFeedNotifier {
    /// Watch `collection`, pushing each document's `field`.
    pub fn new(store: SharedStore, collection: impl Into<String>, field: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            store,
            collection: collection.into(),
            field: field.into(),
            tx,
            watcher: Mutex::new(None),
            latencies: Arc::new(Mutex::new(LatencyWindow::default())),
        }
    }

    /// Register a subscriber, starting the watcher on first use.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        let rx = self.tx.subscribe();
        self.ensure_watcher();
        rx
    }

    /// Start the watcher unless it is already running.
    pub fn ensure_watcher(&self) {
        let Ok(mut watcher) = self.watcher.lock() else {
            tracing::error!("Notifier lock poisoned, watcher not started");
            return;
        };
        if watcher.as_ref().is_some_and(|w| !w.is_finished()) {
            return;
        }

        // subscribe to the feed before returning so no later mutation is missed
        let feed = self.store.watch();
        *watcher = Some(tokio::spawn(watch(
            feed,
            self.collection.clone(),
            self.field.clone(),
            self.tx.clone(),
            self.latencies.clone(),
        )));
        tracing::info!(collection = %self.collection, "Change feed watcher started");
    }

    pub fn watcher_started(&self) -> bool {
        self.watcher
            .lock()
            .map(|w| w.as_ref().is_some_and(|w| !w.is_finished()))
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn latency(&self) -> LatencySummary {
        self.latencies
            .lock()
            .map(|l| l.summary())
            .unwrap_or_default()
    }

    /// Stop the watcher. A later subscriber starts a new one.
    pub fn shutdown(&self) {
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(watcher) = watcher.take() {
                watcher.abort();
                tracing::info!("Change feed watcher stopped");
            }
        }
    }
}

impl Drop for ChangeFeedNotifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Next push for a subscriber. A subscriber that fell behind skips the
/// pushes it missed and continues with the oldest one still buffered.
/// `None` once the notifier is gone.
pub async fn next_push(rx: &mut broadcast::Receiver<Notification>) -> Option<Notification> {
    loop {
        match rx.recv().await {
            Ok(notification) => return Some(notification),
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("Notification subscriber lagged, {} pushes dropped", missed);
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

/// Build the push for a change event, if it concerns the watched collection.
fn to_notification(event: &ChangeEvent, collection: &str, field: &str, now_ms: i64) -> Option<Notification> {
    if event.collection != collection
        || !matches!(event.operation, Operation::Insert | Operation::Update)
    {
        return None;
    }

    let doc = &event.full_document;
    let data = match doc.get(field) {
        Some(value) => value.clone(),
        None => doc.clone(),
    };
    let timestamp = doc.get("timestamp").and_then(Value::as_i64);

    Some(Notification {
        event: NOTIFICATION_EVENT,
        data,
        timestamp,
        latency_ms: timestamp.map(|ts| (now_ms - ts) as f64),
    })
}

async fn watch(
    mut feed: broadcast::Receiver<ChangeEvent>,
    collection: String,
    field: String,
    tx: broadcast::Sender<Notification>,
    latencies: Arc<Mutex<LatencyWindow>>,
) {
    loop {
        let event = match feed.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("Change feed watcher lagged, {} events skipped", missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let Some(notification) =
            to_notification(&event, &collection, &field, Utc::now().timestamp_millis())
        else {
            continue;
        };

        if let Some(latency) = notification.latency_ms {
            if let Ok(mut window) = latencies.lock() {
                window.push(latency);
            }
            tracing::debug!(latency_ms = latency, "Notification pushed");
        }
        // no subscribers is fine
        let _ = tx.send(notification);
    }
    tracing::debug!("Change feed closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentStore, MemoryStore};
    use serde_json::json;
    use std::time::Duration;

    fn notifier() -> (Arc<MemoryStore>, ChangeFeedNotifier) {
        let store = Arc::new(MemoryStore::new());
        let notifier = ChangeFeedNotifier::new(store.clone(), "notification", "message");
        (store, notifier)
    }

    async fn next(rx: &mut broadcast::Receiver<Notification>) -> Notification {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_filters_other_collections() {
        let event = ChangeEvent {
            operation: Operation::Insert,
            collection: "results".to_string(),
            full_document: json!({"message": "x"}),
        };
        assert!(to_notification(&event, "notification", "message", 0).is_none());
    }

    #[test]
    fn test_latency_from_document_timestamp() {
        let event = ChangeEvent {
            operation: Operation::Update,
            collection: "notification".to_string(),
            full_document: json!({"message": "done", "timestamp": 1_000}),
        };
        let n = to_notification(&event, "notification", "message", 1_250).unwrap();
        assert_eq!(n.data, json!("done"));
        assert_eq!(n.latency_ms, Some(250.0));
        assert_eq!(n.event, "notifications");
    }

    #[test]
    fn test_latency_summary() {
        let mut window = LatencyWindow::default();
        assert_eq!(window.summary().count, 0);
        for v in 1..=100 {
            window.push(v as f64);
        }
        let summary = window.summary();
        assert_eq!(summary.count, 100);
        assert!((summary.mean_ms - 50.5).abs() < 1e-9);
        assert!((summary.median_ms - 50.5).abs() < 1e-9);
        assert!(summary.p95_ms > 94.0 && summary.p95_ms < 97.0);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let mut window = LatencyWindow::default();
        for v in 0..(LATENCY_WINDOW + 10) {
            window.push(v as f64);
        }
        assert_eq!(window.summary().count, LATENCY_WINDOW);
    }

    #[tokio::test]
    async fn test_watcher_starts_once() {
        let (_, notifier) = notifier();
        assert!(!notifier.watcher_started());

        let _a = notifier.subscribe();
        let _b = notifier.subscribe();
        assert!(notifier.watcher_started());
        assert_eq!(notifier.subscriber_count(), 2);

        notifier.shutdown();
        assert!(!notifier.watcher_started());
    }

    #[tokio::test]
    async fn test_pushes_to_all_subscribers() {
        let (store, notifier) = notifier();
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        store
            .insert("notification", json!({"message": "hello", "timestamp": Utc::now().timestamp_millis()}))
            .unwrap();
        store.insert("results", json!({"message": "ignored"})).unwrap();

        assert_eq!(next(&mut a).await.data, json!("hello"));
        assert_eq!(next(&mut b).await.data, json!("hello"));
        assert!(a.try_recv().is_err());
        assert_eq!(notifier.latency().count, 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let (store, notifier) = notifier();
        let mut early = notifier.subscribe();
        store.insert("notification", json!({"message": "first"})).unwrap();
        assert_eq!(next(&mut early).await.data, json!("first"));

        let mut late = notifier.subscribe();
        store.insert("notification", json!({"message": "second"})).unwrap();
        assert_eq!(next(&mut late).await.data, json!("second"));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_going() {
        let (tx, mut rx) = broadcast::channel(2);
        for i in 0..5 {
            tx.send(Notification {
                event: NOTIFICATION_EVENT,
                data: json!(i),
                timestamp: None,
                latency_ms: None,
            })
            .unwrap();
        }

        assert_eq!(next_push(&mut rx).await.unwrap().data, json!(3));
        assert_eq!(next_push(&mut rx).await.unwrap().data, json!(4));
        drop(tx);
        assert!(next_push(&mut rx).await.is_none());
    }
}
