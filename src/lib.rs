//! Trigger Label Agent - threshold-triggered capture and training-sample labeling.
//!
//! The agent watches one numeric sensor stream. When consecutive readings
//! rise by at least a threshold it records the event, asks the video
//! segmenter to keep the surrounding footage, and stores a labeled,
//! orientation-normalized window of pose detector output. Between events it
//! periodically stores baseline windows labeled with the current status.
//! Every write to the notification collection is pushed to subscribers.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                        Trigger Label Agent                         │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────────┐     │
//! │  │  Stream  │──▶│ Detector │──▶│ Pipeline │──▶│ Camera (REST)│     │
//! │  │ consumer │   │  (actor) │   │          │   └──────────────┘     │
//! │  └──────────┘   └──────────┘   └────┬─────┘                        │
//! │                      ▲              ▼                              │
//! │                 ┌──────────┐   ┌──────────┐   ┌──────────────┐     │
//! │                 │Scheduler │──▶│ Labeler  │──▶│    Store     │     │
//! │                 └──────────┘   └──────────┘   └──────┬───────┘     │
//! │                                                      ▼             │
//! │                                               ┌──────────────┐     │
//! │                                               │   Notifier   │     │
//! │                                               └──────────────┘     │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use trigger_label_agent::{create_shared_log, Config, MemoryStore, TriggerReceiver};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let receiver = TriggerReceiver::new(Config::default(), store, create_shared_log())?;
//! receiver.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod activity;
pub mod camera;
pub mod config;
pub mod core;
pub mod notifier;
pub mod receiver;
pub mod store;
pub mod stream;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use activity::{create_shared_log, ActivityLog, ActivityStats, SharedActivityLog};
pub use camera::{CameraError, CameraTarget, VideoClipRequester};
pub use config::Config;
pub use core::{DetectorHandle, DetectorStatus, EventCrossing, Labeler, Normalizer};
pub use notifier::{ChangeFeedNotifier, Notification};
pub use receiver::{ControlError, ControlOutcome, TriggerReceiver};
pub use store::{DocumentStore, MemoryStore, PoseStore};
pub use stream::{SensorReading, StreamError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
