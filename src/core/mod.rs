//! Core functionality for the trigger label agent.
//!
//! This module contains:
//! - The threshold-crossing detector
//! - Pose windows, tensors and orientation normalization
//! - The labeling operation shared by crossings and the baseline scheduler
//! - The crossing pipeline and the periodic scheduler

pub mod detector;
pub mod labeling;
pub mod normalize;
pub mod pipeline;
pub mod scheduler;
pub mod windowing;

// Re-export commonly used types
pub use detector::{
    DetectorError, DetectorHandle, DetectorSettings, DetectorSnapshot, DetectorStatus,
    EventCrossing,
};
pub use labeling::{LabelOutcome, Labeler, LabelingError};
pub use normalize::Normalizer;
pub use pipeline::{CrossingReport, EventPipeline, PipelineSettings};
pub use scheduler::{LabelScheduler, SchedulerContext};
pub use windowing::{PoseSample, PoseShape, PoseTensor, PoseWindow};
