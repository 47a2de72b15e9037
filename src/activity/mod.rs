//! Activity accounting for the trigger label agent.

pub mod log;

pub use log::{
    create_shared_log, create_shared_log_with_persistence, ActivityLog, ActivityStats,
    LabelCounts, SharedActivityLog,
};
