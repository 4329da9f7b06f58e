//! Fine-grained progress tracking for export jobs.
//!
//! The tracker is in-memory only and deliberately independent of the job
//! record held by the orchestrator.

mod subscriber;
mod tracker;
mod types;

pub use subscriber::Callback;
pub use tracker::ProgressTracker;
pub use types::{
    EventType, ExportEvent, ExportProgress, ExportWarning, ProgressStatus, TrackerConfig,
    TrackerMetrics, DEFAULT_RETENTION_PERIOD, DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
};
