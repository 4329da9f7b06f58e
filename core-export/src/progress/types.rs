use crate::{ExportError, ExportJobId, Result};
use chrono::{DateTime, Utc};
use core_runtime::events::EventSeverity;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default time terminal sessions are kept before retention removes them
pub const DEFAULT_RETENTION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Default bound of each subscriber queue
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

// ============================================================================
// Status
// ============================================================================

/// Tracked status of a job
///
/// Independent of [`JobStatus`](crate::JobStatus): the tracker mirrors what
/// the executing code reports and may briefly disagree with the job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressStatus::Completed | ProgressStatus::Failed | ProgressStatus::Cancelled
        )
    }

    /// Whether the session still counts as active (not yet terminal)
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Pending => "pending",
            ProgressStatus::Running => "running",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
            ProgressStatus::Cancelled => "cancelled",
            ProgressStatus::Paused => "paused",
        }
    }

    /// Whether moving from `self` to `to` is a legal tracker transition
    pub fn can_transition_to(&self, to: ProgressStatus) -> bool {
        use ProgressStatus::*;

        match (self, to) {
            (Pending, Running | Completed | Failed | Cancelled) => true,
            (Running, Completed | Failed | Cancelled | Paused) => true,
            (Paused, Running | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub(crate) fn check_transition(&self, job_id: &ExportJobId, to: ProgressStatus) -> Result<()> {
        if self.can_transition_to(to) {
            return Ok(());
        }

        Err(ExportError::InvalidStateTransition {
            job_id: job_id.to_string(),
            from: self.as_str().to_string(),
            to: to.as_str().to_string(),
            reason: format!("Tracked job is {}", self.as_str()),
        })
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Progress Snapshot
// ============================================================================

/// A warning attached to a tracked job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportWarning {
    pub code: String,
    pub message: String,
    pub severity: EventSeverity,
    pub timestamp: DateTime<Utc>,
}

/// Progress state of one tracked job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportProgress {
    pub job_id: ExportJobId,
    pub status: ProgressStatus,
    /// Ratio in `[0, 1]`
    pub progress: f64,
    pub current_step: String,
    pub completed_steps: u32,
    pub total_steps: u32,
    pub start_time: DateTime<Utc>,
    /// Projected finish time, extrapolated from elapsed time and ratio
    pub estimated_end: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    pub error: Option<String>,
    pub warnings: Vec<ExportWarning>,
}

impl ExportProgress {
    pub(crate) fn new(job_id: ExportJobId, total_steps: u32, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status: ProgressStatus::Pending,
            progress: 0.0,
            current_step: String::new(),
            completed_steps: 0,
            total_steps,
            start_time: now,
            estimated_end: None,
            last_update: now,
            error: None,
            warnings: Vec::new(),
        }
    }

    /// Progress as a whole percentage
    pub fn percent(&self) -> u8 {
        (self.progress * 100.0).round().clamp(0.0, 100.0) as u8
    }

    /// Time remaining until `estimated_end`, if one is known and still ahead
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.estimated_end
            .and_then(|end| (end - now).to_std().ok())
    }
}

// ============================================================================
// Audit Events
// ============================================================================

/// Kind of an audit log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JobStarted,
    Progress,
    JobCompleted,
    JobFailed,
    JobCancelled,
    JobPaused,
    JobResumed,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobStarted => "job_started",
            EventType::Progress => "progress",
            EventType::JobCompleted => "job_completed",
            EventType::JobFailed => "job_failed",
            EventType::JobCancelled => "job_cancelled",
            EventType::JobPaused => "job_paused",
            EventType::JobResumed => "job_resumed",
            EventType::Warning => "warning",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable entry in a tracked job's audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportEvent {
    pub job_id: ExportJobId,
    pub event_type: EventType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub severity: EventSeverity,
    pub data: serde_json::Value,
}

// ============================================================================
// Metrics & Config
// ============================================================================

/// Aggregate counters across all tracked jobs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerMetrics {
    /// Sessions ever started
    pub total_tracked: u64,
    /// Live sessions that are not terminal
    pub active_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub cancelled_jobs: u64,
    /// Live sessions currently paused
    pub paused_jobs: u64,
    pub total_events: u64,
    pub total_warnings: u64,
    /// Notifications discarded because a subscriber queue was full
    pub dropped_notifications: u64,
    /// Callback invocations that panicked
    pub callback_failures: u64,
    /// Sessions removed by retention
    pub expired_sessions: u64,
    /// Open subscriber queues across all jobs
    pub active_subscribers: u64,
}

/// Progress tracker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Age after which terminal sessions are removed; also the retention tick
    pub retention_period: Duration,
    /// Bound of each subscriber queue
    pub subscriber_queue_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retention_period: DEFAULT_RETENTION_PERIOD,
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
        }
    }
}

impl TrackerConfig {
    pub fn with_retention_period(mut self, period: Duration) -> Self {
        self.retention_period = period;
        self
    }

    pub fn with_subscriber_queue_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_queue_capacity = capacity.max(1);
        self
    }
}
