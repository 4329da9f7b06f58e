//! # Event Bus System
//!
//! Provides an event-driven architecture for the export platform core using
//! `tokio::sync::broadcast`. Engines publish typed events here so hosts can
//! observe job lifecycles without polling.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: Strongly-typed enum hierarchies for each engine
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    emit     ┌───────────┐
//! │ Orchestrator ├────────────>│           │
//! └──────────────┘             │           │
//!                              │ EventBus  │    subscribe    ┌────────────┐
//! ┌──────────────┐    emit     │ (broadcast├────────────────>│ Subscriber │
//! │   Tracker    ├────────────>│  channel) │                 └────────────┘
//! └──────────────┘             │           │
//! ┌──────────────┐    emit     │           │    subscribe    ┌────────────┐
//! │  Analytics   ├────────────>│           ├────────────────>│ Subscriber │
//! └──────────────┘             └───────────┘                 └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, ExportLifecycleEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut subscriber = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Export(ExportLifecycleEvent::Cancelled {
//!         job_id: "job-1".to_string(),
//!     }))
//!     .ok();
//!
//! let event = subscriber.recv().await.unwrap();
//! assert_eq!(event.description(), "Export cancelled");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   The subscriber can continue receiving newer events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Emitting with no subscribers returns an error; publishers ignore it with `.ok()`.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Export job lifecycle events from the orchestrator
    Export(ExportLifecycleEvent),
    /// Fine-grained progress events from the progress tracker
    Progress(ProgressEvent),
    /// Analytics engine events
    Analytics(AnalyticsEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Export(e) => e.description(),
            CoreEvent::Progress(e) => e.description(),
            CoreEvent::Analytics(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Export(ExportLifecycleEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Progress(ProgressEvent::Warning { severity, .. }) => *severity,
            CoreEvent::Export(ExportLifecycleEvent::Cancelled { .. }) => EventSeverity::Warning,
            CoreEvent::Export(ExportLifecycleEvent::Completed { .. }) => EventSeverity::Info,
            CoreEvent::Analytics(AnalyticsEvent::ReportGenerated { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    /// Returns the job ID the event refers to, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            CoreEvent::Export(e) => Some(e.job_id()),
            CoreEvent::Progress(e) => Some(e.job_id()),
            CoreEvent::Analytics(_) => None,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

impl EventSeverity {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Debug => "debug",
            EventSeverity::Info => "info",
            EventSeverity::Warning => "warning",
            EventSeverity::Error => "error",
        }
    }
}

impl fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Export Lifecycle Events
// ============================================================================

/// Events emitted by the job orchestrator as export jobs change state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ExportLifecycleEvent {
    /// A job was validated and persisted.
    Created {
        /// The export job ID.
        job_id: String,
        /// Requested output format (e.g. "json", "ifc_lite").
        format: String,
        /// Requested quality level (e.g. "standard").
        quality: String,
    },
    /// A job moved from pending to in-progress.
    Started {
        /// The export job ID.
        job_id: String,
        /// Output format being produced.
        format: String,
    },
    /// A job finished successfully.
    Completed {
        /// The export job ID.
        job_id: String,
        /// Size of the produced file in bytes.
        file_size: u64,
        /// Execution time in milliseconds.
        duration_ms: u64,
    },
    /// A job failed during conversion or processing.
    Failed {
        /// The export job ID.
        job_id: String,
        /// Human-readable error message.
        message: String,
    },
    /// A job was cancelled.
    Cancelled {
        /// The export job ID.
        job_id: String,
    },
}

impl ExportLifecycleEvent {
    fn description(&self) -> &str {
        match self {
            ExportLifecycleEvent::Created { .. } => "Export job created",
            ExportLifecycleEvent::Started { .. } => "Export started",
            ExportLifecycleEvent::Completed { .. } => "Export completed successfully",
            ExportLifecycleEvent::Failed { .. } => "Export failed",
            ExportLifecycleEvent::Cancelled { .. } => "Export cancelled",
        }
    }

    fn job_id(&self) -> &str {
        match self {
            ExportLifecycleEvent::Created { job_id, .. }
            | ExportLifecycleEvent::Started { job_id, .. }
            | ExportLifecycleEvent::Completed { job_id, .. }
            | ExportLifecycleEvent::Failed { job_id, .. }
            | ExportLifecycleEvent::Cancelled { job_id } => job_id,
        }
    }
}

// ============================================================================
// Progress Events
// ============================================================================

/// Events mirrored from the progress tracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum ProgressEvent {
    /// Tracking began for a job.
    TrackingStarted {
        /// The tracked job ID.
        job_id: String,
        /// Number of steps the job is expected to run.
        total_steps: u32,
    },
    /// Progress ratio or step changed.
    Updated {
        /// The tracked job ID.
        job_id: String,
        /// Progress ratio in `[0, 1]`.
        progress: f64,
        /// Label of the current step.
        current_step: String,
        /// Number of completed steps.
        completed_steps: u32,
    },
    /// Tracked status changed (completed, failed, paused, ...).
    StatusChanged {
        /// The tracked job ID.
        job_id: String,
        /// Previous status.
        from: String,
        /// New status.
        to: String,
    },
    /// A warning was attached to the job.
    Warning {
        /// The tracked job ID.
        job_id: String,
        /// Machine-readable warning code.
        code: String,
        /// Human-readable warning message.
        message: String,
        /// Severity of the warning.
        severity: EventSeverity,
    },
}

impl ProgressEvent {
    fn description(&self) -> &str {
        match self {
            ProgressEvent::TrackingStarted { .. } => "Progress tracking started",
            ProgressEvent::Updated { .. } => "Export progress updated",
            ProgressEvent::StatusChanged { .. } => "Export status changed",
            ProgressEvent::Warning { .. } => "Export warning raised",
        }
    }

    fn job_id(&self) -> &str {
        match self {
            ProgressEvent::TrackingStarted { job_id, .. }
            | ProgressEvent::Updated { job_id, .. }
            | ProgressEvent::StatusChanged { job_id, .. }
            | ProgressEvent::Warning { job_id, .. } => job_id,
        }
    }
}

// ============================================================================
// Analytics Events
// ============================================================================

/// Events emitted by the analytics engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum AnalyticsEvent {
    /// A report was generated and cached.
    ReportGenerated {
        /// Identifier under which the report is cached.
        report_id: String,
        /// Report period (hour, day, week, month).
        period: String,
        /// Number of jobs covered by the report.
        total_jobs: u64,
    },
    /// A background aggregation pass finished.
    AggregationCompleted {
        /// Number of metric names aggregated.
        metrics: usize,
        /// Number of hourly buckets written.
        buckets: usize,
        /// Number of raw samples pruned by retention.
        pruned_samples: usize,
    },
}

impl AnalyticsEvent {
    fn description(&self) -> &str {
        match self {
            AnalyticsEvent::ReportGenerated { .. } => "Analytics report generated",
            AnalyticsEvent::AggregationCompleted { .. } => "Metric aggregation completed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Non-blocking sends (events are cloned for each subscriber)
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of events to buffer per subscriber.
    ///   A subscriber that falls further behind receives `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are no active subscribers.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber to receive events.
    ///
    /// Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with filtering.
///
/// # Example
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let stream = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Export(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Creates a new event stream from a receiver.
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Restricts the stream to events matching `predicate`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Restricts the stream to events about one job.
    pub fn for_job(self, job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        self.filter(move |event| event.job_id() == Some(job_id.as_str()))
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }

    fn matches(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn started(job_id: &str) -> CoreEvent {
        CoreEvent::Export(ExportLifecycleEvent::Started {
            job_id: job_id.to_string(),
            format: "json".to_string(),
        })
    }

    #[tokio::test]
    async fn test_event_bus_subscription() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);

        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        assert!(bus.emit(started("job-1")).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = started("job-1");
        assert_eq!(bus.emit(event.clone()).unwrap(), 2);

        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| matches!(event, CoreEvent::Analytics(_)));

        bus.emit(started("job-1")).ok();
        let analytics = CoreEvent::Analytics(AnalyticsEvent::ReportGenerated {
            report_id: "report-1".to_string(),
            period: "day".to_string(),
            total_jobs: 3,
        });
        bus.emit(analytics.clone()).ok();

        assert_eq!(stream.recv().await.unwrap(), analytics);
    }

    #[tokio::test]
    async fn test_event_stream_for_job() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe()).for_job("job-2");

        bus.emit(started("job-1")).ok();
        bus.emit(CoreEvent::Progress(ProgressEvent::Updated {
            job_id: "job-2".to_string(),
            progress: 0.5,
            current_step: "converting".to_string(),
            completed_steps: 1,
        }))
        .ok();

        let received = stream.recv().await.unwrap();
        assert_eq!(received.job_id(), Some("job-2"));
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.emit(started(&format!("job-{}", i))).ok();
        }

        assert!(matches!(sub.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_severity() {
        let failed = CoreEvent::Export(ExportLifecycleEvent::Failed {
            job_id: "job-1".to_string(),
            message: "disk full".to_string(),
        });
        assert_eq!(failed.severity(), EventSeverity::Error);

        let warning = CoreEvent::Progress(ProgressEvent::Warning {
            job_id: "job-1".to_string(),
            code: "precision_loss".to_string(),
            message: "coordinates rounded".to_string(),
            severity: EventSeverity::Warning,
        });
        assert_eq!(warning.severity(), EventSeverity::Warning);

        assert_eq!(started("job-1").severity(), EventSeverity::Debug);
        assert!(EventSeverity::Error > EventSeverity::Info);
    }

    #[test]
    fn test_event_serialization() {
        let event = CoreEvent::Export(ExportLifecycleEvent::Completed {
            job_id: "job-123".to_string(),
            file_size: 2048,
            duration_ms: 150,
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Export\""));
        assert!(json.contains("\"event\":\"Completed\""));

        let deserialized: CoreEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
    }

    #[tokio::test]
    async fn test_concurrent_publishers() {
        let bus = EventBus::new(100);
        let mut sub = bus.subscribe();

        let handles: Vec<_> = (0..2)
            .map(|n| {
                let bus = bus.clone();
                tokio::spawn(async move {
                    for i in 0..10 {
                        bus.emit(started(&format!("job-{}-{}", n, i))).ok();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.ok();
        }

        let mut count = 0;
        while sub.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 20);
    }
}
