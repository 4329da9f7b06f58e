//! # Progress Tracker
//!
//! Owns one progress session per tracked job: a small state machine, an
//! append-only audit log, warnings and subscriber queues.
//!
//! ## State Machine
//!
//! ```text
//! Pending ──start/update──> Running ──update(1.0)/complete──> Completed
//!    │                       │  ▲
//!    │                 pause │  │ resume
//!    │                       ▼  │
//!    │                      Paused
//!    └─────── fail / cancel (from any live state) ──────────> Failed | Cancelled
//! ```
//!
//! All sessions sit behind a single `RwLock`. Subscribers receive snapshots
//! through bounded queues (see [`subscriber`](super::subscriber)).

use super::subscriber::{spawn_callback_drain, Callback, SubscriberSet};
use super::types::{
    EventType, ExportEvent, ExportProgress, ExportWarning, ProgressStatus, TrackerConfig,
    TrackerMetrics,
};
use crate::{ExportError, ExportJobId, Result};
use chrono::{DateTime, Utc};
use core_runtime::events::{CoreEvent, EventBus, EventSeverity, ProgressEvent};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

struct Session {
    progress: ExportProgress,
    events: Vec<ExportEvent>,
}

struct Subscriptions {
    progress: SubscriberSet<ExportProgress>,
    events: SubscriberSet<ExportEvent>,
    created_at: DateTime<Utc>,
}

impl Subscriptions {
    fn new() -> Self {
        Self {
            progress: SubscriberSet::new(),
            events: SubscriberSet::new(),
            created_at: Utc::now(),
        }
    }

    fn len(&self) -> usize {
        self.progress.len() + self.events.len()
    }
}

#[derive(Default)]
struct TrackerState {
    sessions: HashMap<ExportJobId, Session>,
    subscriptions: HashMap<ExportJobId, Subscriptions>,
    /// Cumulative counters; live gauges are computed on read
    counters: TrackerMetrics,
}

impl TrackerState {
    fn session_mut(&mut self, job_id: &ExportJobId) -> Result<&mut Session> {
        self.sessions
            .get_mut(job_id)
            .ok_or_else(|| ExportError::NotTracked {
                job_id: job_id.to_string(),
            })
    }

    fn append_event(
        &mut self,
        job_id: ExportJobId,
        event_type: EventType,
        severity: EventSeverity,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        let event = ExportEvent {
            job_id,
            event_type,
            message: message.into(),
            timestamp: Utc::now(),
            severity,
            data,
        };

        if let Some(subs) = self.subscriptions.get_mut(&job_id) {
            self.counters.dropped_notifications += subs.events.publish(&event);
        }
        if let Some(session) = self.sessions.get_mut(&job_id) {
            session.events.push(event);
            self.counters.total_events += 1;
        }
    }

    fn notify_progress(&mut self, job_id: &ExportJobId) -> Option<ExportProgress> {
        let snapshot = self.sessions.get(job_id)?.progress.clone();
        if let Some(subs) = self.subscriptions.get_mut(job_id) {
            self.counters.dropped_notifications += subs.progress.publish(&snapshot);
        }
        Some(snapshot)
    }

    fn count_terminal(&mut self, status: ProgressStatus) {
        match status {
            ProgressStatus::Completed => self.counters.completed_jobs += 1,
            ProgressStatus::Failed => self.counters.failed_jobs += 1,
            ProgressStatus::Cancelled => self.counters.cancelled_jobs += 1,
            _ => {}
        }
    }
}

/// In-memory progress tracking for export jobs
pub struct ProgressTracker {
    config: TrackerConfig,
    state: RwLock<TrackerState>,
    callback_failures: Arc<AtomicU64>,
    event_bus: Option<EventBus>,
}

impl ProgressTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(TrackerState::default()),
            callback_failures: Arc::new(AtomicU64::new(0)),
            event_bus: None,
        }
    }

    /// Mirror progress changes onto `bus` as [`CoreEvent::Progress`]
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Progress(event)).ok();
        }
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Begin tracking a job
    ///
    /// # Errors
    ///
    /// Returns `AlreadyTracked` if a session exists for `job_id`; the existing
    /// session is left untouched.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn start_tracking(&self, job_id: ExportJobId, total_steps: u32) -> Result<()> {
        let mut state = self.state.write().await;
        if state.sessions.contains_key(&job_id) {
            return Err(ExportError::AlreadyTracked {
                job_id: job_id.to_string(),
            });
        }

        state.sessions.insert(
            job_id,
            Session {
                progress: ExportProgress::new(job_id, total_steps, Utc::now()),
                events: Vec::new(),
            },
        );
        state.counters.total_tracked += 1;
        state.append_event(
            job_id,
            EventType::JobStarted,
            EventSeverity::Info,
            "Tracking started",
            json!({ "total_steps": total_steps }),
        );
        state.notify_progress(&job_id);
        drop(state);

        info!(total_steps, "Progress tracking started");
        self.emit(ProgressEvent::TrackingStarted {
            job_id: job_id.to_string(),
            total_steps,
        });

        Ok(())
    }

    /// Record progress for a job
    ///
    /// `ratio` is clamped into `[0, 1]`. The first update moves a pending
    /// session to running; a ratio of 1 completes it.
    ///
    /// # Errors
    ///
    /// - `NotTracked` if no session exists
    /// - `Validation` if `ratio` is NaN or infinite
    /// - `InvalidStateTransition` if the session is paused or terminal
    #[instrument(skip(self, step), fields(job_id = %job_id))]
    pub async fn update_progress(
        &self,
        job_id: ExportJobId,
        ratio: f64,
        step: impl Into<String>,
        completed_steps: u32,
    ) -> Result<ExportProgress> {
        if !ratio.is_finite() {
            return Err(ExportError::validation(
                "progress",
                format!("ratio must be finite, got {}", ratio),
            ));
        }
        let ratio = ratio.clamp(0.0, 1.0);
        let step = step.into();

        let mut state = self.state.write().await;
        let session = state.session_mut(&job_id)?;
        let from = session.progress.status;

        if from == ProgressStatus::Paused || from.is_terminal() {
            return Err(ExportError::InvalidStateTransition {
                job_id: job_id.to_string(),
                from: from.as_str().to_string(),
                to: ProgressStatus::Running.as_str().to_string(),
                reason: format!("Cannot update progress of a {} job", from.as_str()),
            });
        }

        let now = Utc::now();
        let progress = &mut session.progress;
        progress.progress = ratio;
        progress.current_step = step.clone();
        progress.completed_steps = completed_steps;
        progress.last_update = now;
        progress.estimated_end = estimate_end(progress.start_time, now, ratio);
        if from == ProgressStatus::Pending {
            progress.status = ProgressStatus::Running;
        }
        let completed = ratio >= 1.0;
        if completed {
            progress.status = ProgressStatus::Completed;
            progress.completed_steps = progress.completed_steps.max(progress.total_steps);
        }
        let completed_steps = progress.completed_steps;

        state.append_event(
            job_id,
            EventType::Progress,
            EventSeverity::Debug,
            format!("{:.0}% - {}", ratio * 100.0, step),
            json!({
                "progress": ratio,
                "current_step": step,
                "completed_steps": completed_steps,
            }),
        );
        if completed {
            state.count_terminal(ProgressStatus::Completed);
            state.append_event(
                job_id,
                EventType::JobCompleted,
                EventSeverity::Info,
                "Job completed",
                serde_json::Value::Null,
            );
        }
        let snapshot = state.notify_progress(&job_id);
        drop(state);

        debug!(progress = ratio, step = %step, "Progress updated");
        self.emit(ProgressEvent::Updated {
            job_id: job_id.to_string(),
            progress: ratio,
            current_step: step,
            completed_steps,
        });
        let to = if completed {
            ProgressStatus::Completed
        } else {
            ProgressStatus::Running
        };
        if to != from {
            self.emit_status_change(&job_id, from, to);
        }

        snapshot.ok_or_else(|| ExportError::NotTracked {
            job_id: job_id.to_string(),
        })
    }

    /// Mark a job completed with full progress
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn complete_job(&self, job_id: ExportJobId) -> Result<ExportProgress> {
        self.transition(
            job_id,
            ProgressStatus::Completed,
            EventType::JobCompleted,
            EventSeverity::Info,
            "Job completed".to_string(),
            |progress, now| {
                progress.progress = 1.0;
                progress.completed_steps = progress.total_steps;
                progress.estimated_end = Some(now);
            },
        )
        .await
    }

    /// Mark a job failed, keeping its last reported progress
    #[instrument(skip(self, error), fields(job_id = %job_id))]
    pub async fn fail_job(
        &self,
        job_id: ExportJobId,
        error: impl Into<String>,
    ) -> Result<ExportProgress> {
        let error = error.into();
        let message = format!("Job failed: {}", error);
        self.transition(
            job_id,
            ProgressStatus::Failed,
            EventType::JobFailed,
            EventSeverity::Error,
            message,
            move |progress, _| progress.error = Some(error),
        )
        .await
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn cancel_job(&self, job_id: ExportJobId) -> Result<ExportProgress> {
        self.transition(
            job_id,
            ProgressStatus::Cancelled,
            EventType::JobCancelled,
            EventSeverity::Warning,
            "Job cancelled".to_string(),
            |_, _| {},
        )
        .await
    }

    /// Pause a running job; `update_progress` is rejected until resumed
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn pause_job(&self, job_id: ExportJobId) -> Result<ExportProgress> {
        self.transition(
            job_id,
            ProgressStatus::Paused,
            EventType::JobPaused,
            EventSeverity::Info,
            "Job paused".to_string(),
            |progress, _| progress.estimated_end = None,
        )
        .await
    }

    /// Resume a paused job
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` unless the session is paused
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn resume_job(&self, job_id: ExportJobId) -> Result<ExportProgress> {
        self.transition(
            job_id,
            ProgressStatus::Running,
            EventType::JobResumed,
            EventSeverity::Info,
            "Job resumed".to_string(),
            |progress, now| {
                progress.estimated_end = estimate_end(progress.start_time, now, progress.progress)
            },
        )
        .await
    }

    async fn transition<F>(
        &self,
        job_id: ExportJobId,
        to: ProgressStatus,
        event_type: EventType,
        severity: EventSeverity,
        message: String,
        mutate: F,
    ) -> Result<ExportProgress>
    where
        F: FnOnce(&mut ExportProgress, DateTime<Utc>),
    {
        let mut state = self.state.write().await;
        let session = state.session_mut(&job_id)?;
        let from = session.progress.status;

        // Resume is the only way back to Running through this path.
        if to == ProgressStatus::Running && from != ProgressStatus::Paused {
            return Err(ExportError::InvalidStateTransition {
                job_id: job_id.to_string(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: "Only paused jobs can be resumed".to_string(),
            });
        }
        from.check_transition(&job_id, to)?;

        let now = Utc::now();
        session.progress.status = to;
        session.progress.last_update = now;
        mutate(&mut session.progress, now);

        state.count_terminal(to);
        state.append_event(
            job_id,
            event_type,
            severity,
            message,
            json!({ "from": from.as_str(), "to": to.as_str() }),
        );
        let snapshot = state.notify_progress(&job_id);
        drop(state);

        match to {
            ProgressStatus::Failed => warn!(from = %from, "Tracked job failed"),
            _ => info!(from = %from, to = %to, "Tracked status changed"),
        }
        self.emit_status_change(&job_id, from, to);

        snapshot.ok_or_else(|| ExportError::NotTracked {
            job_id: job_id.to_string(),
        })
    }

    fn emit_status_change(&self, job_id: &ExportJobId, from: ProgressStatus, to: ProgressStatus) {
        self.emit(ProgressEvent::StatusChanged {
            job_id: job_id.to_string(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }

    /// Attach a warning without changing status
    ///
    /// # Errors
    ///
    /// Returns `NotTracked` if no session exists; nothing is created.
    #[instrument(skip(self, code, message), fields(job_id = %job_id))]
    pub async fn add_warning(
        &self,
        job_id: ExportJobId,
        code: impl Into<String>,
        message: impl Into<String>,
        severity: EventSeverity,
    ) -> Result<()> {
        let code = code.into();
        let message = message.into();

        let mut state = self.state.write().await;
        let session = state.session_mut(&job_id)?;
        let now = Utc::now();
        session.progress.warnings.push(ExportWarning {
            code: code.clone(),
            message: message.clone(),
            severity,
            timestamp: now,
        });
        session.progress.last_update = now;

        state.counters.total_warnings += 1;
        state.append_event(
            job_id,
            EventType::Warning,
            severity,
            message.clone(),
            json!({ "code": code }),
        );
        state.notify_progress(&job_id);
        drop(state);

        warn!(code = %code, severity = %severity, "Export warning: {}", message);
        self.emit(ProgressEvent::Warning {
            job_id: job_id.to_string(),
            code,
            message,
            severity,
        });

        Ok(())
    }

    /// Remove all tracking state for a job and close its subscriber queues
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn stop_tracking(&self, job_id: ExportJobId) -> Result<()> {
        let mut state = self.state.write().await;
        if state.sessions.remove(&job_id).is_none() {
            return Err(ExportError::NotTracked {
                job_id: job_id.to_string(),
            });
        }
        state.subscriptions.remove(&job_id);

        debug!("Progress tracking stopped");
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get_progress(&self, job_id: ExportJobId) -> Result<ExportProgress> {
        self.state
            .read()
            .await
            .sessions
            .get(&job_id)
            .map(|session| session.progress.clone())
            .ok_or_else(|| ExportError::NotTracked {
                job_id: job_id.to_string(),
            })
    }

    /// Audit trail of a job, oldest first
    pub async fn get_events(&self, job_id: ExportJobId) -> Result<Vec<ExportEvent>> {
        self.state
            .read()
            .await
            .sessions
            .get(&job_id)
            .map(|session| session.events.clone())
            .ok_or_else(|| ExportError::NotTracked {
                job_id: job_id.to_string(),
            })
    }

    pub async fn get_all_progress(&self) -> Vec<ExportProgress> {
        let state = self.state.read().await;
        let mut all: Vec<ExportProgress> = state
            .sessions
            .values()
            .map(|session| session.progress.clone())
            .collect();
        all.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        all
    }

    pub async fn get_metrics(&self) -> TrackerMetrics {
        let state = self.state.read().await;
        let mut metrics = state.counters.clone();
        metrics.active_jobs = state
            .sessions
            .values()
            .filter(|session| session.progress.status.is_active())
            .count() as u64;
        metrics.paused_jobs = state
            .sessions
            .values()
            .filter(|session| session.progress.status == ProgressStatus::Paused)
            .count() as u64;
        metrics.active_subscribers = state
            .subscriptions
            .values()
            .map(|subs| subs.len() as u64)
            .sum();
        metrics.callback_failures = self.callback_failures.load(Ordering::Relaxed);
        metrics
    }

    pub async fn is_tracked(&self, job_id: ExportJobId) -> bool {
        self.state.read().await.sessions.contains_key(&job_id)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Receive a progress snapshot after every change to `job_id`
    ///
    /// May be called before tracking starts. If the job is still untracked
    /// once the retention period has passed, the queue is closed by
    /// [`cleanup_expired`](Self::cleanup_expired). The queue is bounded by
    /// `subscriber_queue_capacity`; when it is full, snapshots are dropped
    /// for this subscriber and counted in `dropped_notifications`.
    pub async fn subscribe_progress(&self, job_id: ExportJobId) -> mpsc::Receiver<ExportProgress> {
        let capacity = self.config.subscriber_queue_capacity;
        self.state
            .write()
            .await
            .subscriptions
            .entry(job_id)
            .or_insert_with(Subscriptions::new)
            .progress
            .subscribe(capacity)
    }

    /// Receive every audit event appended for `job_id`
    pub async fn subscribe_events(&self, job_id: ExportJobId) -> mpsc::Receiver<ExportEvent> {
        let capacity = self.config.subscriber_queue_capacity;
        self.state
            .write()
            .await
            .subscriptions
            .entry(job_id)
            .or_insert_with(Subscriptions::new)
            .events
            .subscribe(capacity)
    }

    /// Invoke `callback` for every progress snapshot of `job_id`
    ///
    /// The callback runs on its own task, in delivery order. The task ends
    /// when tracking of the job stops.
    pub async fn register_progress_callback<F>(
        &self,
        job_id: ExportJobId,
        callback: F,
    ) -> JoinHandle<()>
    where
        F: Fn(ExportProgress) + Send + Sync + 'static,
    {
        let rx = self.subscribe_progress(job_id).await;
        let callback: Callback<ExportProgress> = Arc::new(callback);
        spawn_callback_drain(rx, callback, Arc::clone(&self.callback_failures))
    }

    /// Invoke `callback` for every audit event of `job_id`
    pub async fn register_event_callback<F>(&self, job_id: ExportJobId, callback: F) -> JoinHandle<()>
    where
        F: Fn(ExportEvent) + Send + Sync + 'static,
    {
        let rx = self.subscribe_events(job_id).await;
        let callback: Callback<ExportEvent> = Arc::new(callback);
        spawn_callback_drain(rx, callback, Arc::clone(&self.callback_failures))
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// Remove terminal sessions whose last update is older than the retention
    /// period relative to `now`. Returns the number removed.
    ///
    /// Subscriptions for jobs that never started tracking are closed once
    /// they are older than the retention period, which ends their callback
    /// tasks.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.retention_period)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = now - retention;

        let mut state = self.state.write().await;
        let expired: Vec<ExportJobId> = state
            .sessions
            .iter()
            .filter(|(_, session)| {
                session.progress.status.is_terminal() && session.progress.last_update < cutoff
            })
            .map(|(job_id, _)| *job_id)
            .collect();

        for job_id in &expired {
            state.sessions.remove(job_id);
            state.subscriptions.remove(job_id);
        }
        let TrackerState {
            sessions,
            subscriptions,
            counters,
        } = &mut *state;
        let before = subscriptions.len();
        subscriptions.retain(|job_id, subs| {
            if sessions.contains_key(job_id) {
                return true;
            }
            if subs.created_at < cutoff {
                return false;
            }
            !(subs.progress.prune() & subs.events.prune())
        });
        counters.expired_sessions += expired.len() as u64;

        let closed = before - subscriptions.len();
        if closed > 0 {
            debug!(closed, "Closed subscriptions of untracked jobs");
        }

        expired.len()
    }

    /// Periodically run [`cleanup_expired`](Self::cleanup_expired) until `cancel` fires
    pub async fn run_retention(&self, cancel: CancellationToken) {
        let period = self
            .config
            .retention_period
            .max(std::time::Duration::from_millis(1));
        info!(
            interval_secs = period.as_secs(),
            "Progress retention job started"
        );

        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Progress retention job stopping");
                    break;
                }
                _ = interval.tick() => {
                    let removed = self.cleanup_expired(Utc::now()).await;
                    if removed > 0 {
                        info!(removed, "Progress retention: removed expired sessions");
                    } else {
                        debug!("Progress retention: nothing to remove");
                    }
                }
            }
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

fn estimate_end(start: DateTime<Utc>, now: DateTime<Utc>, ratio: f64) -> Option<DateTime<Utc>> {
    if ratio <= 0.0 {
        return None;
    }
    let elapsed_ms = (now - start).num_milliseconds().max(0) as f64;
    let total_ms = elapsed_ms / ratio;
    // Beyond i64 milliseconds the cast saturates and the date arithmetic overflows.
    let estimate = if total_ms.is_finite() && total_ms < i64::MAX as f64 {
        chrono::Duration::try_milliseconds(total_ms as i64)
            .and_then(|total| start.checked_add_signed(total))
    } else {
        None
    };
    if estimate.is_none() {
        debug!(ratio, elapsed_ms, "Completion estimate out of range");
    }
    estimate
}
