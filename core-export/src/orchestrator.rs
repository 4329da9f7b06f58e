//! # Export Job Orchestrator
//!
//! Creates, executes and cancels export jobs.
//!
//! ## Overview
//!
//! The orchestrator owns the authoritative view of every job it created. It:
//! - Validates requests and persists new jobs through an [`ExportJobRepository`]
//! - Runs the registered [`FormatConverter`] (optional) and [`FileProcessor`]
//!   (required) for the job's format
//! - Mirrors execution into the [`ProgressTracker`] and records outcomes in the
//!   [`AnalyticsEngine`], when attached
//! - Keeps running statistics and emits lifecycle events on the [`EventBus`]
//!
//! ## Execution
//!
//! 1. Claim the job: `Pending → InProgress` as one compare-and-set under the
//!    job map's write lock. A second concurrent `execute_job` sees
//!    `InProgress` and fails with a state error.
//! 2. Prepare (5%), convert (up to 50%), write (up to 95%).
//! 3. Apply the terminal transition only if the job is still `InProgress`;
//!    a job cancelled mid-flight stays `Cancelled`.
//!
//! Conversion and processing failures do not surface as `Err`: the job is
//! marked `Failed` and the returned [`ExportResult`] carries the message.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let orchestrator = JobOrchestrator::new(repository, OrchestratorConfig::default())
//!     .with_tracker(tracker)
//!     .with_analytics(analytics);
//! orchestrator.register_processor(ExportFormat::Json, Arc::new(JsonWriter)).await;
//!
//! let request = ExportRequest::new(data, "/tmp/out.json", ExportFormat::Json, ExportQuality::Standard);
//! let job_id = orchestrator.create_job(request).await?;
//! let result = orchestrator.execute_job(job_id).await?;
//! assert!(result.success);
//! ```

use crate::analytics::AnalyticsEngine;
use crate::processor::{
    ExportConfig, ExportContext, FileProcessor, FormatConverter, ProgressReporter,
};
use crate::progress::ProgressTracker;
use crate::repository::ExportJobRepository;
use crate::{
    ExportError, ExportFormat, ExportJob, ExportJobId, ExportQuality, ExportRequest, ExportResult,
    JobStatus, Result,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use core_runtime::events::{CoreEvent, EventBus, ExportLifecycleEvent};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Steps reported to the progress tracker per execution
const EXECUTION_STEPS: u32 = 3;

// ============================================================================
// Configuration & Statistics
// ============================================================================

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Upper bound on one execution; `None` disables the limit
    pub execution_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Some(Duration::from_secs(3600)),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_execution_timeout(mut self, limit: Option<Duration>) -> Self {
        self.execution_timeout = limit;
        self
    }
}

/// Running statistics over executed jobs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportStatistics {
    /// Executions finished (any outcome)
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub cancelled_jobs: u64,
    pub format_usage: BTreeMap<ExportFormat, u64>,
    pub quality_usage: BTreeMap<ExportQuality, u64>,
    /// Running mean over executions
    pub average_duration_secs: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl ExportStatistics {
    fn record_execution(&mut self, job: &ExportJob) {
        self.total_jobs += 1;
        match job.status {
            JobStatus::Completed => self.completed_jobs += 1,
            JobStatus::Failed => self.failed_jobs += 1,
            _ => {}
        }
        *self.format_usage.entry(job.format).or_default() += 1;
        *self.quality_usage.entry(job.quality).or_default() += 1;

        let secs = job.duration.unwrap_or_default().as_secs_f64();
        self.average_duration_secs += (secs - self.average_duration_secs) / self.total_jobs as f64;
        self.last_updated = Some(Utc::now());
    }
}

/// Where a batch is in its sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStage {
    Starting,
    Finished,
}

/// Passed to the batch callback before and after each job
#[derive(Debug, Clone)]
pub struct BatchProgress {
    /// Zero-based position in the batch
    pub index: usize,
    pub total: usize,
    pub job_id: ExportJobId,
    pub stage: BatchStage,
    /// Present when `stage` is `Finished`
    pub result: Option<ExportResult>,
}

struct JobEntry {
    job: ExportJob,
    payload: Option<Bytes>,
    cancellation: CancellationToken,
}

impl JobEntry {
    fn new(job: ExportJob, payload: Option<Bytes>) -> Self {
        Self {
            job,
            payload,
            cancellation: CancellationToken::new(),
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Owns export jobs and drives their execution
pub struct JobOrchestrator {
    config: OrchestratorConfig,
    repository: Arc<dyn ExportJobRepository>,
    jobs: RwLock<HashMap<ExportJobId, JobEntry>>,
    converters: RwLock<HashMap<ExportFormat, Arc<dyn FormatConverter>>>,
    processors: RwLock<HashMap<ExportFormat, Arc<dyn FileProcessor>>>,
    statistics: RwLock<ExportStatistics>,
    active: AtomicUsize,
    tracker: Option<Arc<ProgressTracker>>,
    analytics: Option<Arc<AnalyticsEngine>>,
    event_bus: Option<EventBus>,
}

impl JobOrchestrator {
    pub fn new(repository: Arc<dyn ExportJobRepository>, config: OrchestratorConfig) -> Self {
        Self {
            config,
            repository,
            jobs: RwLock::new(HashMap::new()),
            converters: RwLock::new(HashMap::new()),
            processors: RwLock::new(HashMap::new()),
            statistics: RwLock::new(ExportStatistics::default()),
            active: AtomicUsize::new(0),
            tracker: None,
            analytics: None,
            event_bus: None,
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<ProgressTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_analytics(mut self, analytics: Arc<AnalyticsEngine>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn emit(&self, event: ExportLifecycleEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Export(event)).ok();
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a converter for one format, replacing any previous one
    pub async fn register_converter(&self, format: ExportFormat, converter: Arc<dyn FormatConverter>) {
        self.converters.write().await.insert(format, converter);
        info!(format = %format, "Registered format converter");
    }

    /// Register a processor for one format, replacing any previous one
    pub async fn register_processor(&self, format: ExportFormat, processor: Arc<dyn FileProcessor>) {
        self.processors.write().await.insert(format, processor);
        info!(format = %format, "Registered file processor");
    }

    /// Register `converter` for every format it reports
    pub async fn register_converter_for_all(&self, converter: Arc<dyn FormatConverter>) {
        for format in converter.supported_formats() {
            self.register_converter(format, Arc::clone(&converter)).await;
        }
    }

    /// Register `processor` for every format it reports
    pub async fn register_processor_for_all(&self, processor: Arc<dyn FileProcessor>) {
        for format in processor.supported_formats() {
            self.register_processor(format, Arc::clone(&processor)).await;
        }
    }

    /// Formats that currently have a file processor
    pub async fn processor_formats(&self) -> Vec<ExportFormat> {
        let mut formats: Vec<ExportFormat> = self.processors.read().await.keys().copied().collect();
        formats.sort();
        formats
    }

    // ========================================================================
    // Job Lifecycle
    // ========================================================================

    /// Validate and persist a new pending job
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty output path or non-object options;
    /// nothing is persisted in that case.
    #[instrument(skip(self, request), fields(format = %request.format, quality = %request.quality))]
    pub async fn create_job(&self, request: ExportRequest) -> Result<ExportJobId> {
        let output_path = request.output_path.trim();
        if output_path.is_empty() {
            return Err(ExportError::validation(
                "output_path",
                "output path must not be empty",
            ));
        }

        let options = match request.options {
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            options @ serde_json::Value::Object(_) => options,
            other => {
                return Err(ExportError::validation(
                    "options",
                    format!("options must be a JSON object, got {}", other),
                ))
            }
        };

        let mut job =
            ExportJob::new(request.format, request.quality, output_path).with_options(options);
        job.user_id = request.user_id;
        let job_id = job.id;

        self.repository.insert(&job).await?;
        self.jobs
            .write()
            .await
            .insert(job_id, JobEntry::new(job, Some(request.data)));

        info!(job_id = %job_id, "Export job created");
        self.emit(ExportLifecycleEvent::Created {
            job_id: job_id.to_string(),
            format: request.format.as_str().to_string(),
            quality: request.quality.as_str().to_string(),
        });

        Ok(job_id)
    }

    /// Execute a pending job to completion
    ///
    /// # Errors
    ///
    /// - `JobNotFound` if the job is unknown
    /// - `InvalidStateTransition` if the job is not pending
    ///
    /// Failures during conversion or writing are reported through the
    /// returned [`ExportResult`], not as `Err`.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn execute_job(&self, job_id: ExportJobId) -> Result<ExportResult> {
        self.ensure_cached(job_id).await?;

        let (job, payload, cancellation) = {
            let mut jobs = self.jobs.write().await;
            let entry = jobs.get_mut(&job_id).ok_or_else(|| ExportError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
            let started = entry.job.clone().start()?;
            entry.job = started.clone();
            (started, entry.payload.clone(), entry.cancellation.clone())
        };

        self.persist(&job).await;
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.record_active(active).await;
        info!(format = %job.format, quality = %job.quality, "Export started");
        self.emit(ExportLifecycleEvent::Started {
            job_id: job_id.to_string(),
            format: job.format.as_str().to_string(),
        });

        let ctx = ExportContext {
            job_id,
            cancellation: cancellation.clone(),
            progress: self.reporter(job_id).await,
        };

        let pipeline = self.run_pipeline(&job, payload, &ctx);
        let outcome = match self.config.execution_timeout {
            Some(limit) => match timeout(limit, pipeline).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    cancellation.cancel();
                    Err(ExportError::Timeout(limit))
                }
            },
            None => pipeline.await,
        };

        let finished = self.finish(job, &outcome).await;
        let active = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.record_active(active).await;

        self.persist(&finished).await;
        self.statistics.write().await.record_execution(&finished);

        let result = ExportResult::from_job(&finished);
        self.report_outcome(&finished, &result, outcome.err()).await;

        Ok(result)
    }

    /// Cancel a pending or in-progress job
    ///
    /// In-flight collaborators are signalled through the job's cancellation
    /// token but not interrupted.
    ///
    /// # Errors
    ///
    /// - `JobNotFound` if the job is unknown
    /// - `InvalidStateTransition` if the job is already terminal; the job is
    ///   left unchanged
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn cancel_job(&self, job_id: ExportJobId) -> Result<ExportJob> {
        self.ensure_cached(job_id).await?;

        let cancelled = {
            let mut jobs = self.jobs.write().await;
            let entry = jobs.get_mut(&job_id).ok_or_else(|| ExportError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
            let cancelled = entry.job.clone().cancel()?;
            entry.job = cancelled.clone();
            entry.payload = None;
            entry.cancellation.cancel();
            cancelled
        };

        self.persist(&cancelled).await;
        self.statistics.write().await.cancelled_jobs += 1;

        if let Some(tracker) = &self.tracker {
            if let Err(e) = tracker.cancel_job(job_id).await {
                debug!(error = %e, "Tracker not updated on cancel");
            }
        }

        info!("Export job cancelled");
        self.emit(ExportLifecycleEvent::Cancelled {
            job_id: job_id.to_string(),
        });

        Ok(cancelled)
    }

    /// Execute jobs one after another
    ///
    /// `on_progress` is called before and after each job. A job that cannot
    /// run (unknown, not pending) yields a failed result and the batch
    /// continues.
    #[instrument(skip(self, job_ids, on_progress), fields(jobs = job_ids.len()))]
    pub async fn batch_export<F>(&self, job_ids: &[ExportJobId], mut on_progress: F) -> Vec<ExportResult>
    where
        F: FnMut(BatchProgress),
    {
        let total = job_ids.len();
        let mut results = Vec::with_capacity(total);

        for (index, job_id) in job_ids.iter().copied().enumerate() {
            on_progress(BatchProgress {
                index,
                total,
                job_id,
                stage: BatchStage::Starting,
                result: None,
            });

            let result = match self.execute_job(job_id).await {
                Ok(result) => {
                    if !result.success {
                        warn!(job_id = %job_id, error = ?result.error, "Batch job failed");
                    }
                    result
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Batch job could not be executed");
                    ExportResult::rejected(job_id, e.to_string())
                }
            };

            on_progress(BatchProgress {
                index,
                total,
                job_id,
                stage: BatchStage::Finished,
                result: Some(result.clone()),
            });
            results.push(result);
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        info!(total, succeeded, "Batch export finished");
        results
    }

    /// Delete terminal jobs that finished more than `max_age` ago
    ///
    /// Returns the number of jobs removed from storage and cache.
    #[instrument(skip(self))]
    pub async fn cleanup_completed_jobs(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| ExportError::validation("max_age", e.to_string()))?;
        let cutoff = Utc::now() - max_age;

        let mut expired: Vec<ExportJobId> = self
            .repository
            .find_older_than(cutoff)
            .await?
            .into_iter()
            .map(|job| job.id)
            .collect();
        {
            let jobs = self.jobs.read().await;
            for (job_id, entry) in jobs.iter() {
                if entry.job.finished_before(cutoff) && !expired.contains(job_id) {
                    expired.push(*job_id);
                }
            }
        }

        let mut removed = 0;
        for job_id in expired {
            match self.repository.delete(&job_id).await {
                Ok(()) | Err(ExportError::JobNotFound { .. }) => {}
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Failed to delete export job");
                    continue;
                }
            }
            self.jobs.write().await.remove(&job_id);
            removed += 1;
        }

        if removed > 0 {
            info!(removed, "Cleaned up finished export jobs");
        }
        Ok(removed)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Look up a job in the cache, falling back to storage
    pub async fn get_job(&self, job_id: ExportJobId) -> Result<ExportJob> {
        if let Some(entry) = self.jobs.read().await.get(&job_id) {
            return Ok(entry.job.clone());
        }

        self.repository
            .find_by_id(&job_id)
            .await?
            .ok_or_else(|| ExportError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Jobs with `status`, newest first; cached state wins over storage
    pub async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<ExportJob>> {
        let mut found: HashMap<ExportJobId, ExportJob> = self
            .repository
            .find_by_status(status)
            .await?
            .into_iter()
            .map(|job| (job.id, job))
            .collect();

        for (job_id, entry) in self.jobs.read().await.iter() {
            if entry.job.status == status {
                found.insert(*job_id, entry.job.clone());
            } else {
                found.remove(job_id);
            }
        }

        let mut jobs: Vec<ExportJob> = found.into_values().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    /// Cached jobs, newest first
    pub async fn list_jobs(&self) -> Vec<ExportJob> {
        let mut jobs: Vec<ExportJob> = self
            .jobs
            .read()
            .await
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub async fn get_statistics(&self) -> ExportStatistics {
        self.statistics.read().await.clone()
    }

    pub fn supported_formats(&self) -> Vec<ExportFormat> {
        ExportFormat::ALL.to_vec()
    }

    pub fn supported_qualities(&self) -> Vec<ExportQuality> {
        ExportQuality::ALL.to_vec()
    }

    /// Jobs currently executing
    pub fn active_job_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Load a job from storage into the cache (without payload) if needed
    async fn ensure_cached(&self, job_id: ExportJobId) -> Result<()> {
        if self.jobs.read().await.contains_key(&job_id) {
            return Ok(());
        }

        let job = self
            .repository
            .find_by_id(&job_id)
            .await?
            .ok_or_else(|| ExportError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        self.jobs
            .write()
            .await
            .entry(job_id)
            .or_insert_with(|| JobEntry::new(job, None));
        Ok(())
    }

    async fn persist(&self, job: &ExportJob) {
        if let Err(e) = self.repository.update(job).await {
            error!(job_id = %job.id, status = %job.status, error = %e, "Failed to persist export job");
        }
    }

    async fn record_active(&self, active: usize) {
        if let Some(analytics) = &self.analytics {
            if let Err(e) = analytics.record_active_jobs(active).await {
                debug!(error = %e, "Active job gauge not recorded");
            }
        }
    }

    async fn reporter(&self, job_id: ExportJobId) -> ProgressReporter {
        let Some(tracker) = &self.tracker else {
            return ProgressReporter::detached(job_id);
        };

        if let Err(e) = tracker.start_tracking(job_id, EXECUTION_STEPS).await {
            debug!(error = %e, "Progress tracking not started");
        }
        ProgressReporter::new(job_id, Arc::clone(tracker))
    }

    async fn run_pipeline(
        &self,
        job: &ExportJob,
        payload: Option<Bytes>,
        ctx: &ExportContext,
    ) -> Result<u64> {
        let data = payload.ok_or_else(|| {
            ExportError::Processing(
                "job payload is not available; jobs loaded from storage cannot be executed"
                    .to_string(),
            )
        })?;
        let config = ExportConfig {
            format: job.format,
            quality: job.quality,
            options: job.options.clone(),
        };

        ctx.progress.phase(0.0, 0.05, 0).report(1.0, "preparing").await;

        let converter = self.converters.read().await.get(&job.format).cloned();
        let processor = self
            .processors
            .read()
            .await
            .get(&job.format)
            .cloned()
            .ok_or_else(|| ExportError::NoProcessor {
                format: job.format.as_str().to_string(),
            })?;

        let data = match converter {
            Some(converter) => {
                ensure_not_cancelled(ctx)?;
                let phase = ctx.phased(0.05, 0.5, 1);
                let converted = converter.convert(&phase, data, &config).await?;
                phase.progress.report(1.0, "converted").await;
                debug!(input_bytes = converted.len(), "Conversion finished");
                converted
            }
            None => data,
        };

        ensure_not_cancelled(ctx)?;
        let phase = ctx.phased(0.5, 0.95, 2);
        let output_path = Path::new(&job.output_path);
        processor
            .process(&phase, data.clone(), output_path, &config)
            .await?;
        phase.progress.report(1.0, "written").await;

        let file_size = match tokio::fs::metadata(output_path).await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => data.len() as u64,
        };
        Ok(file_size)
    }

    /// Apply the terminal transition if the job is still in progress
    async fn finish(&self, started: ExportJob, outcome: &Result<u64>) -> ExportJob {
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get(&started.id)
            .map(|entry| entry.job.clone())
            .unwrap_or(started);

        if current.status != JobStatus::InProgress {
            return current;
        }

        let transitioned = match outcome {
            Ok(file_size) => current.clone().complete(*file_size),
            Err(e) => current.clone().fail(e.to_string()),
        };
        let finished = match transitioned {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %current.id, error = %e, "Terminal transition rejected");
                return current;
            }
        };

        if let Some(entry) = jobs.get_mut(&finished.id) {
            entry.job = finished.clone();
            entry.payload = None;
        }
        finished
    }

    async fn report_outcome(
        &self,
        job: &ExportJob,
        result: &ExportResult,
        error: Option<ExportError>,
    ) {
        let duration = job.duration.unwrap_or_default();

        match job.status {
            JobStatus::Completed => {
                info!(
                    file_size = job.file_size.unwrap_or(0),
                    duration_ms = duration.as_millis() as u64,
                    "Export completed"
                );
                if let Some(tracker) = &self.tracker {
                    tracker.complete_job(job.id).await.ok();
                }
                if let Some(analytics) = &self.analytics {
                    if let Err(e) = analytics.record_job_completion(job, result, duration).await {
                        warn!(error = %e, "Failed to record job completion");
                    }
                }
                self.emit(ExportLifecycleEvent::Completed {
                    job_id: job.id.to_string(),
                    file_size: job.file_size.unwrap_or(0),
                    duration_ms: duration.as_millis() as u64,
                });
            }
            JobStatus::Failed => {
                let error = error.unwrap_or_else(|| {
                    ExportError::Processing(job.error_message.clone().unwrap_or_default())
                });
                warn!(error = %error, error_type = error.error_type(), "Export failed");
                if let Some(tracker) = &self.tracker {
                    tracker.fail_job(job.id, error.to_string()).await.ok();
                }
                if let Some(analytics) = &self.analytics {
                    if let Err(e) = analytics.record_job_failure(job, &error, duration).await {
                        warn!(error = %e, "Failed to record job failure");
                    }
                }
                self.emit(ExportLifecycleEvent::Failed {
                    job_id: job.id.to_string(),
                    message: error.to_string(),
                });
            }
            _ => {
                info!(status = %job.status, "Export ended without completing");
            }
        }
    }
}

impl ExportContext {
    /// Same job and token, progress narrowed to one phase
    fn phased(&self, start: f64, end: f64, completed_steps: u32) -> ExportContext {
        ExportContext {
            job_id: self.job_id,
            cancellation: self.cancellation.clone(),
            progress: self.progress.phase(start, end, completed_steps),
        }
    }
}

fn ensure_not_cancelled(ctx: &ExportContext) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(ExportError::Cancelled);
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
