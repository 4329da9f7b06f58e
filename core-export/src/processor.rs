//! # Format Converters & File Processors
//!
//! Pluggable collaborators that perform the actual export work:
//! - [`FormatConverter`] transforms raw application data into the target
//!   format. Optional per format; without one the data passes through.
//! - [`FileProcessor`] writes the result to the output path. Required per
//!   format.
//!
//! Both receive an [`ExportContext`] carrying the job ID, an advisory
//! cancellation token and a [`ProgressReporter`]. Cancellation is never
//! forced: long-running collaborators should poll
//! [`ExportContext::is_cancelled`] and return early.

use crate::progress::ProgressTracker;
use crate::{ExportFormat, ExportJobId, ExportQuality, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Settings handed to converters and processors
#[derive(Debug, Clone, PartialEq)]
pub struct ExportConfig {
    pub format: ExportFormat,
    pub quality: ExportQuality,
    /// Format-specific options from the job
    pub options: serde_json::Value,
}

/// Reports sub-step progress of one execution phase to the tracker
///
/// Fractions passed to [`report`](Self::report) are relative to the phase and
/// mapped into the phase's slice of the overall job progress.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: ExportJobId,
    tracker: Option<Arc<ProgressTracker>>,
    start: f64,
    end: f64,
    completed_steps: u32,
}

impl ProgressReporter {
    /// A reporter that discards everything
    pub fn detached(job_id: ExportJobId) -> Self {
        Self {
            job_id,
            tracker: None,
            start: 0.0,
            end: 1.0,
            completed_steps: 0,
        }
    }

    pub(crate) fn new(job_id: ExportJobId, tracker: Arc<ProgressTracker>) -> Self {
        Self {
            tracker: Some(tracker),
            ..Self::detached(job_id)
        }
    }

    /// Narrow the reporter to the `[start, end]` slice of overall progress
    pub(crate) fn phase(&self, start: f64, end: f64, completed_steps: u32) -> Self {
        Self {
            job_id: self.job_id,
            tracker: self.tracker.clone(),
            start,
            end,
            completed_steps,
        }
    }

    /// Overall ratio for a fraction of this phase
    pub fn overall(&self, fraction: f64) -> f64 {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.start + (self.end - self.start) * fraction
    }

    /// Report that `fraction` of the current phase is done
    ///
    /// Tracker errors (job not tracked, paused, ...) are logged and ignored.
    pub async fn report(&self, fraction: f64, step: &str) {
        let Some(tracker) = &self.tracker else {
            return;
        };

        if let Err(e) = tracker
            .update_progress(self.job_id, self.overall(fraction), step, self.completed_steps)
            .await
        {
            debug!(job_id = %self.job_id, error = %e, "Progress report ignored");
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .field("tracked", &self.tracker.is_some())
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

/// Per-execution context passed to collaborators
#[derive(Debug, Clone)]
pub struct ExportContext {
    pub job_id: ExportJobId,
    pub cancellation: CancellationToken,
    pub progress: ProgressReporter,
}

impl ExportContext {
    /// A context with a fresh token and no progress tracking
    pub fn new(job_id: ExportJobId) -> Self {
        Self {
            job_id,
            cancellation: CancellationToken::new(),
            progress: ProgressReporter::detached(job_id),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Transforms raw data into an export format
#[async_trait]
pub trait FormatConverter: Send + Sync {
    /// Convert `data` according to `config`
    ///
    /// # Errors
    ///
    /// Implementations should return `ExportError::Conversion` on failure and
    /// `ExportError::Cancelled` when they observe cancellation.
    async fn convert(&self, ctx: &ExportContext, data: Bytes, config: &ExportConfig)
        -> Result<Bytes>;

    /// Formats this converter can produce
    fn supported_formats(&self) -> Vec<ExportFormat>;
}

/// Writes converted data to its destination
#[async_trait]
pub trait FileProcessor: Send + Sync {
    /// Write `data` to `output_path`
    ///
    /// # Errors
    ///
    /// Implementations should return `ExportError::Processing` on failure.
    async fn process(
        &self,
        ctx: &ExportContext,
        data: Bytes,
        output_path: &Path,
        config: &ExportConfig,
    ) -> Result<()>;

    /// Formats this processor can write
    fn supported_formats(&self) -> Vec<ExportFormat>;
}
