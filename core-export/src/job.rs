//! # Export Job State Machine
//!
//! Manages the lifecycle of export jobs with validated state transitions.
//!
//! ## Overview
//!
//! An export job converts application data into a requested file format at a
//! requested quality level. Jobs are created `Pending`, move to `InProgress`
//! when execution begins, and end in exactly one terminal state.
//!
//! ## State Machine
//!
//! ```text
//! Pending → InProgress → Completed
//!    │          │
//!    │          ├──────→ Failed
//!    ├──────────┼──────→ Failed
//!    └──────────┴──────→ Cancelled
//! ```
//!
//! Terminal states (`Completed`, `Failed`, `Cancelled`) never transition again,
//! so a cancelled job can never later become completed.
//!
//! ## Usage
//!
//! ```rust
//! use core_export::{ExportFormat, ExportJob, ExportQuality, JobStatus};
//!
//! let job = ExportJob::new(ExportFormat::Json, ExportQuality::Standard, "/tmp/out.json");
//! let job = job.start().unwrap();
//! let job = job.complete(1024).unwrap();
//!
//! assert_eq!(job.status, JobStatus::Completed);
//! assert_eq!(job.progress, 100);
//! ```

use crate::{ExportError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for an export job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExportJobId(Uuid);

impl ExportJobId {
    /// Create a new random export job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an export job ID from a string
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID
    pub fn from_string(s: &str) -> Result<Self> {
        Ok(Self(
            Uuid::parse_str(s).map_err(|e| ExportError::InvalidJobId(e.to_string()))?,
        ))
    }

    /// Get the string representation of this ID
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ExportJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExportJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ExportJobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<ExportJobId> for Uuid {
    fn from(id: ExportJobId) -> Self {
        id.0
    }
}

// ============================================================================
// Format & Quality
// ============================================================================

/// Output formats an export job can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    IfcLite,
    Gltf,
    AsciiBim,
    Excel,
    Parquet,
    Geojson,
    Json,
    Xml,
    Csv,
    Pdf,
    Dxf,
    Step,
    Iges,
}

impl ExportFormat {
    /// Every supported format, in declaration order
    pub const ALL: [ExportFormat; 13] = [
        ExportFormat::IfcLite,
        ExportFormat::Gltf,
        ExportFormat::AsciiBim,
        ExportFormat::Excel,
        ExportFormat::Parquet,
        ExportFormat::Geojson,
        ExportFormat::Json,
        ExportFormat::Xml,
        ExportFormat::Csv,
        ExportFormat::Pdf,
        ExportFormat::Dxf,
        ExportFormat::Step,
        ExportFormat::Iges,
    ];

    /// Get the string representation for storage and metric names
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::IfcLite => "ifc_lite",
            ExportFormat::Gltf => "gltf",
            ExportFormat::AsciiBim => "ascii_bim",
            ExportFormat::Excel => "excel",
            ExportFormat::Parquet => "parquet",
            ExportFormat::Geojson => "geojson",
            ExportFormat::Json => "json",
            ExportFormat::Xml => "xml",
            ExportFormat::Csv => "csv",
            ExportFormat::Pdf => "pdf",
            ExportFormat::Dxf => "dxf",
            ExportFormat::Step => "step",
            ExportFormat::Iges => "iges",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase();
        ExportFormat::ALL
            .into_iter()
            .find(|format| format.as_str() == normalized)
            .ok_or_else(|| ExportError::UnsupportedFormat(s.to_string()))
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Quality level requested for an export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportQuality {
    Draft,
    Standard,
    High,
    Professional,
    Publication,
}

impl ExportQuality {
    /// Every supported quality level, lowest first
    pub const ALL: [ExportQuality; 5] = [
        ExportQuality::Draft,
        ExportQuality::Standard,
        ExportQuality::High,
        ExportQuality::Professional,
        ExportQuality::Publication,
    ];

    /// Get the string representation for storage
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportQuality::Draft => "draft",
            ExportQuality::Standard => "standard",
            ExportQuality::High => "high",
            ExportQuality::Professional => "professional",
            ExportQuality::Publication => "publication",
        }
    }
}

impl FromStr for ExportQuality {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase();
        ExportQuality::ALL
            .into_iter()
            .find(|quality| quality.as_str() == normalized)
            .ok_or_else(|| ExportError::UnsupportedQuality(s.to_string()))
    }
}

impl std::fmt::Display for ExportQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// The current status of an export job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job has been created but not yet executed
    Pending,
    /// Job is currently executing
    InProgress,
    /// Job completed successfully
    Completed,
    /// Job failed with an error
    Failed,
    /// Job was cancelled
    Cancelled,
}

impl JobStatus {
    /// Check if this status represents a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Check if this status represents an active state
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::InProgress)
    }

    /// Get the string representation for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(ExportError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Export Job Entity
// ============================================================================

/// An export job with state machine semantics
///
/// Transitions consume the job and return the updated value, or an
/// `InvalidStateTransition` error leaving the caller's copy untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    /// Unique identifier for this job
    pub id: ExportJobId,
    /// Requested output format
    pub format: ExportFormat,
    /// Requested quality level
    pub quality: ExportQuality,
    /// Destination path handed to the file processor
    pub output_path: String,
    /// Format-specific options (JSON object)
    pub options: serde_json::Value,
    /// User who requested the export, if known
    pub user_id: Option<String>,
    /// Current status
    pub status: JobStatus,
    /// Progress percentage (0-100)
    pub progress: u8,
    /// Error message if failed
    pub error_message: Option<String>,
    /// Size of the produced file in bytes (only when completed)
    pub file_size: Option<u64>,
    /// Execution time, set once the job leaves `InProgress`
    pub duration: Option<Duration>,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When execution started
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExportJob {
    /// Create a new export job in pending state with empty options
    pub fn new(format: ExportFormat, quality: ExportQuality, output_path: impl Into<String>) -> Self {
        Self {
            id: ExportJobId::new(),
            format,
            quality,
            output_path: output_path.into(),
            options: serde_json::Value::Object(serde_json::Map::new()),
            user_id: None,
            status: JobStatus::Pending,
            progress: 0,
            error_message: None,
            file_size: None,
            duration: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Attach format-specific options
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// Attach the requesting user
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Start executing the job
    ///
    /// # Errors
    ///
    /// Returns an error if the job is not in `Pending` state
    pub fn start(mut self) -> Result<Self> {
        self.validate_transition(JobStatus::InProgress)?;
        self.status = JobStatus::InProgress;
        self.started_at = Some(Utc::now());
        Ok(self)
    }

    /// Mark the job as completed with the size of the produced file
    ///
    /// # Errors
    ///
    /// Returns an error if the job is not in `InProgress` state
    pub fn complete(mut self, file_size: u64) -> Result<Self> {
        self.validate_transition(JobStatus::Completed)?;
        self.finish(JobStatus::Completed);
        self.file_size = Some(file_size);
        Ok(self)
    }

    /// Mark the job as failed with an error message
    ///
    /// Progress is set to 100: the job has run to its end even though it
    /// produced no output.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is already in a terminal state
    pub fn fail(mut self, error_message: impl Into<String>) -> Result<Self> {
        self.validate_transition(JobStatus::Failed)?;
        self.finish(JobStatus::Failed);
        self.error_message = Some(error_message.into());
        Ok(self)
    }

    /// Cancel the job
    ///
    /// # Errors
    ///
    /// Returns an error if the job is already in a terminal state
    pub fn cancel(mut self) -> Result<Self> {
        self.validate_transition(JobStatus::Cancelled)?;
        self.status = JobStatus::Cancelled;
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration = self.started_at.map(|started| elapsed(started, now));
        Ok(self)
    }

    /// Time the job has spent executing so far, or in total once finished
    pub fn elapsed(&self) -> Option<Duration> {
        self.duration
            .or_else(|| self.started_at.map(|started| elapsed(started, Utc::now())))
    }

    /// Whether the job finished (any terminal state) before `cutoff`
    pub fn finished_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.status.is_terminal() && self.completed_at.unwrap_or(self.created_at) < cutoff
    }

    fn finish(&mut self, status: JobStatus) {
        let now = Utc::now();
        self.status = status;
        self.progress = 100;
        self.completed_at = Some(now);
        self.duration = Some(elapsed(self.started_at.unwrap_or(now), now));
    }

    /// Validate a state transition
    fn validate_transition(&self, to: JobStatus) -> Result<()> {
        let valid = match (self.status, to) {
            // From Pending
            (JobStatus::Pending, JobStatus::InProgress) => true,
            (JobStatus::Pending, JobStatus::Cancelled) => true,
            (JobStatus::Pending, JobStatus::Failed) => true,

            // From InProgress
            (JobStatus::InProgress, JobStatus::Completed) => true,
            (JobStatus::InProgress, JobStatus::Failed) => true,
            (JobStatus::InProgress, JobStatus::Cancelled) => true,

            // Terminal states cannot transition
            (JobStatus::Completed, _) => false,
            (JobStatus::Failed, _) => false,
            (JobStatus::Cancelled, _) => false,

            _ => false,
        };

        if !valid {
            return Err(ExportError::InvalidStateTransition {
                job_id: self.id.to_string(),
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: format!(
                    "Cannot transition from {} to {}",
                    self.status.as_str(),
                    to.as_str()
                ),
            });
        }

        Ok(())
    }
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or_default()
}

// ============================================================================
// Requests & Results
// ============================================================================

/// Input to [`JobOrchestrator::create_job`](crate::JobOrchestrator::create_job)
#[derive(Debug, Clone)]
pub struct ExportRequest {
    /// Application data to export
    pub data: Bytes,
    /// Destination path
    pub output_path: String,
    /// Requested format
    pub format: ExportFormat,
    /// Requested quality
    pub quality: ExportQuality,
    /// Format-specific options; must be a JSON object (or null)
    pub options: serde_json::Value,
    /// Requesting user, used for per-user analytics
    pub user_id: Option<String>,
}

impl ExportRequest {
    pub fn new(
        data: impl Into<Bytes>,
        output_path: impl Into<String>,
        format: ExportFormat,
        quality: ExportQuality,
    ) -> Self {
        Self {
            data: data.into(),
            output_path: output_path.into(),
            format,
            quality,
            options: serde_json::Value::Object(serde_json::Map::new()),
            user_id: None,
        }
    }

    /// Build a request from untyped format and quality names
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedFormat` / `UnsupportedQuality` for names outside the
    /// supported sets.
    pub fn parse(
        data: impl Into<Bytes>,
        output_path: impl Into<String>,
        format: &str,
        quality: &str,
    ) -> Result<Self> {
        Ok(Self::new(data, output_path, format.parse()?, quality.parse()?))
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Outcome of executing a job
///
/// Execution failures are reported here (`success == false`) rather than as an
/// `Err` from the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportResult {
    pub job_id: ExportJobId,
    pub success: bool,
    pub output_path: String,
    pub file_size: Option<u64>,
    pub duration: Duration,
    pub error: Option<String>,
}

impl ExportResult {
    pub(crate) fn from_job(job: &ExportJob) -> Self {
        Self {
            job_id: job.id,
            success: job.status == JobStatus::Completed,
            output_path: job.output_path.clone(),
            file_size: job.file_size,
            duration: job.duration.unwrap_or_default(),
            error: match job.status {
                JobStatus::Cancelled => Some(ExportError::Cancelled.to_string()),
                _ => job.error_message.clone(),
            },
        }
    }

    /// A failed result for a job that could not be executed at all
    pub fn rejected(job_id: ExportJobId, error: impl Into<String>) -> Self {
        Self {
            job_id,
            success: false,
            output_path: String::new(),
            file_size: None,
            duration: Duration::ZERO,
            error: Some(error.into()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_job() -> ExportJob {
        ExportJob::new(ExportFormat::Json, ExportQuality::Standard, "/tmp/out.json")
    }

    #[test]
    fn test_export_job_id_from_string() {
        let uuid_str = "550e8400-e29b-41d4-a716-446655440000";
        let id = ExportJobId::from_string(uuid_str).unwrap();
        assert_eq!(id.as_str(), uuid_str);
        assert!(matches!(
            ExportJobId::from_string("not-a-uuid"),
            Err(ExportError::InvalidJobId(_))
        ));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("ifc_lite".parse::<ExportFormat>().unwrap(), ExportFormat::IfcLite);
        assert_eq!("GeoJSON".parse::<ExportFormat>().unwrap(), ExportFormat::Geojson);
        assert!(matches!(
            "docx".parse::<ExportFormat>(),
            Err(ExportError::UnsupportedFormat(_))
        ));
        assert_eq!(ExportFormat::ALL.len(), 13);
        for format in ExportFormat::ALL {
            assert_eq!(format.as_str().parse::<ExportFormat>().unwrap(), format);
        }
    }

    #[test]
    fn test_quality_parsing() {
        assert_eq!(
            "Publication".parse::<ExportQuality>().unwrap(),
            ExportQuality::Publication
        );
        assert!(matches!(
            "ultra".parse::<ExportQuality>(),
            Err(ExportError::UnsupportedQuality(_))
        ));
    }

    #[test]
    fn test_format_serializes_snake_case() {
        let json = serde_json::to_string(&ExportFormat::AsciiBim).unwrap();
        assert_eq!(json, "\"ascii_bim\"");
    }

    #[test]
    fn test_job_status_flags() {
        assert!(JobStatus::Pending.is_active());
        assert!(JobStatus::InProgress.is_active());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert_eq!(
            "IN_PROGRESS".parse::<JobStatus>().unwrap(),
            JobStatus::InProgress
        );
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_new() {
        let job = pending_job().with_user("user-1");

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.user_id.as_deref(), Some("user-1"));
        assert!(job.options.is_object());
        assert!(job.started_at.is_none());
        assert!(job.elapsed().is_none());
    }

    #[test]
    fn test_job_complete() {
        let job = pending_job().start().unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        assert!(job.started_at.is_some());

        let job = job.complete(2048).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.file_size, Some(2048));
        assert!(job.duration.is_some());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_job_fail_sets_full_progress() {
        let job = pending_job().start().unwrap();
        let job = job.fail("disk full").unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.error_message.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_job_cannot_complete_without_start() {
        assert!(pending_job().complete(1).is_err());
    }

    #[test]
    fn test_job_cannot_start_twice() {
        let job = pending_job().start().unwrap();
        let err = job.start().unwrap_err();
        assert!(matches!(err, ExportError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_cancel_from_pending_and_in_progress() {
        let job = pending_job().cancel().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.duration.is_none());

        let job = pending_job().start().unwrap().cancel().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.duration.is_some());
    }

    #[test]
    fn test_terminal_states_cannot_transition() {
        let completed = pending_job().start().unwrap().complete(10).unwrap();
        assert!(completed.clone().start().is_err());
        assert!(completed.clone().fail("late").is_err());
        assert!(completed.clone().cancel().is_err());

        let cancelled = pending_job().cancel().unwrap();
        assert!(cancelled.clone().complete(1).is_err());
        assert!(cancelled.start().is_err());
    }

    #[test]
    fn test_finished_before() {
        let job = pending_job().start().unwrap().complete(1).unwrap();
        let later = Utc::now() + chrono::Duration::seconds(5);
        let earlier = Utc::now() - chrono::Duration::hours(1);

        assert!(job.finished_before(later));
        assert!(!job.finished_before(earlier));
        assert!(!pending_job().finished_before(later));
    }

    #[test]
    fn test_request_parse() {
        let request = ExportRequest::parse(vec![1, 2, 3], "/tmp/a.csv", "csv", "draft")
            .unwrap()
            .with_user("user-9");
        assert_eq!(request.format, ExportFormat::Csv);
        assert_eq!(request.quality, ExportQuality::Draft);
        assert_eq!(request.data.len(), 3);

        assert!(ExportRequest::parse(Vec::new(), "/tmp/a", "csv", "ultra").is_err());
    }

    #[test]
    fn test_result_from_cancelled_job() {
        let job = pending_job().cancel().unwrap();
        let result = ExportResult::from_job(&job);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Export cancelled"));
    }
}
