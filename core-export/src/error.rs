use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("Unsupported export quality: {0}")]
    UnsupportedQuality(String),

    #[error("Invalid job ID: {0}")]
    InvalidJobId(String),

    #[error("Invalid job status: {0}")]
    InvalidStatus(String),

    #[error("Invalid state transition for job {job_id} from {from} to {to}: {reason}")]
    InvalidStateTransition {
        job_id: String,
        from: String,
        to: String,
        reason: String,
    },

    #[error("Job {job_id} is already being tracked")]
    AlreadyTracked { job_id: String },

    #[error("Export job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Job {job_id} is not being tracked")]
    NotTracked { job_id: String },

    #[error("Analytics report {report_id} not found")]
    ReportNotFound { report_id: String },

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("No file processor registered for format {format}")]
    NoProcessor { format: String },

    #[error("Export timed out after {0:?}")]
    Timeout(Duration),

    #[error("Export cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),
}

/// Coarse error category exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input; nothing was created or mutated.
    Validation,
    /// The current status does not permit the operation.
    State,
    /// The referenced job, session or report does not exist.
    NotFound,
    /// Conversion or processing of a job failed.
    Execution,
    /// Persistence layer failure.
    Storage,
}

impl ExportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExportError::Validation { .. }
            | ExportError::UnsupportedFormat(_)
            | ExportError::UnsupportedQuality(_)
            | ExportError::InvalidJobId(_)
            | ExportError::InvalidStatus(_) => ErrorKind::Validation,
            ExportError::InvalidStateTransition { .. } | ExportError::AlreadyTracked { .. } => {
                ErrorKind::State
            }
            ExportError::JobNotFound { .. }
            | ExportError::NotTracked { .. }
            | ExportError::ReportNotFound { .. } => ErrorKind::NotFound,
            ExportError::Conversion(_)
            | ExportError::Processing(_)
            | ExportError::NoProcessor { .. }
            | ExportError::Timeout(_)
            | ExportError::Cancelled => ErrorKind::Execution,
            ExportError::Database(_) | ExportError::Migration(_) => ErrorKind::Storage,
        }
    }

    /// Stable code used to group failures in analytics.
    pub fn error_type(&self) -> &'static str {
        match self {
            ExportError::Conversion(_) => "conversion_error",
            ExportError::Processing(_) => "processing_error",
            ExportError::NoProcessor { .. } => "no_processor",
            ExportError::Timeout(_) => "timeout",
            ExportError::Cancelled => "cancelled",
            ExportError::Database(_) | ExportError::Migration(_) => "storage_error",
            other => match other.kind() {
                ErrorKind::Validation => "validation_error",
                ErrorKind::State => "state_error",
                ErrorKind::NotFound => "not_found",
                ErrorKind::Execution => "execution_error",
                ErrorKind::Storage => "storage_error",
            },
        }
    }

    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        ExportError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExportError>;
