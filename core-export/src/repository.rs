//! # Export Job Repository
//!
//! Persistence for export job records.
//!
//! ## Overview
//!
//! The orchestrator owns the authoritative in-memory view of each job and
//! writes every state change through an [`ExportJobRepository`]. Two
//! implementations are provided:
//! - [`SqliteExportJobRepository`] for durable storage
//! - [`InMemoryExportJobRepository`] for hosts without a database and for tests

use crate::{
    ExportError, ExportFormat, ExportJob, ExportJobId, ExportQuality, JobStatus, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

// ============================================================================
// Repository Trait
// ============================================================================

/// Repository trait for export job persistence
#[async_trait]
pub trait ExportJobRepository: Send + Sync {
    /// Insert a new export job
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn insert(&self, job: &ExportJob) -> Result<()>;

    /// Update an existing export job
    ///
    /// # Errors
    ///
    /// Returns `JobNotFound` if the job doesn't exist, or an error if the
    /// database operation fails
    async fn update(&self, job: &ExportJob) -> Result<()>;

    /// Find an export job by ID
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn find_by_id(&self, id: &ExportJobId) -> Result<Option<ExportJob>>;

    /// Get export jobs by status, newest first
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<ExportJob>>;

    /// Get terminal jobs that finished before `cutoff`
    ///
    /// Jobs without a completion timestamp are aged by their creation time.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn find_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExportJob>>;

    /// Delete an export job
    ///
    /// # Errors
    ///
    /// Returns `JobNotFound` if the job doesn't exist
    async fn delete(&self, id: &ExportJobId) -> Result<()>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite implementation of ExportJobRepository
pub struct SqliteExportJobRepository {
    pool: SqlitePool,
}

impl SqliteExportJobRepository {
    /// Create a new SQLite export job repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, format, quality, output_path, options, user_id,
           status, progress, error_message, file_size, duration_ms,
           created_at, started_at, completed_at
    FROM export_jobs
"#;

/// Database row representation of an export job
#[derive(Debug, FromRow)]
struct ExportJobRow {
    id: String,
    format: String,
    quality: String,
    output_path: String,
    options: String,
    user_id: Option<String>,
    status: String,
    progress: i64,
    error_message: Option<String>,
    file_size: Option<i64>,
    duration_ms: Option<i64>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

fn from_millis(field: &str, millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ExportError::Database(format!("Invalid {} timestamp: {}", field, millis)))
}

impl TryFrom<ExportJobRow> for ExportJob {
    type Error = ExportError;

    fn try_from(row: ExportJobRow) -> Result<Self> {
        let format: ExportFormat = row.format.parse()?;
        let quality: ExportQuality = row.quality.parse()?;
        let status: JobStatus = row.status.parse()?;
        let options = serde_json::from_str(&row.options)
            .map_err(|e| ExportError::Database(format!("Invalid options JSON: {}", e)))?;

        Ok(ExportJob {
            id: ExportJobId::from_string(&row.id)?,
            format,
            quality,
            output_path: row.output_path,
            options,
            user_id: row.user_id,
            status,
            progress: row.progress.clamp(0, 100) as u8,
            error_message: row.error_message,
            file_size: row.file_size.map(|size| size.max(0) as u64),
            duration: row
                .duration_ms
                .map(|ms| Duration::from_millis(ms.max(0) as u64)),
            created_at: from_millis("created_at", row.created_at)?,
            started_at: row
                .started_at
                .map(|ms| from_millis("started_at", ms))
                .transpose()?,
            completed_at: row
                .completed_at
                .map(|ms| from_millis("completed_at", ms))
                .transpose()?,
        })
    }
}

fn options_json(job: &ExportJob) -> Result<String> {
    serde_json::to_string(&job.options)
        .map_err(|e| ExportError::Database(format!("Failed to encode options: {}", e)))
}

#[async_trait]
impl ExportJobRepository for SqliteExportJobRepository {
    async fn insert(&self, job: &ExportJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO export_jobs (
                id, format, quality, output_path, options, user_id,
                status, progress, error_message, file_size, duration_ms,
                created_at, started_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.format.as_str())
        .bind(job.quality.as_str())
        .bind(&job.output_path)
        .bind(options_json(job)?)
        .bind(&job.user_id)
        .bind(job.status.as_str())
        .bind(job.progress as i64)
        .bind(&job.error_message)
        .bind(job.file_size.map(|size| size as i64))
        .bind(job.duration.map(|d| d.as_millis() as i64))
        .bind(job.created_at.timestamp_millis())
        .bind(job.started_at.map(|t| t.timestamp_millis()))
        .bind(job.completed_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await
        .map_err(|e| ExportError::Database(e.to_string()))?;

        Ok(())
    }

    async fn update(&self, job: &ExportJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs SET
                options = ?,
                user_id = ?,
                status = ?,
                progress = ?,
                error_message = ?,
                file_size = ?,
                duration_ms = ?,
                started_at = ?,
                completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(options_json(job)?)
        .bind(&job.user_id)
        .bind(job.status.as_str())
        .bind(job.progress as i64)
        .bind(&job.error_message)
        .bind(job.file_size.map(|size| size as i64))
        .bind(job.duration.map(|d| d.as_millis() as i64))
        .bind(job.started_at.map(|t| t.timestamp_millis()))
        .bind(job.completed_at.map(|t| t.timestamp_millis()))
        .bind(job.id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| ExportError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(ExportError::JobNotFound {
                job_id: job.id.to_string(),
            });
        }

        Ok(())
    }

    async fn find_by_id(&self, id: &ExportJobId) -> Result<Option<ExportJob>> {
        let row = sqlx::query_as::<_, ExportJobRow>(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ExportError::Database(e.to_string()))?;

        row.map(ExportJob::try_from).transpose()
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<ExportJob>> {
        let rows = sqlx::query_as::<_, ExportJobRow>(&format!(
            "{} WHERE status = ? ORDER BY created_at DESC",
            SELECT_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ExportError::Database(e.to_string()))?;

        rows.into_iter().map(ExportJob::try_from).collect()
    }

    async fn find_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExportJob>> {
        let rows = sqlx::query_as::<_, ExportJobRow>(&format!(
            r#"{}
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND COALESCE(completed_at, created_at) < ?
            ORDER BY created_at ASC"#,
            SELECT_COLUMNS
        ))
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ExportError::Database(e.to_string()))?;

        rows.into_iter().map(ExportJob::try_from).collect()
    }

    async fn delete(&self, id: &ExportJobId) -> Result<()> {
        let result = sqlx::query("DELETE FROM export_jobs WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| ExportError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(ExportError::JobNotFound {
                job_id: id.to_string(),
            });
        }

        Ok(())
    }
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// Repository backed by a map; contents are lost when dropped
#[derive(Default)]
pub struct InMemoryExportJobRepository {
    jobs: RwLock<HashMap<ExportJobId, ExportJob>>,
}

impl InMemoryExportJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

fn newest_first(mut jobs: Vec<ExportJob>) -> Vec<ExportJob> {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    jobs
}

#[async_trait]
impl ExportJobRepository for InMemoryExportJobRepository {
    async fn insert(&self, job: &ExportJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(ExportError::Database(format!(
                "Export job {} already exists",
                job.id
            )));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update(&self, job: &ExportJob) -> Result<()> {
        match self.jobs.write().await.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(ExportError::JobNotFound {
                job_id: job.id.to_string(),
            }),
        }
    }

    async fn find_by_id(&self, id: &ExportJobId) -> Result<Option<ExportJob>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<ExportJob>> {
        let jobs = self.jobs.read().await;
        Ok(newest_first(
            jobs.values().filter(|job| job.status == status).cloned().collect(),
        ))
    }

    async fn find_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExportJob>> {
        let jobs = self.jobs.read().await;
        let mut old: Vec<ExportJob> = jobs
            .values()
            .filter(|job| job.finished_before(cutoff))
            .cloned()
            .collect();
        old.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(old)
    }

    async fn delete(&self, id: &ExportJobId) -> Result<()> {
        self.jobs
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ExportError::JobNotFound {
                job_id: id.to_string(),
            })
    }
}

// ============================================================================
// Tests
// ============================================================================
