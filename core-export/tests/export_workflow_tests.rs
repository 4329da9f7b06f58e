//! Integration tests for the export workflow
//!
//! These tests drive the orchestrator, tracker and analytics engine together:
//! - Create and execute against SQLite-backed storage
//! - Terminal outcomes for every format and quality
//! - Cancellation and state errors
//! - Tracker warnings, pause and resume
//! - Reports built from executed jobs

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use core_export::analytics::{names, AnalyticsConfig, AnalyticsEngine, Metadata, TimePeriod};
use core_export::db::create_test_pool;
use core_export::progress::{ProgressStatus, ProgressTracker};
use core_export::{
    ExportConfig, ExportContext, ExportError, ExportFormat, ExportJobRepository, ExportQuality,
    ExportRequest, FileProcessor, InMemoryExportJobRepository, JobOrchestrator, JobStatus,
    OrchestratorConfig, SqliteExportJobRepository,
};
use core_runtime::events::EventSeverity;
use std::path::Path;
use std::sync::Arc;

// ============================================================================
// Test Processors
// ============================================================================

/// Accepts everything and writes nothing
struct NoopProcessor;

#[async_trait]
impl FileProcessor for NoopProcessor {
    async fn process(
        &self,
        _ctx: &ExportContext,
        _data: Bytes,
        _output_path: &Path,
        _config: &ExportConfig,
    ) -> core_export::Result<()> {
        Ok(())
    }

    fn supported_formats(&self) -> Vec<ExportFormat> {
        ExportFormat::ALL.to_vec()
    }
}

/// Writes the payload to disk, reporting progress halfway
struct FileWriter;

#[async_trait]
impl FileProcessor for FileWriter {
    async fn process(
        &self,
        ctx: &ExportContext,
        data: Bytes,
        output_path: &Path,
        _config: &ExportConfig,
    ) -> core_export::Result<()> {
        ctx.progress.report(0.5, "writing").await;
        tokio::fs::write(output_path, &data)
            .await
            .map_err(|e| ExportError::Processing(e.to_string()))
    }

    fn supported_formats(&self) -> Vec<ExportFormat> {
        vec![ExportFormat::Json, ExportFormat::Csv]
    }
}

/// Rejects drawing formats
struct PickyProcessor;

#[async_trait]
impl FileProcessor for PickyProcessor {
    async fn process(
        &self,
        _ctx: &ExportContext,
        _data: Bytes,
        _output_path: &Path,
        config: &ExportConfig,
    ) -> core_export::Result<()> {
        match config.format {
            ExportFormat::Dxf | ExportFormat::Step | ExportFormat::Iges => Err(
                ExportError::Processing(format!("{} writer unavailable", config.format)),
            ),
            _ => Ok(()),
        }
    }

    fn supported_formats(&self) -> Vec<ExportFormat> {
        ExportFormat::ALL.to_vec()
    }
}

fn temp_output(ext: &str) -> String {
    std::env::temp_dir()
        .join(format!("export-test-{}.{}", uuid::Uuid::new_v4(), ext))
        .to_string_lossy()
        .into_owned()
}

async fn sqlite_orchestrator() -> (JobOrchestrator, Arc<SqliteExportJobRepository>) {
    let pool = create_test_pool().await.unwrap();
    let repository = Arc::new(SqliteExportJobRepository::new(pool));
    let orchestrator = JobOrchestrator::new(repository.clone(), OrchestratorConfig::default());
    (orchestrator, repository)
}

// ============================================================================
// Orchestration
// ============================================================================

#[tokio::test]
async fn test_create_and_execute_json_export() {
    let (orchestrator, repository) = sqlite_orchestrator().await;
    orchestrator
        .register_processor(ExportFormat::Json, Arc::new(NoopProcessor))
        .await;

    let request = ExportRequest::parse(
        b"{\"levels\": 3}".to_vec(),
        "/tmp/out.json",
        "json",
        "standard",
    )
    .unwrap()
    .with_options(serde_json::json!({}));
    let job_id = orchestrator.create_job(request).await.unwrap();

    let result = orchestrator.execute_job(job_id).await.unwrap();
    assert!(result.success);

    let job = orchestrator.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);

    let stored = repository.find_by_id(&job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.progress, 100);
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn test_every_format_and_quality_terminates_at_full_progress() {
    let orchestrator = JobOrchestrator::new(
        Arc::new(InMemoryExportJobRepository::new()),
        OrchestratorConfig::default(),
    );
    orchestrator
        .register_processor_for_all(Arc::new(PickyProcessor))
        .await;

    for format in ExportFormat::ALL {
        for quality in ExportQuality::ALL {
            let request =
                ExportRequest::new(vec![1u8, 2, 3], temp_output(format.as_str()), format, quality);
            let job_id = orchestrator.create_job(request).await.unwrap();
            orchestrator.execute_job(job_id).await.unwrap();

            let job = orchestrator.get_job(job_id).await.unwrap();
            assert!(
                matches!(job.status, JobStatus::Completed | JobStatus::Failed),
                "{} / {} ended as {}",
                format,
                quality,
                job.status
            );
            assert_eq!(job.progress, 100);
        }
    }

    let stats = orchestrator.get_statistics().await;
    assert_eq!(stats.total_jobs, 65);
    assert_eq!(stats.failed_jobs, 15);
    assert_eq!(stats.completed_jobs, 50);
}

#[tokio::test]
async fn test_file_size_comes_from_written_file() {
    let (orchestrator, _) = sqlite_orchestrator().await;
    orchestrator
        .register_processor_for_all(Arc::new(FileWriter))
        .await;

    let path = temp_output("csv");
    let request = ExportRequest::new(
        "id,name\n1,Slab\n".as_bytes().to_vec(),
        path.clone(),
        ExportFormat::Csv,
        ExportQuality::High,
    );
    let job_id = orchestrator.create_job(request).await.unwrap();
    let result = orchestrator.execute_job(job_id).await.unwrap();

    assert!(result.success);
    assert_eq!(result.file_size, Some(15));
    tokio::fs::remove_file(&path).await.ok();
}

#[tokio::test]
async fn test_cancel_completed_job_is_rejected() {
    let (orchestrator, repository) = sqlite_orchestrator().await;
    orchestrator
        .register_processor(ExportFormat::Json, Arc::new(NoopProcessor))
        .await;

    let job_id = orchestrator
        .create_job(ExportRequest::new(
            vec![0u8; 4],
            "/tmp/out.json",
            ExportFormat::Json,
            ExportQuality::Standard,
        ))
        .await
        .unwrap();
    orchestrator.execute_job(job_id).await.unwrap();

    let err = orchestrator.cancel_job(job_id).await.unwrap_err();
    assert!(matches!(err, ExportError::InvalidStateTransition { .. }));
    assert_eq!(
        orchestrator.get_job(job_id).await.unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(
        repository.find_by_id(&job_id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn test_cancelled_job_never_completes() {
    let (orchestrator, _) = sqlite_orchestrator().await;
    orchestrator
        .register_processor(ExportFormat::Json, Arc::new(NoopProcessor))
        .await;

    let job_id = orchestrator
        .create_job(ExportRequest::new(
            vec![0u8; 4],
            "/tmp/out.json",
            ExportFormat::Json,
            ExportQuality::Draft,
        ))
        .await
        .unwrap();
    let cancelled = orchestrator.cancel_job(job_id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let err = orchestrator.execute_job(job_id).await.unwrap_err();
    assert!(matches!(err, ExportError::InvalidStateTransition { .. }));
    assert_eq!(
        orchestrator.get_job(job_id).await.unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn test_unsupported_names_are_rejected_before_creation() {
    assert!(matches!(
        ExportRequest::parse(Vec::<u8>::new(), "/tmp/out.obj", "obj", "standard"),
        Err(ExportError::UnsupportedFormat(_))
    ));
    assert!(matches!(
        ExportRequest::parse(Vec::<u8>::new(), "/tmp/out.json", "json", "ultra"),
        Err(ExportError::UnsupportedQuality(_))
    ));
}

// ============================================================================
// Progress Tracking
// ============================================================================

#[tokio::test]
async fn test_warning_on_untracked_job_creates_nothing() {
    let tracker = ProgressTracker::default();
    let job_id = core_export::ExportJobId::new();

    let err = tracker
        .add_warning(job_id, "W001", "Missing material", EventSeverity::Warning)
        .await
        .unwrap_err();

    assert!(matches!(err, ExportError::NotTracked { .. }));
    assert!(!tracker.is_tracked(job_id).await);
    assert!(tracker.get_all_progress().await.is_empty());
    assert_eq!(tracker.get_metrics().await.total_warnings, 0);
}

#[tokio::test]
async fn test_resume_running_job_is_state_error() {
    let tracker = ProgressTracker::default();
    let job_id = core_export::ExportJobId::new();

    tracker.start_tracking(job_id, 4).await.unwrap();
    tracker
        .update_progress(job_id, 0.25, "meshing", 1)
        .await
        .unwrap();

    let err = tracker.resume_job(job_id).await.unwrap_err();
    assert!(matches!(err, ExportError::InvalidStateTransition { .. }));
    assert_eq!(
        tracker.get_progress(job_id).await.unwrap().status,
        ProgressStatus::Running
    );
}

#[tokio::test]
async fn test_double_start_keeps_original_session() {
    let tracker = ProgressTracker::default();
    let job_id = core_export::ExportJobId::new();

    tracker.start_tracking(job_id, 5).await.unwrap();
    tracker
        .update_progress(job_id, 0.4, "collecting", 2)
        .await
        .unwrap();

    let err = tracker.start_tracking(job_id, 9).await.unwrap_err();
    assert!(matches!(err, ExportError::AlreadyTracked { .. }));

    let progress = tracker.get_progress(job_id).await.unwrap();
    assert_eq!(progress.total_steps, 5);
    assert_eq!(progress.completed_steps, 2);
    assert_eq!(progress.progress, 0.4);
}

#[tokio::test]
async fn test_subscriber_sees_execution_progress() {
    let tracker = Arc::new(ProgressTracker::default());
    let orchestrator = JobOrchestrator::new(
        Arc::new(InMemoryExportJobRepository::new()),
        OrchestratorConfig::default(),
    )
    .with_tracker(tracker.clone());
    orchestrator
        .register_processor_for_all(Arc::new(FileWriter))
        .await;

    let path = temp_output("json");
    let job_id = orchestrator
        .create_job(ExportRequest::new(
            b"[]".to_vec(),
            path.clone(),
            ExportFormat::Json,
            ExportQuality::Standard,
        ))
        .await
        .unwrap();

    let mut updates = tracker.subscribe_progress(job_id).await;
    orchestrator.execute_job(job_id).await.unwrap();

    let mut ratios = Vec::new();
    let mut last_status = None;
    while let Ok(progress) = updates.try_recv() {
        ratios.push(progress.progress);
        last_status = Some(progress.status);
    }

    assert!(ratios.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(ratios.iter().any(|r| *r > 0.5 && *r < 0.95));
    assert_eq!(last_status, Some(ProgressStatus::Completed));
    tokio::fs::remove_file(&path).await.ok();
}

// ============================================================================
// Analytics
// ============================================================================

#[tokio::test]
async fn test_report_over_executed_jobs() {
    let analytics = Arc::new(AnalyticsEngine::default());
    let orchestrator = JobOrchestrator::new(
        Arc::new(InMemoryExportJobRepository::new()),
        OrchestratorConfig::default(),
    )
    .with_analytics(analytics.clone());
    orchestrator
        .register_processor_for_all(Arc::new(PickyProcessor))
        .await;

    let window_start = Utc::now() - ChronoDuration::minutes(1);
    for format in [ExportFormat::Json, ExportFormat::Csv, ExportFormat::Pdf, ExportFormat::Dxf] {
        let request =
            ExportRequest::new(vec![7u8; 10], "/tmp/report-test", format, ExportQuality::High)
                .with_user("architect-7");
        let job_id = orchestrator.create_job(request).await.unwrap();
        orchestrator.execute_job(job_id).await.unwrap();
    }
    let window_end = Utc::now() + ChronoDuration::minutes(1);

    let report = analytics
        .generate_report(TimePeriod::Hour, window_start, window_end)
        .await
        .unwrap();

    assert_eq!(report.summary.total_jobs, 4);
    assert_eq!(report.summary.completed_jobs, 3);
    assert_eq!(report.summary.failed_jobs, 1);
    assert_eq!(report.summary.success_rate, 75.0);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.users[0].user_id, "architect-7");
    assert_eq!(report.users[0].total_jobs, 4);

    let cached = analytics.get_report(&report.report_id).await.unwrap();
    assert_eq!(cached, report);
}

#[tokio::test]
async fn test_empty_window_has_zero_success_rate() {
    let analytics = AnalyticsEngine::default();
    let end = Utc::now();

    let report = analytics
        .generate_report(TimePeriod::Day, end - ChronoDuration::days(1), end)
        .await
        .unwrap();

    assert_eq!(report.summary.total_jobs, 0);
    assert_eq!(report.summary.success_rate, 0.0);
}

#[tokio::test]
async fn test_sample_cap_drops_oldest() {
    let analytics = AnalyticsEngine::new(AnalyticsConfig::default().with_max_data_points(4));
    let start = Utc::now() - ChronoDuration::hours(1);

    for i in 0..5 {
        analytics
            .record_metric_at(
                names::JOBS_DURATION,
                f64::from(i),
                Metadata::new(),
                start + ChronoDuration::seconds(i64::from(i)),
            )
            .await
            .unwrap();
    }

    let samples = analytics
        .get_samples(names::JOBS_DURATION, start, Utc::now())
        .await;
    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
}
