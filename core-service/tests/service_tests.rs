//! End-to-end tests for the export service façade

use async_trait::async_trait;
use bytes::Bytes;
use core_export::{
    ExportConfig, ExportContext, ExportFormat, ExportQuality, ExportRequest, FileProcessor,
    InMemoryExportJobRepository, JobStatus,
};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus, ExportLifecycleEvent};
use core_service::{CoreError, ExportService};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct NoopProcessor;

#[async_trait]
impl FileProcessor for NoopProcessor {
    async fn process(
        &self,
        ctx: &ExportContext,
        _data: Bytes,
        _output_path: &Path,
        _config: &ExportConfig,
    ) -> core_export::Result<()> {
        ctx.progress.report(1.0, "flushed").await;
        Ok(())
    }

    fn supported_formats(&self) -> Vec<ExportFormat> {
        vec![ExportFormat::Gltf]
    }
}

fn request() -> ExportRequest {
    ExportRequest::new(
        b"scene".to_vec(),
        "/nonexistent/model.gltf",
        ExportFormat::Gltf,
        ExportQuality::Professional,
    )
    .with_user("modeller-2")
}

#[tokio::test]
async fn test_bootstrap_wires_shared_engines() -> anyhow::Result<()> {
    let service = ExportService::bootstrap(CoreConfig::builder().build()?).await?;
    let orchestrator = service.orchestrator();
    orchestrator
        .register_processor_for_all(Arc::new(NoopProcessor))
        .await;

    let job_id = orchestrator.create_job(request()).await?;
    let result = orchestrator.execute_job(job_id).await?;
    assert!(result.success);

    let progress = service.tracker().get_progress(job_id).await?;
    assert_eq!(progress.progress, 1.0);

    let completed = service
        .analytics()
        .sample_count(core_export::analytics::names::JOBS_COMPLETED)
        .await;
    assert_eq!(completed, 1);

    let stored = orchestrator.get_jobs_by_status(JobStatus::Completed).await?;
    assert_eq!(stored.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_events_share_one_bus() -> anyhow::Result<()> {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let service = ExportService::from_parts(
        CoreConfig::default(),
        Arc::new(InMemoryExportJobRepository::new()),
        bus,
    );
    service
        .orchestrator()
        .register_processor(ExportFormat::Gltf, Arc::new(NoopProcessor))
        .await;

    let job_id = service.orchestrator().create_job(request()).await?;
    service.orchestrator().execute_job(job_id).await?;

    let mut saw_progress = false;
    let mut saw_analytics = false;
    let mut saw_completed = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            CoreEvent::Progress(_) => saw_progress = true,
            CoreEvent::Analytics(_) => saw_analytics = true,
            CoreEvent::Export(ExportLifecycleEvent::Completed { .. }) => saw_completed = true,
            CoreEvent::Export(_) => {}
        }
    }
    assert!(saw_progress);
    assert!(saw_completed);
    assert!(!saw_analytics, "no report or aggregation ran");
    Ok(())
}

#[tokio::test]
async fn test_background_tasks_stop_on_shutdown() -> anyhow::Result<()> {
    let config = CoreConfig::builder()
        .tracker_retention(Duration::from_millis(20))
        .aggregation_period(Duration::from_millis(20))
        .build()?;
    let service = ExportService::bootstrap(config).await?;

    service.start_background_tasks().await?;
    service.start_background_tasks().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(5), service.shutdown()).await?;

    let err = service.start_background_tasks().await.unwrap_err();
    assert!(matches!(err, CoreError::InitializationFailed(_)));
    Ok(())
}
