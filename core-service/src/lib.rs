//! Export service façade and bootstrap helpers.
//!
//! This crate builds the export engines once at startup and hands out shared
//! references to them. Hosts call [`ExportService::bootstrap`] with a validated
//! [`CoreConfig`], start the background loops, and call
//! [`ExportService::shutdown`] before exiting.
//!
//! ```no_run
//! # async fn example() -> core_service::Result<()> {
//! use core_runtime::config::CoreConfig;
//! use core_service::ExportService;
//!
//! let service = ExportService::bootstrap(CoreConfig::from_env()?).await?;
//! service.start_background_tasks().await?;
//!
//! let formats = service.orchestrator().supported_formats();
//! # let _ = formats;
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod error;

pub use error::{CoreError, Result};

use std::sync::Arc;

use core_export::analytics::{AnalyticsConfig, AnalyticsEngine};
use core_export::db::{create_pool, DatabaseConfig};
use core_export::progress::{ProgressTracker, TrackerConfig};
use core_export::{
    ExportJobRepository, JobOrchestrator, OrchestratorConfig, SqliteExportJobRepository,
};
use core_runtime::config::CoreConfig;
use core_runtime::events::EventBus;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Primary façade exposed to host applications.
///
/// Owns the orchestrator, tracker and analytics engine; all three share one
/// event bus.
pub struct ExportService {
    config: CoreConfig,
    orchestrator: Arc<JobOrchestrator>,
    tracker: Arc<ProgressTracker>,
    analytics: Arc<AnalyticsEngine>,
    event_bus: EventBus,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ExportService {
    /// Open the job database and wire up the engines.
    ///
    /// Without a `database_url` jobs are kept in an in-memory SQLite database.
    pub async fn bootstrap(config: CoreConfig) -> Result<Self> {
        config.validate()?;

        let db_config = match &config.database_url {
            Some(url) => DatabaseConfig::new(url.as_str()),
            None => DatabaseConfig::in_memory(),
        };
        let pool = create_pool(db_config).await?;
        let repository = Arc::new(SqliteExportJobRepository::new(pool));

        let event_bus = EventBus::new(config.event_buffer_size);
        Ok(Self::from_parts(config, repository, event_bus))
    }

    /// Build the engines around an existing repository and event bus.
    pub fn from_parts(
        config: CoreConfig,
        repository: Arc<dyn ExportJobRepository>,
        event_bus: EventBus,
    ) -> Self {
        let tracker = Arc::new(
            ProgressTracker::new(
                TrackerConfig::default()
                    .with_retention_period(config.tracker_retention)
                    .with_subscriber_queue_capacity(config.subscriber_queue_capacity),
            )
            .with_event_bus(event_bus.clone()),
        );

        let analytics = Arc::new(
            AnalyticsEngine::new(
                AnalyticsConfig::default()
                    .with_aggregation_period(config.aggregation_period)
                    .with_retention_period(config.metrics_retention)
                    .with_max_data_points(config.max_data_points)
                    .with_report_cache_size(config.report_cache_size),
            )
            .with_event_bus(event_bus.clone()),
        );

        let orchestrator = Arc::new(
            JobOrchestrator::new(
                repository,
                OrchestratorConfig::default().with_execution_timeout(config.execution_timeout),
            )
            .with_tracker(Arc::clone(&tracker))
            .with_analytics(Arc::clone(&analytics))
            .with_event_bus(event_bus.clone()),
        );

        info!("Export service initialized");

        Self {
            config,
            orchestrator,
            tracker,
            analytics,
            event_bus,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the progress retention and analytics aggregation loops.
    ///
    /// Calling this again while the loops run is a no-op.
    pub async fn start_background_tasks(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(CoreError::InitializationFailed(
                "service has been shut down".to_string(),
            ));
        }

        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }

        let tracker = Arc::clone(&self.tracker);
        let cancel = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            tracker.run_retention(cancel).await;
        }));

        let analytics = Arc::clone(&self.analytics);
        let cancel = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            analytics.run_aggregation(cancel).await;
        }));

        info!(tasks = tasks.len(), "Background tasks started");
        Ok(())
    }

    /// Stop the background loops and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for outcome in join_all(tasks).await {
            if let Err(e) = outcome {
                error!(error = %e, "Background task ended abnormally");
            }
        }

        info!("Export service stopped");
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> Arc<JobOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn analytics(&self) -> Arc<AnalyticsEngine> {
        Arc::clone(&self.analytics)
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }
}
