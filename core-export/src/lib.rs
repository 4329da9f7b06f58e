//! # Export Module
//!
//! Runs export jobs and observes them while they run.
//!
//! ## Overview
//!
//! This module manages the lifecycle of export jobs, including:
//! - Validating requests and persisting jobs to the database
//! - Dispatching work to pluggable format converters and file processors
//! - Tracking fine-grained progress, warnings and events per job
//! - Recording operational metrics and building periodic reports
//!
//! ## Components
//!
//! - **Job State Machine** (`job`): Export job lifecycle with validated transitions
//! - **Processors** (`processor`): Converter and file processor seams plus the per-run context
//! - **Repository** (`repository`): Job persistence (SQLite and in-memory)
//! - **Job Orchestrator** (`orchestrator`): Creates, executes, cancels and cleans up jobs
//! - **Progress Tracker** (`progress`): Progress sessions, subscriptions and retention
//! - **Analytics Engine** (`analytics`): Metric samples, roll-ups and reports

pub mod analytics;
pub mod db;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod processor;
pub mod progress;
pub mod repository;

pub use error::{ErrorKind, ExportError, Result};
pub use job::{
    ExportFormat, ExportJob, ExportJobId, ExportQuality, ExportRequest, ExportResult, JobStatus,
};
pub use orchestrator::{
    BatchProgress, BatchStage, ExportStatistics, JobOrchestrator, OrchestratorConfig,
};
pub use processor::{ExportConfig, ExportContext, FileProcessor, FormatConverter, ProgressReporter};
pub use repository::{
    ExportJobRepository, InMemoryExportJobRepository, SqliteExportJobRepository,
};
