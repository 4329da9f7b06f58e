//! # Analytics Engine
//!
//! Records named metric samples, rolls them up into hourly aggregates in the
//! background, and builds cached point-in-time reports.
//!
//! ## Storage
//!
//! Samples are kept per metric name, ordered by timestamp, capped at
//! `max_data_points` (oldest dropped first) and pruned once older than the
//! retention period. Job outcomes are recorded as several samples sharing
//! the same metadata, so per-format, per-user and per-error breakdowns need
//! no dedicated schema.
//!
//! ## Metric Names
//!
//! | Name | Value |
//! |------|-------|
//! | `export.jobs.completed` / `export.jobs.failed` | 1 per job |
//! | `export.jobs.duration` | seconds |
//! | `export.jobs.active` | running jobs (gauge) |
//! | `export.format.<format>.{completed,failed,file_size}` | 1 / bytes |
//! | `export.user.<user>.{completed,failed}` | 1 |
//! | `export.errors.<error_type>` | 1 |

use super::metric::{AggregatedMetric, Metadata, MetricSample, TimePeriod};
use super::report::{
    mean, success_rate, AnalyticsReport, ErrorAnalytics, FormatAnalytics, SummaryAnalytics,
    SystemAnalytics, Trend, UserAnalytics,
};
use crate::{ExportError, ExportJob, ExportResult, Result};
use chrono::{DateTime, Utc};
use core_runtime::events::{AnalyticsEvent, CoreEvent, EventBus};
use lru::LruCache;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Well-known metric names
pub mod names {
    use crate::ExportFormat;

    pub const JOBS_COMPLETED: &str = "export.jobs.completed";
    pub const JOBS_FAILED: &str = "export.jobs.failed";
    pub const JOBS_DURATION: &str = "export.jobs.duration";
    pub const JOBS_ACTIVE: &str = "export.jobs.active";

    pub fn format_metric(format: ExportFormat, suffix: &str) -> String {
        format!("export.format.{}.{}", format.as_str(), suffix)
    }

    pub fn user_metric(user_id: &str, suffix: &str) -> String {
        format!("export.user.{}.{}", user_id, suffix)
    }

    pub fn error_metric(error_type: &str) -> String {
        format!("export.errors.{}", error_type)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Analytics engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsConfig {
    /// Interval of the background roll-up
    pub aggregation_period: Duration,
    /// Age after which raw samples and roll-ups are discarded
    pub retention_period: Duration,
    /// Per-metric cap on stored samples
    pub max_data_points: usize,
    /// Number of generated reports kept for `get_report`
    pub report_cache_size: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            aggregation_period: Duration::from_secs(5 * 60),
            retention_period: Duration::from_secs(7 * 24 * 60 * 60),
            max_data_points: 10_000,
            report_cache_size: 64,
        }
    }
}

impl AnalyticsConfig {
    pub fn with_aggregation_period(mut self, period: Duration) -> Self {
        self.aggregation_period = period;
        self
    }

    pub fn with_retention_period(mut self, period: Duration) -> Self {
        self.retention_period = period;
        self
    }

    pub fn with_max_data_points(mut self, points: usize) -> Self {
        self.max_data_points = points.max(1);
        self
    }

    pub fn with_report_cache_size(mut self, size: usize) -> Self {
        self.report_cache_size = size.max(1);
        self
    }
}

/// Outcome of one roll-up pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationSummary {
    /// Metric names that had samples
    pub metrics: usize,
    /// Hourly buckets written or refreshed
    pub buckets: usize,
    /// Raw samples removed by retention
    pub pruned_samples: usize,
}

#[derive(Default)]
struct MetricStore {
    samples: HashMap<String, VecDeque<MetricSample>>,
    realtime: HashMap<String, MetricSample>,
    rollups: HashMap<String, BTreeMap<DateTime<Utc>, AggregatedMetric>>,
    /// Earliest hourly bucket per metric that received samples since the
    /// last roll-up
    pending: HashMap<String, DateTime<Utc>>,
}

impl MetricStore {
    fn window(&self, name: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<MetricSample> {
        self.samples
            .get(name)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|sample| sample.timestamp >= start && sample.timestamp < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// In-memory metric store and report generator
pub struct AnalyticsEngine {
    config: AnalyticsConfig,
    store: RwLock<MetricStore>,
    reports: Arc<RwLock<LruCache<String, AnalyticsReport>>>,
    event_bus: Option<EventBus>,
}

impl AnalyticsEngine {
    pub fn new(config: AnalyticsConfig) -> Self {
        let capacity = NonZeroUsize::new(config.report_cache_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            config,
            store: RwLock::new(MetricStore::default()),
            reports: Arc::new(RwLock::new(LruCache::new(capacity))),
            event_bus: None,
        }
    }

    /// Emit [`CoreEvent::Analytics`] notifications on `bus`
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    fn emit(&self, event: AnalyticsEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Analytics(event)).ok();
        }
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Record a sample timestamped now
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty name or a non-finite value
    pub async fn record_metric(&self, name: &str, value: f64, metadata: Metadata) -> Result<()> {
        self.record_metric_at(name, value, metadata, Utc::now()).await
    }

    /// Record a sample with an explicit timestamp
    pub async fn record_metric_at(
        &self,
        name: &str,
        value: f64,
        metadata: Metadata,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        if name.trim().is_empty() {
            return Err(ExportError::validation("name", "metric name must not be empty"));
        }
        if !value.is_finite() {
            return Err(ExportError::validation(
                "value",
                format!("metric {} value must be finite, got {}", name, value),
            ));
        }

        let sample = MetricSample {
            name: name.to_string(),
            value,
            timestamp,
            metadata,
        };

        let mut store = self.store.write().await;
        let samples = store.samples.entry(name.to_string()).or_default();
        let index = samples.partition_point(|existing| existing.timestamp <= timestamp);
        samples.insert(index, sample.clone());
        while samples.len() > self.config.max_data_points {
            samples.pop_front();
        }

        let newer = store
            .realtime
            .get(name)
            .map_or(true, |latest| latest.timestamp <= timestamp);
        if newer {
            store.realtime.insert(name.to_string(), sample);
        }

        let bucket = TimePeriod::Hour.truncate(timestamp);
        store
            .pending
            .entry(name.to_string())
            .and_modify(|earliest| *earliest = (*earliest).min(bucket))
            .or_insert(bucket);

        Ok(())
    }

    /// Record a successful job
    ///
    /// `duration` is stored as fractional seconds.
    #[instrument(skip(self, job, result), fields(job_id = %job.id, format = %job.format))]
    pub async fn record_job_completion(
        &self,
        job: &ExportJob,
        result: &ExportResult,
        duration: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let secs = duration.as_secs_f64();
        let file_size = result.file_size.or(job.file_size).unwrap_or(0);

        let mut metadata = job_metadata(job);
        metadata.insert("duration_secs".to_string(), secs.to_string());
        metadata.insert("file_size".to_string(), file_size.to_string());

        self.record_metric_at(names::JOBS_COMPLETED, 1.0, metadata.clone(), now)
            .await?;
        self.record_metric_at(names::JOBS_DURATION, secs, metadata.clone(), now)
            .await?;
        self.record_metric_at(
            &names::format_metric(job.format, "completed"),
            1.0,
            metadata.clone(),
            now,
        )
        .await?;
        self.record_metric_at(
            &names::format_metric(job.format, "file_size"),
            file_size as f64,
            metadata.clone(),
            now,
        )
        .await?;
        if let Some(user_id) = &job.user_id {
            self.record_metric_at(&names::user_metric(user_id, "completed"), 1.0, metadata, now)
                .await?;
        }

        debug!(duration_secs = secs, file_size, "Recorded job completion");
        Ok(())
    }

    /// Record a failed job, classified by [`ExportError::error_type`]
    #[instrument(skip(self, job, error), fields(job_id = %job.id, format = %job.format))]
    pub async fn record_job_failure(
        &self,
        job: &ExportJob,
        error: &ExportError,
        duration: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let secs = duration.as_secs_f64();
        let error_type = error.error_type();

        let mut metadata = job_metadata(job);
        metadata.insert("duration_secs".to_string(), secs.to_string());
        metadata.insert("error".to_string(), error.to_string());
        metadata.insert("error_type".to_string(), error_type.to_string());

        self.record_metric_at(names::JOBS_FAILED, 1.0, metadata.clone(), now)
            .await?;
        self.record_metric_at(names::JOBS_DURATION, secs, metadata.clone(), now)
            .await?;
        self.record_metric_at(
            &names::format_metric(job.format, "failed"),
            1.0,
            metadata.clone(),
            now,
        )
        .await?;
        self.record_metric_at(&names::error_metric(error_type), 1.0, metadata.clone(), now)
            .await?;
        if let Some(user_id) = &job.user_id {
            self.record_metric_at(&names::user_metric(user_id, "failed"), 1.0, metadata, now)
                .await?;
        }

        debug!(error_type, "Recorded job failure");
        Ok(())
    }

    /// Record the current number of running jobs
    pub async fn record_active_jobs(&self, active: usize) -> Result<()> {
        self.record_metric(names::JOBS_ACTIVE, active as f64, Metadata::new())
            .await
    }

    // ========================================================================
    // Reports
    // ========================================================================

    /// Build a report over `[start, end)` and cache it under a new ID
    ///
    /// # Errors
    ///
    /// Returns `Validation` when `start >= end`
    #[instrument(skip(self))]
    pub async fn generate_report(
        &self,
        period: TimePeriod,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AnalyticsReport> {
        if start >= end {
            return Err(ExportError::validation(
                "end",
                "report window end must be after its start",
            ));
        }

        let (completions, failures, durations, active) = {
            let store = self.store.read().await;
            (
                store.window(names::JOBS_COMPLETED, start, end),
                store.window(names::JOBS_FAILED, start, end),
                store.window(names::JOBS_DURATION, start, end),
                store.window(names::JOBS_ACTIVE, start, end),
            )
        };

        let midpoint = start + (end - start) / 2;
        let report = AnalyticsReport {
            report_id: Uuid::new_v4().to_string(),
            period,
            start,
            end,
            generated_at: Utc::now(),
            summary: summarize(&completions, &failures, &durations),
            formats: format_breakdown(&completions, &failures),
            errors: error_breakdown(&failures),
            users: user_breakdown(&completions, &failures),
            system: system_analytics(&completions, &failures, &durations, &active, midpoint),
        };

        self.reports
            .write()
            .await
            .put(report.report_id.clone(), report.clone());

        info!(
            report_id = %report.report_id,
            total_jobs = report.summary.total_jobs,
            success_rate = report.summary.success_rate,
            "Analytics report generated"
        );
        self.emit(AnalyticsEvent::ReportGenerated {
            report_id: report.report_id.clone(),
            period: period.as_str().to_string(),
            total_jobs: report.summary.total_jobs,
        });

        Ok(report)
    }

    /// Fetch a previously generated report
    ///
    /// # Errors
    ///
    /// Returns `ReportNotFound` if the report was never generated or has been
    /// evicted from the cache
    pub async fn get_report(&self, report_id: &str) -> Result<AnalyticsReport> {
        self.reports
            .write()
            .await
            .get(report_id)
            .cloned()
            .ok_or_else(|| ExportError::ReportNotFound {
                report_id: report_id.to_string(),
            })
    }

    pub async fn cached_report_count(&self) -> usize {
        self.reports.read().await.len()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Raw samples of `name` in `[start, end)`, oldest first
    pub async fn get_samples(
        &self,
        name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<MetricSample> {
        self.store.read().await.window(name, start, end)
    }

    /// Samples of `name` in `[start, end)` aggregated per `period` bucket
    pub async fn get_metrics(
        &self,
        name: &str,
        period: TimePeriod,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<AggregatedMetric> {
        let samples = self.get_samples(name, start, end).await;

        let mut buckets: BTreeMap<DateTime<Utc>, Vec<f64>> = BTreeMap::new();
        for sample in &samples {
            buckets
                .entry(period.truncate(sample.timestamp))
                .or_default()
                .push(sample.value);
        }

        buckets
            .into_iter()
            .filter_map(|(bucket, values)| AggregatedMetric::from_values(name, bucket, &values))
            .collect()
    }

    /// Hourly roll-ups produced by the background aggregation, oldest first
    pub async fn get_aggregated(&self, name: &str) -> Vec<AggregatedMetric> {
        self.store
            .read()
            .await
            .rollups
            .get(name)
            .map(|buckets| buckets.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Latest sample of every metric name
    pub async fn get_real_time_metrics(&self) -> HashMap<String, MetricSample> {
        self.store.read().await.realtime.clone()
    }

    pub async fn sample_count(&self, name: &str) -> usize {
        self.store
            .read()
            .await
            .samples
            .get(name)
            .map_or(0, VecDeque::len)
    }

    pub async fn metric_names(&self) -> Vec<String> {
        let store = self.store.read().await;
        let mut names: Vec<String> = store.samples.keys().cloned().collect();
        names.sort();
        names
    }

    // ========================================================================
    // Aggregation
    // ========================================================================

    /// One roll-up pass at the current time
    pub async fn aggregate_now(&self) -> AggregationSummary {
        self.aggregate_at(Utc::now()).await
    }

    /// Roll raw samples into hourly buckets, then drop everything older than
    /// the retention period relative to `now`
    ///
    /// Only buckets from the earliest one that received samples since the
    /// previous pass are recomputed. Samples are copied out under a read
    /// lock and aggregated without holding the store; the write lock is
    /// taken again only to store the results and apply retention.
    ///
    /// A stored bucket is only replaced when the recomputed one covers at
    /// least as many samples, so roll-ups survive the per-metric sample cap.
    pub async fn aggregate_at(&self, now: DateTime<Utc>) -> AggregationSummary {
        let retention = chrono::Duration::from_std(self.config.retention_period)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        let cutoff = now - retention;

        let mut guard = self.store.write().await;
        let pending = std::mem::take(&mut guard.pending);
        let guard = guard.downgrade();
        let dirty: Vec<(String, BTreeMap<DateTime<Utc>, Vec<f64>>)> = pending
            .into_iter()
            .filter_map(|(name, from)| {
                let samples = guard.samples.get(&name)?;
                let first = samples.partition_point(|sample| sample.timestamp < from);
                let mut buckets: BTreeMap<DateTime<Utc>, Vec<f64>> = BTreeMap::new();
                for sample in samples.range(first..) {
                    buckets
                        .entry(TimePeriod::Hour.truncate(sample.timestamp))
                        .or_default()
                        .push(sample.value);
                }
                Some((name, buckets))
            })
            .collect();
        drop(guard);

        let computed: Vec<AggregatedMetric> = dirty
            .iter()
            .flat_map(|(name, buckets)| {
                buckets.iter().filter_map(move |(bucket, values)| {
                    AggregatedMetric::from_values(name.as_str(), *bucket, values)
                })
            })
            .collect();

        let mut guard = self.store.write().await;
        let MetricStore {
            samples,
            realtime,
            rollups,
            ..
        } = &mut *guard;

        let mut summary = AggregationSummary {
            metrics: samples.values().filter(|s| !s.is_empty()).count(),
            ..AggregationSummary::default()
        };

        for aggregated in computed {
            let stored = rollups.entry(aggregated.name.clone()).or_default();
            let replace = stored
                .get(&aggregated.bucket_start)
                .map_or(true, |existing| aggregated.count >= existing.count);
            if replace {
                stored.insert(aggregated.bucket_start, aggregated);
                summary.buckets += 1;
            }
        }

        for metric_samples in samples.values_mut() {
            while metric_samples
                .front()
                .is_some_and(|sample| sample.timestamp < cutoff)
            {
                metric_samples.pop_front();
                summary.pruned_samples += 1;
            }
        }
        samples.retain(|_, metric_samples| !metric_samples.is_empty());

        for buckets in rollups.values_mut() {
            buckets.retain(|bucket, _| TimePeriod::Hour.next_bucket(*bucket) > cutoff);
        }
        rollups.retain(|_, buckets| !buckets.is_empty());
        realtime.retain(|_, sample| sample.timestamp >= cutoff);
        drop(guard);

        self.emit(AnalyticsEvent::AggregationCompleted {
            metrics: summary.metrics,
            buckets: summary.buckets,
            pruned_samples: summary.pruned_samples,
        });

        summary
    }

    /// Periodically run [`aggregate_now`](Self::aggregate_now) until `cancel` fires
    pub async fn run_aggregation(&self, cancel: CancellationToken) {
        let period = self
            .config
            .aggregation_period
            .max(Duration::from_millis(1));
        info!(
            interval_secs = period.as_secs(),
            "Metric aggregation job started"
        );

        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Metric aggregation job stopping");
                    break;
                }
                _ = interval.tick() => {
                    let summary = self.aggregate_now().await;
                    debug!(
                        metrics = summary.metrics,
                        buckets = summary.buckets,
                        pruned_samples = summary.pruned_samples,
                        "Metric aggregation pass finished"
                    );
                }
            }
        }
    }
}

impl Default for AnalyticsEngine {
    fn default() -> Self {
        Self::new(AnalyticsConfig::default())
    }
}

// ============================================================================
// Report Builders
// ============================================================================

fn job_metadata(job: &ExportJob) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("job_id".to_string(), job.id.to_string());
    metadata.insert("format".to_string(), job.format.as_str().to_string());
    metadata.insert("quality".to_string(), job.quality.as_str().to_string());
    if let Some(user_id) = &job.user_id {
        metadata.insert("user_id".to_string(), user_id.clone());
    }
    metadata
}

fn durations_of(samples: &[MetricSample]) -> Vec<f64> {
    samples.iter().map(|sample| sample.value).collect()
}

fn summarize(
    completions: &[MetricSample],
    failures: &[MetricSample],
    durations: &[MetricSample],
) -> SummaryAnalytics {
    let completed = completions.len() as u64;
    let failed = failures.len() as u64;
    let total = completed + failed;

    SummaryAnalytics {
        total_jobs: total,
        completed_jobs: completed,
        failed_jobs: failed,
        success_rate: success_rate(completed, total),
        average_duration_secs: mean(&durations_of(durations)),
        total_bytes_exported: completions
            .iter()
            .filter_map(|sample| sample.numeric_label("file_size"))
            .map(|size| size as u64)
            .sum(),
    }
}

#[derive(Default)]
struct FormatTally {
    completed: u64,
    failed: u64,
    sizes: Vec<f64>,
    durations: Vec<f64>,
}

fn format_breakdown(completions: &[MetricSample], failures: &[MetricSample]) -> Vec<FormatAnalytics> {
    let mut tallies: BTreeMap<String, FormatTally> = BTreeMap::new();

    for sample in completions {
        let tally = tallies.entry(format_label(sample)).or_default();
        tally.completed += 1;
        tally.sizes.extend(sample.numeric_label("file_size"));
        tally.durations.extend(sample.numeric_label("duration_secs"));
    }
    for sample in failures {
        let tally = tallies.entry(format_label(sample)).or_default();
        tally.failed += 1;
        tally.durations.extend(sample.numeric_label("duration_secs"));
    }

    let mut formats: Vec<FormatAnalytics> = tallies
        .into_iter()
        .map(|(format, tally)| {
            let total = tally.completed + tally.failed;
            FormatAnalytics {
                format,
                total_jobs: total,
                completed_jobs: tally.completed,
                failed_jobs: tally.failed,
                success_rate: success_rate(tally.completed, total),
                average_file_size: mean(&tally.sizes),
                average_duration_secs: mean(&tally.durations),
            }
        })
        .collect();
    formats.sort_by(|a, b| b.total_jobs.cmp(&a.total_jobs).then(a.format.cmp(&b.format)));
    formats
}

fn format_label(sample: &MetricSample) -> String {
    sample.label("format").unwrap_or("unknown").to_string()
}

struct ErrorTally {
    count: u64,
    formats: BTreeSet<String>,
    last_message: Option<String>,
    last_seen: DateTime<Utc>,
}

fn error_breakdown(failures: &[MetricSample]) -> Vec<ErrorAnalytics> {
    let mut tallies: BTreeMap<String, ErrorTally> = BTreeMap::new();

    for sample in failures {
        let error_type = sample.label("error_type").unwrap_or("unknown").to_string();
        let tally = tallies.entry(error_type).or_insert_with(|| ErrorTally {
            count: 0,
            formats: BTreeSet::new(),
            last_message: None,
            last_seen: sample.timestamp,
        });
        tally.count += 1;
        tally.formats.insert(format_label(sample));
        if sample.timestamp >= tally.last_seen {
            tally.last_seen = sample.timestamp;
            tally.last_message = sample.label("error").map(str::to_string);
        }
    }

    let total_failures = failures.len() as u64;
    let mut errors: Vec<ErrorAnalytics> = tallies
        .into_iter()
        .map(|(error_type, tally)| ErrorAnalytics {
            error_type,
            count: tally.count,
            percentage: success_rate(tally.count, total_failures),
            affected_formats: tally.formats.into_iter().collect(),
            last_message: tally.last_message,
            last_seen: tally.last_seen,
        })
        .collect();
    errors.sort_by(|a, b| b.count.cmp(&a.count).then(a.error_type.cmp(&b.error_type)));
    errors
}

struct UserTally {
    total: u64,
    completed: u64,
    formats: HashMap<String, u64>,
    last_activity: DateTime<Utc>,
}

fn user_breakdown(completions: &[MetricSample], failures: &[MetricSample]) -> Vec<UserAnalytics> {
    let mut tallies: BTreeMap<String, UserTally> = BTreeMap::new();

    let outcomes = completions
        .iter()
        .map(|sample| (sample, true))
        .chain(failures.iter().map(|sample| (sample, false)));
    for (sample, succeeded) in outcomes {
        let Some(user_id) = sample.label("user_id") else {
            continue;
        };
        let tally = tallies
            .entry(user_id.to_string())
            .or_insert_with(|| UserTally {
                total: 0,
                completed: 0,
                formats: HashMap::new(),
                last_activity: sample.timestamp,
            });
        tally.total += 1;
        if succeeded {
            tally.completed += 1;
        }
        *tally.formats.entry(format_label(sample)).or_default() += 1;
        tally.last_activity = tally.last_activity.max(sample.timestamp);
    }

    let mut users: Vec<UserAnalytics> = tallies
        .into_iter()
        .map(|(user_id, tally)| {
            let mut formats: Vec<(String, u64)> = tally.formats.into_iter().collect();
            formats.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

            UserAnalytics {
                user_id,
                total_jobs: tally.total,
                completed_jobs: tally.completed,
                success_rate: success_rate(tally.completed, tally.total),
                preferred_formats: formats.into_iter().take(3).map(|(f, _)| f).collect(),
                last_activity: tally.last_activity,
            }
        })
        .collect();
    users.sort_by(|a, b| b.total_jobs.cmp(&a.total_jobs).then(a.user_id.cmp(&b.user_id)));
    users
}

fn system_analytics(
    completions: &[MetricSample],
    failures: &[MetricSample],
    durations: &[MetricSample],
    active: &[MetricSample],
    midpoint: DateTime<Utc>,
) -> SystemAnalytics {
    let before = |sample: &&MetricSample| sample.timestamp < midpoint;
    let after = |sample: &&MetricSample| sample.timestamp >= midpoint;

    let completed_first = completions.iter().filter(before).count() as u64;
    let completed_second = completions.iter().filter(after).count() as u64;
    let failed_first = failures.iter().filter(before).count() as u64;
    let failed_second = failures.iter().filter(after).count() as u64;
    let total_first = completed_first + failed_first;
    let total_second = completed_second + failed_second;

    let duration_first: Vec<f64> = durations.iter().filter(before).map(|s| s.value).collect();
    let duration_second: Vec<f64> = durations.iter().filter(after).map(|s| s.value).collect();

    let load = durations_of(active);

    SystemAnalytics {
        peak_concurrency: load.iter().copied().fold(0.0, f64::max) as u64,
        average_load: mean(&load),
        volume_trend: Trend::between(total_first as f64, total_second as f64),
        success_trend: Trend::between(
            success_rate(completed_first, total_first),
            success_rate(completed_second, total_second),
        ),
        duration_trend: Trend::between(mean(&duration_first), mean(&duration_second)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExportFormat, ExportQuality};
    use chrono::TimeZone;

    fn finished_job(format: ExportFormat, user: Option<&str>) -> ExportJob {
        let job = ExportJob::new(format, ExportQuality::Standard, "/tmp/out");
        let job = match user {
            Some(user) => job.with_user(user),
            None => job,
        };
        job.start().unwrap()
    }

    async fn record_success(engine: &AnalyticsEngine, format: ExportFormat, user: Option<&str>, size: u64) {
        let job = finished_job(format, user).complete(size).unwrap();
        let result = ExportResult::from_job(&job);
        engine
            .record_job_completion(&job, &result, Duration::from_secs(2))
            .await
            .unwrap();
    }

    async fn record_failure(engine: &AnalyticsEngine, format: ExportFormat, user: Option<&str>, error: ExportError) {
        let job = finished_job(format, user).fail(error.to_string()).unwrap();
        engine
            .record_job_failure(&job, &error, Duration::from_secs(4))
            .await
            .unwrap();
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (now - chrono::Duration::hours(1), now + chrono::Duration::hours(1))
    }

    #[tokio::test]
    async fn test_record_metric_validation() {
        let engine = AnalyticsEngine::default();
        assert!(engine.record_metric("", 1.0, Metadata::new()).await.is_err());
        assert!(engine
            .record_metric("latency", f64::INFINITY, Metadata::new())
            .await
            .is_err());
        assert!(engine.metric_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_max_data_points_drops_oldest() {
        let engine = AnalyticsEngine::new(AnalyticsConfig::default().with_max_data_points(3));
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        for i in 0..4 {
            engine
                .record_metric_at(
                    "latency",
                    f64::from(i),
                    Metadata::new(),
                    base + chrono::Duration::seconds(i64::from(i)),
                )
                .await
                .unwrap();
        }

        let samples = engine
            .get_samples("latency", base, base + chrono::Duration::hours(1))
            .await;
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_out_of_order_samples_stay_sorted() {
        let engine = AnalyticsEngine::new(AnalyticsConfig::default().with_max_data_points(2));
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        engine
            .record_metric_at("m", 2.0, Metadata::new(), base + chrono::Duration::seconds(2))
            .await
            .unwrap();
        engine
            .record_metric_at("m", 3.0, Metadata::new(), base + chrono::Duration::seconds(3))
            .await
            .unwrap();
        engine
            .record_metric_at("m", 1.0, Metadata::new(), base + chrono::Duration::seconds(1))
            .await
            .unwrap();

        let values: Vec<f64> = engine
            .get_samples("m", base, base + chrono::Duration::minutes(1))
            .await
            .iter()
            .map(|s| s.value)
            .collect();
        assert_eq!(values, vec![2.0, 3.0]);

        // The late sample never replaces the latest real-time value.
        let realtime = engine.get_real_time_metrics().await;
        assert_eq!(realtime["m"].value, 3.0);
    }

    #[tokio::test]
    async fn test_real_time_metrics_one_per_name() {
        let engine = AnalyticsEngine::default();
        engine.record_active_jobs(2).await.unwrap();
        engine.record_active_jobs(5).await.unwrap();
        engine.record_metric("queue.depth", 9.0, Metadata::new()).await.unwrap();

        let realtime = engine.get_real_time_metrics().await;
        assert_eq!(realtime.len(), 2);
        assert_eq!(realtime[names::JOBS_ACTIVE].value, 5.0);
    }

    #[tokio::test]
    async fn test_report_without_jobs_has_zero_success_rate() {
        let engine = AnalyticsEngine::default();
        let (start, end) = window();

        let report = engine.generate_report(TimePeriod::Day, start, end).await.unwrap();
        assert_eq!(report.summary.total_jobs, 0);
        assert_eq!(report.summary.success_rate, 0.0);
        assert!(!report.summary.success_rate.is_nan());
        assert!(report.formats.is_empty());
        assert_eq!(report.system.volume_trend, Trend::Stable);
    }

    #[tokio::test]
    async fn test_report_rejects_empty_window() {
        let engine = AnalyticsEngine::default();
        let now = Utc::now();
        let err = engine
            .generate_report(TimePeriod::Hour, now, now)
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_report_breakdowns() {
        let engine = AnalyticsEngine::default();
        record_success(&engine, ExportFormat::Json, Some("alice"), 1000).await;
        record_success(&engine, ExportFormat::Json, Some("alice"), 3000).await;
        record_success(&engine, ExportFormat::Csv, Some("bob"), 500).await;
        record_failure(
            &engine,
            ExportFormat::Pdf,
            Some("alice"),
            ExportError::Conversion("bad geometry".to_string()),
        )
        .await;
        engine.record_active_jobs(3).await.unwrap();
        engine.record_active_jobs(1).await.unwrap();

        let (start, end) = window();
        let report = engine.generate_report(TimePeriod::Day, start, end).await.unwrap();

        assert_eq!(report.summary.total_jobs, 4);
        assert_eq!(report.summary.completed_jobs, 3);
        assert_eq!(report.summary.failed_jobs, 1);
        assert_eq!(report.summary.success_rate, 75.0);
        assert_eq!(report.summary.average_duration_secs, 2.5);
        assert_eq!(report.summary.total_bytes_exported, 4500);

        let json = &report.formats[0];
        assert_eq!(json.format, "json");
        assert_eq!(json.total_jobs, 2);
        assert_eq!(json.success_rate, 100.0);
        assert_eq!(json.average_file_size, 2000.0);

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].error_type, "conversion_error");
        assert_eq!(report.errors[0].percentage, 100.0);
        assert_eq!(report.errors[0].affected_formats, vec!["pdf".to_string()]);
        assert_eq!(
            report.errors[0].last_message.as_deref(),
            Some("Conversion failed: bad geometry")
        );

        let alice = &report.users[0];
        assert_eq!(alice.user_id, "alice");
        assert_eq!(alice.total_jobs, 3);
        assert_eq!(alice.preferred_formats, vec!["json".to_string(), "pdf".to_string()]);

        assert_eq!(report.system.peak_concurrency, 3);
        assert_eq!(report.system.average_load, 2.0);
    }

    #[tokio::test]
    async fn test_reports_are_cached() {
        let engine = AnalyticsEngine::new(AnalyticsConfig::default().with_report_cache_size(1));
        let (start, end) = window();

        let first = engine.generate_report(TimePeriod::Day, start, end).await.unwrap();
        assert_eq!(engine.get_report(&first.report_id).await.unwrap(), first);

        let second = engine.generate_report(TimePeriod::Week, start, end).await.unwrap();
        assert_ne!(first.report_id, second.report_id);
        assert!(matches!(
            engine.get_report(&first.report_id).await,
            Err(ExportError::ReportNotFound { .. })
        ));
        assert_eq!(engine.cached_report_count().await, 1);
    }

    #[tokio::test]
    async fn test_volume_trend() {
        let engine = AnalyticsEngine::default();
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let end = start + chrono::Duration::hours(2);

        let early = start + chrono::Duration::minutes(10);
        let late = start + chrono::Duration::minutes(90);
        engine
            .record_metric_at(names::JOBS_COMPLETED, 1.0, Metadata::new(), early)
            .await
            .unwrap();
        for _ in 0..3 {
            engine
                .record_metric_at(names::JOBS_COMPLETED, 1.0, Metadata::new(), late)
                .await
                .unwrap();
        }

        let report = engine.generate_report(TimePeriod::Hour, start, end).await.unwrap();
        assert_eq!(report.system.volume_trend, Trend::Increasing);
        assert_eq!(report.system.success_trend, Trend::Stable);
    }

    #[tokio::test]
    async fn test_get_metrics_by_period() {
        let engine = AnalyticsEngine::default();
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 10, 15, 0).unwrap();
        for (offset, value) in [(0, 1.0), (20, 3.0), (70, 10.0)] {
            engine
                .record_metric_at(
                    "latency",
                    value,
                    Metadata::new(),
                    base + chrono::Duration::minutes(offset),
                )
                .await
                .unwrap();
        }

        let hourly = engine
            .get_metrics(
                "latency",
                TimePeriod::Hour,
                base - chrono::Duration::hours(1),
                base + chrono::Duration::hours(3),
            )
            .await;
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[0].count, 2);
        assert_eq!(hourly[0].avg, 2.0);
        assert_eq!(hourly[1].max, 10.0);

        let daily = engine
            .get_metrics(
                "latency",
                TimePeriod::Day,
                base - chrono::Duration::hours(1),
                base + chrono::Duration::hours(3),
            )
            .await;
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].count, 3);
    }

    #[tokio::test]
    async fn test_aggregation_rolls_up_and_prunes() {
        let engine = AnalyticsEngine::new(
            AnalyticsConfig::default().with_retention_period(Duration::from_secs(2 * 60 * 60)),
        );
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 30, 0).unwrap();
        let stale = now - chrono::Duration::hours(5);

        engine
            .record_metric_at("latency", 4.0, Metadata::new(), stale)
            .await
            .unwrap();
        engine
            .record_metric_at("latency", 2.0, Metadata::new(), now)
            .await
            .unwrap();
        engine
            .record_metric_at("latency", 6.0, Metadata::new(), now)
            .await
            .unwrap();

        let summary = engine.aggregate_at(now).await;
        assert_eq!(summary.metrics, 1);
        assert_eq!(summary.buckets, 2);
        assert_eq!(summary.pruned_samples, 1);

        let rollups = engine.get_aggregated("latency").await;
        assert_eq!(rollups.len(), 1);
        assert_eq!(rollups[0].count, 2);
        assert_eq!(rollups[0].avg, 4.0);
        assert_eq!(engine.sample_count("latency").await, 2);
    }

    #[tokio::test]
    async fn test_aggregation_keeps_larger_bucket() {
        let engine = AnalyticsEngine::new(AnalyticsConfig::default().with_max_data_points(2));
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 30, 0).unwrap();
        for value in [1.0, 2.0] {
            engine
                .record_metric_at("m", value, Metadata::new(), now)
                .await
                .unwrap();
        }
        engine.aggregate_at(now).await;

        // The cap pushes out the oldest sample; the earlier roll-up stays.
        engine
            .record_metric_at("m", 3.0, Metadata::new(), now + chrono::Duration::hours(1))
            .await
            .unwrap();
        engine.aggregate_at(now).await;

        let rollups = engine.get_aggregated("m").await;
        assert_eq!(rollups.len(), 2);
        let current = rollups
            .iter()
            .find(|r| r.bucket_start == TimePeriod::Hour.truncate(now))
            .unwrap();
        assert_eq!(current.count, 2);
        assert_eq!(current.sum, 3.0);
    }

    #[tokio::test]
    async fn test_aggregation_rolls_only_buckets_with_new_samples() {
        let engine = AnalyticsEngine::default();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 30, 0).unwrap();
        let earlier = now - chrono::Duration::hours(3);

        engine
            .record_metric_at("m", 1.0, Metadata::new(), earlier)
            .await
            .unwrap();
        engine
            .record_metric_at("m", 5.0, Metadata::new(), now)
            .await
            .unwrap();
        assert_eq!(engine.aggregate_at(now).await.buckets, 2);

        // Nothing new: nothing recomputed.
        assert_eq!(engine.aggregate_at(now).await.buckets, 0);

        engine
            .record_metric_at("m", 7.0, Metadata::new(), now)
            .await
            .unwrap();
        assert_eq!(engine.aggregate_at(now).await.buckets, 1);

        // A late sample for an older hour reopens that hour and the ones after it.
        engine
            .record_metric_at("m", 3.0, Metadata::new(), earlier)
            .await
            .unwrap();
        assert_eq!(engine.aggregate_at(now).await.buckets, 2);

        let rollups = engine.get_aggregated("m").await;
        let old = rollups
            .iter()
            .find(|r| r.bucket_start == TimePeriod::Hour.truncate(earlier))
            .unwrap();
        assert_eq!(old.count, 2);
        assert_eq!(old.sum, 4.0);
        let current = rollups
            .iter()
            .find(|r| r.bucket_start == TimePeriod::Hour.truncate(now))
            .unwrap();
        assert_eq!(current.count, 2);
        assert_eq!(current.max, 7.0);
    }

    #[tokio::test]
    async fn test_aggregation_event_emitted() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let engine = AnalyticsEngine::default().with_event_bus(bus);

        engine.aggregate_now().await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            CoreEvent::Analytics(AnalyticsEvent::AggregationCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_metrics_recorded() {
        let engine = AnalyticsEngine::default();
        record_failure(&engine, ExportFormat::Step, Some("carol"), ExportError::Timeout(Duration::from_secs(30))).await;

        let recorded = engine.metric_names().await;
        assert!(recorded.contains(&"export.errors.timeout".to_string()));
        assert!(recorded.contains(&"export.format.step.failed".to_string()));
        assert!(recorded.contains(&"export.user.carol.failed".to_string()));
        assert!(recorded.contains(&names::JOBS_DURATION.to_string()));
        assert!(!recorded.contains(&names::JOBS_COMPLETED.to_string()));
    }
}
