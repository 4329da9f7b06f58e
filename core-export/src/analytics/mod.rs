//! Operational metrics and reports for export jobs.

mod engine;
mod metric;
mod report;

pub use engine::{names, AggregationSummary, AnalyticsConfig, AnalyticsEngine};
pub use metric::{AggregatedMetric, Metadata, MetricSample, TimePeriod};
pub use report::{
    success_rate, AnalyticsReport, ErrorAnalytics, FormatAnalytics, SummaryAnalytics,
    SystemAnalytics, Trend, UserAnalytics, TREND_DEAD_BAND,
};
