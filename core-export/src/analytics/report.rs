use super::metric::TimePeriod;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Relative change below which a trend counts as stable
pub const TREND_DEAD_BAND: f64 = 0.10;

/// Immutable analytics snapshot for a `[start, end)` window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub report_id: String,
    pub period: TimePeriod,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub summary: SummaryAnalytics,
    /// Busiest format first
    pub formats: Vec<FormatAnalytics>,
    /// Most frequent error first
    pub errors: Vec<ErrorAnalytics>,
    /// Most active user first
    pub users: Vec<UserAnalytics>,
    pub system: SystemAnalytics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryAnalytics {
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    /// Percentage 0-100; 0 when there were no jobs
    pub success_rate: f64,
    pub average_duration_secs: f64,
    pub total_bytes_exported: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatAnalytics {
    pub format: String,
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub success_rate: f64,
    /// Mean size in bytes of successful exports
    pub average_file_size: f64,
    pub average_duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalytics {
    pub error_type: String,
    pub count: u64,
    /// Share of all failures in the window, 0-100
    pub percentage: f64,
    pub affected_formats: Vec<String>,
    pub last_message: Option<String>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAnalytics {
    pub user_id: String,
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub success_rate: f64,
    /// Up to three formats, most used first
    pub preferred_formats: Vec<String>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAnalytics {
    /// Highest number of concurrently running jobs observed
    pub peak_concurrency: u64,
    /// Mean of the observed concurrency samples
    pub average_load: f64,
    pub volume_trend: Trend,
    pub success_trend: Trend,
    pub duration_trend: Trend,
}

impl Default for SystemAnalytics {
    fn default() -> Self {
        Self {
            peak_concurrency: 0,
            average_load: 0.0,
            volume_trend: Trend::Stable,
            success_trend: Trend::Stable,
            duration_trend: Trend::Stable,
        }
    }
}

/// Direction of change between the first and second half of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl Trend {
    /// Compare two values with a relative dead band of [`TREND_DEAD_BAND`]
    pub fn between(first: f64, second: f64) -> Trend {
        if first == 0.0 {
            return if second > 0.0 {
                Trend::Increasing
            } else {
                Trend::Stable
            };
        }

        let change = (second - first) / first.abs();
        if change > TREND_DEAD_BAND {
            Trend::Increasing
        } else if change < -TREND_DEAD_BAND {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Increasing => "increasing",
            Trend::Decreasing => "decreasing",
            Trend::Stable => "stable",
        }
    }
}

/// `completed / total * 100`, or 0 when `total` is 0
pub fn success_rate(completed: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        completed as f64 / total as f64 * 100.0
    }
}

/// Mean of `values`, or 0 when empty
pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_without_jobs_is_zero() {
        assert_eq!(success_rate(0, 0), 0.0);
        assert_eq!(success_rate(3, 4), 75.0);
        assert_eq!(success_rate(5, 5), 100.0);
    }

    #[test]
    fn test_trend_dead_band() {
        assert_eq!(Trend::between(100.0, 105.0), Trend::Stable);
        assert_eq!(Trend::between(100.0, 95.0), Trend::Stable);
        assert_eq!(Trend::between(100.0, 120.0), Trend::Increasing);
        assert_eq!(Trend::between(100.0, 50.0), Trend::Decreasing);
        assert_eq!(Trend::between(0.0, 0.0), Trend::Stable);
        assert_eq!(Trend::between(0.0, 3.0), Trend::Increasing);
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[1.0, 2.0, 6.0]), 3.0);
    }
}
