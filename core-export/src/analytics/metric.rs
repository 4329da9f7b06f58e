use crate::{ExportError, Result};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Free-form labels attached to a metric sample
pub type Metadata = BTreeMap<String, String>;

/// One recorded value of a named metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
}

impl MetricSample {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Parse a numeric label, ignoring missing or malformed values
    pub fn numeric_label(&self, key: &str) -> Option<f64> {
        self.label(key)
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite())
    }
}

// ============================================================================
// Time Periods
// ============================================================================

/// Calendar granularity for buckets and reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimePeriod {
    Hour,
    Day,
    Week,
    Month,
}

impl TimePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimePeriod::Hour => "hour",
            TimePeriod::Day => "day",
            TimePeriod::Week => "week",
            TimePeriod::Month => "month",
        }
    }

    /// Start of the bucket containing `ts` (weeks start on Monday)
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let date = ts.date_naive();
        let start = match self {
            TimePeriod::Hour => return start_of_hour(ts),
            TimePeriod::Day => Some(date),
            TimePeriod::Week => {
                Some(date - Duration::days(i64::from(date.weekday().num_days_from_monday())))
            }
            TimePeriod::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1),
        };

        start
            .and_then(|day| day.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(ts)
    }

    /// Start of the bucket following the one that starts at `bucket_start`
    pub fn next_bucket(&self, bucket_start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimePeriod::Hour => bucket_start + Duration::hours(1),
            TimePeriod::Day => bucket_start + Duration::days(1),
            TimePeriod::Week => bucket_start + Duration::weeks(1),
            TimePeriod::Month => bucket_start
                .checked_add_months(Months::new(1))
                .unwrap_or(bucket_start + Duration::days(31)),
        }
    }
}

fn start_of_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_minute(0))
        .unwrap_or(ts)
}

impl FromStr for TimePeriod {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "hour" | "hourly" => Ok(TimePeriod::Hour),
            "day" | "daily" => Ok(TimePeriod::Day),
            "week" | "weekly" => Ok(TimePeriod::Week),
            "month" | "monthly" => Ok(TimePeriod::Month),
            _ => Err(ExportError::validation(
                "period",
                format!("unknown time period '{}'", s),
            )),
        }
    }
}

impl std::fmt::Display for TimePeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Aggregation
// ============================================================================

/// Summary statistics of one metric over one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetric {
    pub name: String,
    pub bucket_start: DateTime<Utc>,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p95: f64,
    pub p99: f64,
}

impl AggregatedMetric {
    /// Aggregate `values`; `None` when there are none
    pub fn from_values(
        name: impl Into<String>,
        bucket_start: DateTime<Utc>,
        values: &[f64],
    ) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        let sum: f64 = sorted.iter().sum();
        let count = sorted.len();

        Some(Self {
            name: name.into(),
            bucket_start,
            count: count as u64,
            sum,
            min: sorted[0],
            max: sorted[count - 1],
            avg: sum / count as f64,
            p95: nearest_rank(&sorted, 95.0),
            p99: nearest_rank(&sorted, 99.0),
        })
    }
}

/// Nearest-rank percentile of an ascending, non-empty slice
pub(crate) fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let n = sorted.len();
    let rank = ((percentile / 100.0) * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}
