//! Aggregate queries issued on each wakeup.

use super::channel::SensorChannel;
use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Category value marking an in-bed sleep sample.
pub const IN_BED: i64 = 0;

/// Time zone used to find the start of a day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Zone {
    Local,
    Named(Tz),
}

impl Zone {
    /// Midnight of the local day containing `instant`.
    pub fn start_of_day(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Zone::Local => start_of_day_in(&Local, instant),
            Zone::Named(tz) => start_of_day_in(tz, instant),
        }
    }
}

fn start_of_day_in<Z: TimeZone>(zone: &Z, instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .with_timezone(zone)
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| zone.from_local_datetime(&midnight).earliest())
        .map(|start| start.with_timezone(&Utc))
        .unwrap_or(instant)
}

/// Trailing window a query covers, always ending now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryWindow {
    /// Start of the current day.
    Today,
    /// Start of the day seven days ago.
    TrailingWeek,
}

impl QueryWindow {
    pub fn range_at(self, now: DateTime<Utc>, zone: &Zone) -> TimeRange {
        let start = match self {
            QueryWindow::Today => zone.start_of_day(now),
            QueryWindow::TrailingWeek => zone.start_of_day(now - Duration::days(7)),
        };
        TimeRange { start, end: now }
    }
}

/// Half-open-at-start, closed-at-end interval: samples must end inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant <= self.end
    }
}

/// How a query reduces samples to one scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregationKind {
    /// Sum of a counted quantity.
    CumulativeSum,
    /// Total hours of category samples carrying `qualifying_value`.
    QualifyingDuration { qualifying_value: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateQuery {
    pub channel: SensorChannel,
    pub range: TimeRange,
    pub aggregation: AggregationKind,
}

/// A counted quantity measured at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantitySample {
    pub at: DateTime<Utc>,
    pub amount: f64,
}

/// A categorized interval, such as one sleep-analysis entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategorySample {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub value: i64,
}

impl CategorySample {
    pub fn duration_hours(&self) -> f64 {
        (self.end - self.start).num_milliseconds() as f64 / 3_600_000.0
    }
}

/// Sum of quantities measured inside `range`.
pub fn cumulative_sum(samples: &[QuantitySample], range: &TimeRange) -> f64 {
    samples
        .iter()
        .filter(|s| range.contains(s.at))
        .map(|s| s.amount)
        .sum()
}

/// Total hours of samples whose value equals `qualifying_value`.
/// Other samples contribute nothing.
pub fn total_qualifying_hours(samples: &[CategorySample], qualifying_value: i64) -> f64 {
    samples
        .iter()
        .filter(|s| s.value == qualifying_value)
        .map(CategorySample::duration_hours)
        .sum()
}
