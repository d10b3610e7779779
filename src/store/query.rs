//! Range queries over the time-series store.
//!
//! A range is split into two-day buckets so no single InfluxQL statement
//! scans an unbounded window, and the `GROUP BY time()` resolution follows
//! the overall span of the request.

use chrono::{DateTime, Duration, Utc};

/// Width of one query bucket
pub const BUCKET_DAYS: i64 = 2;

/// Mean-value query for one tag over `[start, end]`
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    pub measurement: String,
    pub tag_key: String,
    pub tag_value: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl RangeQuery {
    /// Indoor sensor readings for one sensor
    pub fn sensor(sensor: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            measurement: "temperature".to_string(),
            tag_key: "sensor".to_string(),
            tag_value: sensor.to_string(),
            start,
            end,
        }
    }

    /// Outside weather for one place
    pub fn outside_weather(place: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            measurement: "outside_temperature".to_string(),
            tag_key: "place".to_string(),
            tag_value: place.to_string(),
            start,
            end,
        }
    }

    /// `GROUP BY time()` interval for the whole request span
    pub fn group_interval(&self) -> &'static str {
        let span = self.end - self.start;
        if span < Duration::hours(24) {
            "1m"
        } else if span < Duration::days(30) {
            "1h"
        } else {
            "1d"
        }
    }

    /// Consecutive `[bucket_start, bucket_end]` windows covering the range.
    ///
    /// An empty or inverted range yields no buckets.
    pub fn buckets(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let width = Duration::days(BUCKET_DAYS);
        let mut buckets = Vec::new();
        let mut bucket_start = self.start;

        while bucket_start < self.end {
            let bucket_end = (bucket_start + width).min(self.end);
            buckets.push((bucket_start, bucket_end));
            bucket_start = bucket_end;
        }

        buckets
    }

    /// InfluxQL statements, one per bucket
    pub fn statements(&self) -> Vec<String> {
        let group = self.group_interval();
        self.buckets()
            .into_iter()
            .map(|(start, end)| {
                format!(
                    "SELECT MEAN(value) FROM {} WHERE {}='{}' AND time >= '{}' AND time <= '{}' GROUP BY time({}) fill(none)",
                    self.measurement,
                    self.tag_key,
                    escape_string(&self.tag_value),
                    start.format("%Y-%m-%d %H:%M:%S"),
                    end.format("%Y-%m-%d %H:%M:%S"),
                    group,
                )
            })
            .collect()
    }
}

/// Escape a value for an InfluxQL single-quoted string literal.
fn escape_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
