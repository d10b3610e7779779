//! # Time-Series Store Module
//!
//! Abstraction over the time-series database the bridge writes into.
//!
//! This module handles:
//! - The [`Point`] write payload (measurement, tags, fields, Unix-second timestamp)
//! - InfluxDB Line Protocol encoding
//! - Range queries split into time buckets
//! - The [`InfluxStore`] HTTP client

pub mod influx;
pub mod line_protocol;
pub mod query;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::Result;

pub use influx::InfluxStore;
pub use line_protocol::FieldValue;
pub use query::RangeQuery;

/// One result row from a range query (`[time, mean]` for the bridge's queries)
pub type Row = Vec<serde_json::Value>;

/// A fully-formed time-series write payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: Vec<(String, FieldValue)>,
    /// Unix timestamp in seconds
    pub timestamp: i64,
}

impl Point {
    /// Start a point for `measurement` at timestamp 0
    pub fn new(measurement: &str) -> Self {
        Self {
            measurement: measurement.to_string(),
            tags: BTreeMap::new(),
            fields: Vec::new(),
            timestamp: 0,
        }
    }

    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn field(mut self, key: &str, value: FieldValue) -> Self {
        self.fields.push((key.to_string(), value));
        self
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn field_value(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Encode as a single Line Protocol line (second precision)
    pub fn to_line_protocol(&self) -> String {
        line_protocol::encode(self)
    }
}

/// Trait for the time-series database operations the bridge needs
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Write a single point
    async fn write_point(&self, point: &Point) -> Result<()>;

    /// Run a bucketed range query
    async fn query_range(&self, query: &RangeQuery) -> Result<Vec<Row>>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<()>;
}
