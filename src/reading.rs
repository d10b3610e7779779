//! # Sensor Reading Model
//!
//! Normalized in-memory shape of one telemetry payload.
//!
//! ## Wire Format
//!
//! ```text
//! { "timestamp": 1722500000 | "1722500000",
//!   "value":     [21.5, null, ...],
//!   "sequence":  42,
//!   "meta":      [ { ...reading... }, null, ... ] | null }
//! ```
//!
//! Field names are matched case-insensitively and unknown fields are ignored.
//! A `meta` that is absent, `null`, `[]` or holds only `null` entries decodes
//! to "no batch" (`batch == None`), so it is never re-encoded as an empty list
//! or a list of nulls.

use serde::de::{self, Deserializer, IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// One telemetry reading, or a container for a recovered backlog of readings.
///
/// A reading with a non-empty `batch` is a *batch container*; its own
/// `values` and `sequence` are ignored.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Reading {
    /// Unix timestamp in seconds
    #[serde(rename = "timestamp")]
    pub timestamp: i64,

    /// Value slots; a sensor may leave a slot `null`
    #[serde(rename = "value")]
    pub values: Vec<Option<f64>>,

    #[serde(rename = "sequence", skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i32>,

    /// Recovered readings; never `Some(vec![])`
    #[serde(rename = "meta", skip_serializing_if = "Option::is_none")]
    pub batch: Option<Vec<Reading>>,
}

/// What the leaf-processing rule makes of a reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LeafValue {
    /// Exactly one populated value, in the leading slot
    Single(f64),
    /// No populated value in the leading slot
    Empty,
    /// More than one populated value (count attached)
    Multiple(usize),
    /// Batch-shaped data where a leaf was expected
    Batch,
}

impl Reading {
    /// Leaf reading with a single value
    pub fn single(timestamp: i64, value: f64, sequence: Option<i32>) -> Self {
        Self {
            timestamp,
            values: vec![Some(value)],
            sequence,
            batch: None,
        }
    }

    /// Batch container wrapping recovered leaves
    pub fn recovered(leaves: Vec<Reading>) -> Self {
        Self {
            batch: normalize_batch(leaves.into_iter().map(Some).collect()),
            ..Self::default()
        }
    }

    /// Decode a raw broker payload
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Json` if the payload is not a JSON object of the
    /// expected shape.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Encode back to the wire format
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether this reading carries a non-empty batch
    pub fn is_batch(&self) -> bool {
        self.batch.as_ref().is_some_and(|b| !b.is_empty())
    }

    /// Number of populated (non-null) value slots
    pub fn populated_values(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    /// Apply the leaf rule: only a single populated leading value is usable.
    pub fn leaf_value(&self) -> LeafValue {
        if self.is_batch() {
            return LeafValue::Batch;
        }

        match self.populated_values() {
            0 => LeafValue::Empty,
            1 => match self.values.first() {
                Some(Some(value)) => LeafValue::Single(*value),
                _ => LeafValue::Empty,
            },
            n => LeafValue::Multiple(n),
        }
    }

    /// Take the recovered leaves out of a batch container
    pub fn into_batch(self) -> Vec<Reading> {
        self.batch.unwrap_or_default()
    }
}

/// Collapse a list of nullable readings.
///
/// Null placeholders are removed; if nothing is left the batch is absent.
pub fn normalize_batch(items: Vec<Option<Reading>>) -> Option<Vec<Reading>> {
    let readings: Vec<Reading> = items.into_iter().flatten().collect();
    if readings.is_empty() {
        None
    } else {
        Some(readings)
    }
}

impl<'de> Deserialize<'de> for Reading {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(ReadingVisitor)
    }
}

struct ReadingVisitor;

impl<'de> Visitor<'de> for ReadingVisitor {
    type Value = Reading;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a sensor reading object")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<Reading, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut reading = Reading::default();

        while let Some(key) = map.next_key::<String>()? {
            if key.eq_ignore_ascii_case("timestamp") {
                reading.timestamp = map.next_value::<UnixTimestamp>()?.0;
            } else if key.eq_ignore_ascii_case("value") {
                reading.values = map
                    .next_value::<Option<Vec<Option<f64>>>>()?
                    .unwrap_or_default();
            } else if key.eq_ignore_ascii_case("sequence") {
                reading.sequence = map.next_value::<Option<i32>>()?;
            } else if key.eq_ignore_ascii_case("meta") {
                reading.batch = map
                    .next_value::<Option<Vec<Option<Reading>>>>()?
                    .and_then(normalize_batch);
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }

        Ok(reading)
    }
}

/// Unix timestamp that accepts a JSON number or a numeric string
struct UnixTimestamp(i64);

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(UnixTimestampVisitor)
    }
}

struct UnixTimestampVisitor;

impl<'de> Visitor<'de> for UnixTimestampVisitor {
    type Value = UnixTimestamp;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an integer Unix timestamp or a string containing one")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<UnixTimestamp, E> {
        Ok(UnixTimestamp(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<UnixTimestamp, E> {
        i64::try_from(v)
            .map(UnixTimestamp)
            .map_err(|_| E::custom(format!("timestamp {} out of range", v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<UnixTimestamp, E> {
        v.trim()
            .parse::<i64>()
            .map(UnixTimestamp)
            .map_err(|_| E::custom(format!("timestamp {:?} is not an integer", v)))
    }
}
