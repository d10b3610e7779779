//! # Write-Through Cache Gateway
//!
//! Wraps the time-series store's write path. A write that fails is parked in
//! an in-memory pending table instead of being reported to the caller; the
//! retry sweeper drains that table later.
//!
//! ## Data-Loss Boundary
//!
//! Pending points live in memory only. A crash or restart before a successful
//! retry loses them. The table is also capped at `max_pending` entries;
//! inserting beyond the cap evicts the oldest entry and counts it in
//! [`CacheGateway::dropped_count`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{FieldValue, Point, RangeQuery, Row, TimeSeriesStore};

/// Measurement for indoor sensor readings
pub const SENSOR_MEASUREMENT: &str = "temperature";

/// Measurement for polled outside weather
pub const WEATHER_MEASUREMENT: &str = "outside_temperature";

/// Identity of a pending point.
///
/// Keys are handed out in increasing order, so the smallest key is the
/// oldest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(u64);

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pending:{}", self.0)
    }
}

/// Write-through gateway in front of a [`TimeSeriesStore`]
pub struct CacheGateway {
    store: Arc<dyn TimeSeriesStore>,
    pending: DashMap<CacheKey, Point>,
    /// Keys in insertion order; may still hold keys flushed since
    order: Mutex<VecDeque<CacheKey>>,
    next_key: AtomicU64,
    max_pending: usize,
    dropped: AtomicU64,
}

impl fmt::Debug for CacheGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheGateway")
            .field("pending", &self.pending.len())
            .field("max_pending", &self.max_pending)
            .field("dropped", &self.dropped_count())
            .finish_non_exhaustive()
    }
}

/// Build the `temperature` point for one sensor reading
pub fn sensor_point(value: f64, sensor: &str, timestamp: i64, sequence: i32) -> Point {
    Point::new(SENSOR_MEASUREMENT)
        .tag("sensor", sensor)
        .tag("sequence", sequence.to_string())
        .field("value", FieldValue::Float(value))
        .at(timestamp)
}

impl CacheGateway {
    /// Create a gateway
    ///
    /// # Arguments
    ///
    /// * `store` - Backing time-series store
    /// * `max_pending` - Pending-table capacity; must be greater than 0
    pub fn new(store: Arc<dyn TimeSeriesStore>, max_pending: usize) -> Self {
        Self {
            store,
            pending: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            next_key: AtomicU64::new(0),
            max_pending: max_pending.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Write one sensor reading.
    ///
    /// Never fails from the caller's point of view: if the store rejects the
    /// write, the point is parked in the pending table for the sweeper.
    ///
    /// # Arguments
    ///
    /// * `value` - Temperature value
    /// * `sensor` - Sensor name (`sensor` tag)
    /// * `timestamp` - Unix timestamp in seconds
    /// * `sequence` - Sensor sequence number (`sequence` tag)
    pub async fn write_sensor_point(&self, value: f64, sensor: &str, timestamp: i64, sequence: i32) {
        self.write_through(sensor_point(value, sensor, timestamp, sequence))
            .await;
    }

    /// Write one outside-weather observation; cached on failure like sensor points.
    pub async fn write_outside_weather(
        &self,
        place: &str,
        website: &str,
        celsius: f64,
        timestamp: DateTime<Utc>,
        postal_code: i64,
    ) {
        let point = Point::new(WEATHER_MEASUREMENT)
            .tag("place", place)
            .tag("website", website)
            .field("value", FieldValue::Float(celsius))
            .field("value_fahrenheit", FieldValue::Float(celsius * 9.0 / 5.0 + 32.0))
            .field("postalcode", FieldValue::Integer(postal_code))
            .at(timestamp.timestamp());

        self.write_through(point).await;
    }

    async fn write_through(&self, point: Point) {
        if let Err(e) = self.store.write_point(&point).await {
            let measurement = point.measurement.clone();
            let key = self.park(point);
            warn!(
                "Write of {} point failed, cached as {} for retry: {}",
                measurement, key, e
            );
        }
    }

    fn park(&self, point: Point) -> CacheKey {
        let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        let key = CacheKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        self.pending.insert(key, point);
        order.push_back(key);
        self.evict_overflow(&mut order);
        key
    }

    /// Drop the oldest entries until the table fits; caller holds the order lock
    fn evict_overflow(&self, order: &mut VecDeque<CacheKey>) {
        while self.pending.len() > self.max_pending {
            let Some(key) = order.pop_front() else { break };

            // Keys flushed since they were parked are skipped
            if self.pending.remove(&key).is_some() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Pending table full ({} entries), dropped oldest point {}",
                    self.max_pending, key
                );
            }
        }

        if order.len() > self.max_pending.saturating_mul(2) {
            order.retain(|key| self.pending.contains_key(key));
        }
    }

    /// Number of points waiting for a retry
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot of the pending table, oldest first
    pub fn pending_points(&self) -> BTreeMap<CacheKey, Point> {
        self.pending
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Forget a pending point; absent keys are ignored
    pub fn remove_pending(&self, key: CacheKey) {
        if self.pending.remove(&key).is_some() {
            debug!("Removed cached point {}", key);
        }
    }

    /// Write one pending point straight to the store and forget it on success.
    ///
    /// # Errors
    ///
    /// Returns the store's error; the point then stays in the table.
    pub async fn flush_pending(&self, key: CacheKey, point: &Point) -> Result<()> {
        self.store.write_point(point).await?;
        self.remove_pending(key);
        Ok(())
    }

    /// Points evicted by the capacity limit since start-up
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Reachability check of the backing store
    pub async fn ping_store(&self) -> Result<()> {
        self.store.ping().await
    }

    /// Mean indoor temperature for one sensor over a time range
    pub async fn sensor_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sensor: &str,
    ) -> Result<Vec<Row>> {
        self.store.query_range(&RangeQuery::sensor(sensor, start, end)).await
    }

    /// Mean outside temperature for one place over a time range
    pub async fn outside_weather_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        place: &str,
    ) -> Result<Vec<Row>> {
        self.store
            .query_range(&RangeQuery::outside_weather(place, start, end))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mocks::MockStore;
    use chrono::TimeZone;

    fn gateway(store: &MockStore) -> CacheGateway {
        CacheGateway::new(Arc::new(store.clone()), 1000)
    }

    #[tokio::test]
    async fn test_successful_write_goes_straight_to_store() {
        let store = MockStore::new();
        let gateway = gateway(&store);

        gateway.write_sensor_point(21.5, "Sensor_One", 1722500000, 3).await;

        let written = store.get_written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].measurement, "temperature");
        assert_eq!(written[0].tag_value("sensor"), Some("Sensor_One"));
        assert_eq!(written[0].tag_value("sequence"), Some("3"));
        assert_eq!(written[0].field_value("value"), Some(&FieldValue::Float(21.5)));
        assert_eq!(written[0].timestamp, 1722500000);
        assert_eq!(gateway.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_is_cached_not_raised() {
        let store = MockStore::new();
        store.set_unreachable(true);
        let gateway = gateway(&store);

        gateway.write_sensor_point(20.0, "Sensor_Two", 100, 0).await;

        assert!(store.get_written().is_empty());
        assert_eq!(gateway.pending_count(), 1);

        let pending = gateway.pending_points();
        let point = pending.values().next().unwrap();
        assert_eq!(point, &sensor_point(20.0, "Sensor_Two", 100, 0));
    }

    #[tokio::test]
    async fn test_point_delivered_once_after_repeated_failures() {
        let store = MockStore::new();
        store.set_unreachable(true);
        let gateway = gateway(&store);
        gateway.write_sensor_point(19.0, "s", 1, 1).await;

        // Three failed retries, then the store comes back
        for _ in 0..3 {
            let (key, point) = gateway.pending_points().into_iter().next().unwrap();
            assert!(gateway.flush_pending(key, &point).await.is_err());
            assert_eq!(gateway.pending_count(), 1);
        }

        store.set_unreachable(false);
        let (key, point) = gateway.pending_points().into_iter().next().unwrap();
        gateway.flush_pending(key, &point).await.unwrap();

        assert_eq!(store.get_written().len(), 1);
        assert_eq!(gateway.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_absent_key_is_noop() {
        let store = MockStore::new();
        store.set_unreachable(true);
        let gateway = gateway(&store);
        gateway.write_sensor_point(1.0, "s", 1, 0).await;

        gateway.remove_pending(CacheKey(999));
        assert_eq!(gateway.pending_count(), 1);

        let key = *gateway.pending_points().keys().next().unwrap();
        gateway.remove_pending(key);
        gateway.remove_pending(key);
        assert_eq!(gateway.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_unique_and_ordered() {
        let store = MockStore::new();
        store.set_unreachable(true);
        let gateway = gateway(&store);

        for i in 0..5 {
            gateway.write_sensor_point(i as f64, "s", i, 0).await;
        }

        let pending = gateway.pending_points();
        assert_eq!(pending.len(), 5);
        let timestamps: Vec<i64> = pending.values().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let store = MockStore::new();
        store.set_unreachable(true);
        let gateway = CacheGateway::new(Arc::new(store.clone()), 3);

        for i in 0..5 {
            gateway.write_sensor_point(i as f64, "s", i, 0).await;
        }

        assert_eq!(gateway.pending_count(), 3);
        assert_eq!(gateway.dropped_count(), 2);
        let timestamps: Vec<i64> = gateway.pending_points().values().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_overflow_skips_already_flushed_points() {
        let store = MockStore::new();
        store.set_unreachable(true);
        let gateway = CacheGateway::new(Arc::new(store.clone()), 2);

        gateway.write_sensor_point(0.0, "s", 0, 0).await;
        gateway.write_sensor_point(1.0, "s", 1, 0).await;

        store.set_unreachable(false);
        let (key, point) = gateway.pending_points().into_iter().next().unwrap();
        gateway.flush_pending(key, &point).await.unwrap();
        store.set_unreachable(true);

        gateway.write_sensor_point(2.0, "s", 2, 0).await;
        gateway.write_sensor_point(3.0, "s", 3, 0).await;

        // Only the point at 1 was evicted; the flushed one is not counted
        assert_eq!(gateway.dropped_count(), 1);
        let timestamps: Vec<i64> = gateway.pending_points().values().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_eviction_order_stays_bounded() {
        let store = MockStore::new();
        let gateway = CacheGateway::new(Arc::new(store.clone()), 2);

        // Park and flush many points without ever reaching the cap
        for i in 0..50 {
            store.set_unreachable(true);
            gateway.write_sensor_point(i as f64, "s", i, 0).await;
            store.set_unreachable(false);
            for (key, point) in gateway.pending_points() {
                gateway.flush_pending(key, &point).await.unwrap();
            }
        }

        assert_eq!(gateway.pending_count(), 0);
        assert_eq!(gateway.dropped_count(), 0);
        assert!(gateway.order.lock().unwrap().len() <= 4);
    }

    #[tokio::test]
    async fn test_outside_weather_point() {
        let store = MockStore::new();
        let gateway = gateway(&store);
        let timestamp = Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 0).unwrap();

        gateway
            .write_outside_weather("Heidenheim", "open-meteo", 20.0, timestamp, 89518)
            .await;

        let written = store.get_written();
        assert_eq!(written.len(), 1);
        let point = &written[0];
        assert_eq!(point.measurement, "outside_temperature");
        assert_eq!(point.tag_value("place"), Some("Heidenheim"));
        assert_eq!(point.tag_value("website"), Some("open-meteo"));
        assert_eq!(point.field_value("value"), Some(&FieldValue::Float(20.0)));
        assert_eq!(point.field_value("value_fahrenheit"), Some(&FieldValue::Float(68.0)));
        assert_eq!(point.field_value("postalcode"), Some(&FieldValue::Integer(89518)));
        assert_eq!(point.timestamp, timestamp.timestamp());
    }

    #[tokio::test]
    async fn test_concurrent_failures_all_cached() {
        let store = MockStore::new();
        store.set_unreachable(true);
        let gateway = Arc::new(gateway(&store));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..50 {
            let gateway = gateway.clone();
            tasks.spawn(async move {
                gateway.write_sensor_point(i as f64, &format!("sensor-{}", i), i, 0).await;
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(gateway.pending_count(), 50);
    }

    #[tokio::test]
    async fn test_range_passthroughs() {
        let store = MockStore::new();
        store.rows.lock().unwrap().push(vec![serde_json::json!("t"), serde_json::json!(1.5)]);
        let gateway = gateway(&store);
        let start = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 8, 2, 0, 0, 0).unwrap();

        let rows = gateway.sensor_range(start, end, "Sensor_One").await.unwrap();
        assert_eq!(rows.len(), 1);
        gateway.outside_weather_range(start, end, "Heidenheim").await.unwrap();

        let queries = store.queries.lock().unwrap().clone();
        assert_eq!(queries[0], RangeQuery::sensor("Sensor_One", start, end));
        assert_eq!(queries[1], RangeQuery::outside_weather("Heidenheim", start, end));
    }
}
