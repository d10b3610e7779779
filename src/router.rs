//! # Reading Router
//!
//! Turns one inbound message into zero or more sensor-point writes.
//!
//! The last topic segment names the sensor. A trailing `recovered` segment
//! marks a recovery backlog: the sensor is then the segment before it and
//! every entry of the payload's batch is written independently.

use std::sync::Arc;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::broker::{InboundMessage, MessageHandler};
use crate::cache::CacheGateway;
use crate::error::Result;
use crate::reading::{LeafValue, Reading};
use crate::subscription::RECOVERY_SEGMENT;

/// Where a message is headed, derived from its topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    /// Single live reading
    Live { sensor: &'a str },
    /// Batch of recovered readings
    Recovery { sensor: &'a str },
}

/// Classify a topic. `None` when no usable sensor name can be taken from it.
pub fn route(topic: &str) -> Option<Route<'_>> {
    let mut segments = topic.rsplit('/');
    let last = segments.next().filter(|s| valid_sensor_name(s))?;

    if last == RECOVERY_SEGMENT {
        let sensor = segments.next().filter(|s| valid_sensor_name(s))?;
        Some(Route::Recovery { sensor })
    } else {
        Some(Route::Live { sensor: last })
    }
}

/// Sensor names become tag values; control characters and backslashes are refused
fn valid_sensor_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| c.is_control() || c == '\\')
}

/// Routes inbound messages into the cache gateway
#[derive(Debug, Clone)]
pub struct ReadingRouter {
    gateway: Arc<CacheGateway>,
}

impl ReadingRouter {
    pub fn new(gateway: Arc<CacheGateway>) -> Self {
        Self { gateway }
    }

    /// Process one message.
    ///
    /// # Returns
    ///
    /// Number of points handed to the gateway.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Json` when the payload is not a reading.
    pub async fn route_message(&self, message: &InboundMessage) -> Result<usize> {
        let Some(route) = route(&message.topic) else {
            warn!("No sensor name in topic '{}', dropping message", message.topic);
            return Ok(0);
        };

        let reading = Reading::from_slice(&message.payload)?;

        match route {
            Route::Live { sensor } => {
                let written = process_leaf(&self.gateway, reading, sensor).await;
                Ok(usize::from(written))
            }
            Route::Recovery { sensor } => Ok(self.process_recovery(reading, sensor).await),
        }
    }

    async fn process_recovery(&self, reading: Reading, sensor: &str) -> usize {
        let leaves = reading.into_batch();
        if leaves.is_empty() {
            warn!("Recovery message for {} carries no readings", sensor);
            return 0;
        }

        let total = leaves.len();
        let mut tasks = JoinSet::new();
        for leaf in leaves {
            let gateway = self.gateway.clone();
            let sensor = sensor.to_string();
            tasks.spawn(async move { process_leaf(&gateway, leaf, &sensor).await });
        }

        let mut written = 0;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => error!("Recovered reading task for {} failed: {}", sensor, e),
            }
        }

        info!("Recovered {}/{} readings for {}", written, total, sensor);
        written
    }
}

/// Write one leaf reading if it carries exactly one leading value.
async fn process_leaf(gateway: &CacheGateway, reading: Reading, sensor: &str) -> bool {
    match reading.leaf_value() {
        LeafValue::Single(value) => {
            let sequence = reading.sequence.unwrap_or(0);
            gateway
                .write_sensor_point(value, sensor, reading.timestamp, sequence)
                .await;
            debug!("{}: {} at {} (seq {})", sensor, value, reading.timestamp, sequence);
            true
        }
        LeafValue::Empty => {
            warn!("Reading for {} has no usable value, dropping", sensor);
            false
        }
        LeafValue::Multiple(count) => {
            info!("Reading for {} has {} values, only single values are stored", sensor, count);
            false
        }
        LeafValue::Batch => {
            error!("Unexpected batch where a single reading for {} was expected", sensor);
            false
        }
    }
}

#[async_trait]
impl MessageHandler for ReadingRouter {
    async fn handle(&self, message: InboundMessage) {
        match self.route_message(&message).await {
            Ok(count) => debug!("Message on {} produced {} points", message.topic, count),
            Err(e) => warn!("Dropping message on {}: {}", message.topic, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mocks::MockStore;
    use crate::store::FieldValue;

    const LIVE: &str = "dhbw/ai/si2023/2/temp/Sensor_One";

    fn router(store: &MockStore) -> ReadingRouter {
        ReadingRouter::new(Arc::new(CacheGateway::new(Arc::new(store.clone()), 1000)))
    }

    async fn send(router: &ReadingRouter, topic: &str, payload: &str) -> Result<usize> {
        router.route_message(&InboundMessage::new(topic, payload.as_bytes().to_vec())).await
    }

    #[test]
    fn test_route_live() {
        assert_eq!(route(LIVE), Some(Route::Live { sensor: "Sensor_One" }));
        assert_eq!(route("Sensor_One"), Some(Route::Live { sensor: "Sensor_One" }));
    }

    #[test]
    fn test_route_recovery() {
        assert_eq!(
            route("dhbw/ai/si2023/2/temp/sensorA/recovered"),
            Some(Route::Recovery { sensor: "sensorA" })
        );
    }

    #[test]
    fn test_route_unusable_topics() {
        assert_eq!(route(""), None);
        assert_eq!(route("a/b/"), None);
        assert_eq!(route("recovered"), None);
        assert_eq!(route("a//recovered"), None);
    }

    #[test]
    fn test_route_rejects_control_characters() {
        assert_eq!(route("dhbw/2/temp/Sensor\nOne"), None);
        assert_eq!(route("dhbw/2/temp/Sensor\r/recovered"), None);
        assert_eq!(route("dhbw/2/temp/Sensor\\"), None);
        assert_eq!(route("dhbw/2/temp/Sensor One"), Some(Route::Live { sensor: "Sensor One" }));
    }

    #[tokio::test]
    async fn test_control_character_topic_writes_nothing() {
        let store = MockStore::new();
        let router = router(&store);

        let count = send(&router, "dhbw/2/temp/a\nb", r#"{"timestamp":1,"value":[5.0]}"#)
            .await
            .unwrap();

        assert_eq!(count, 0);
        assert!(store.get_written().is_empty());
    }

    #[tokio::test]
    async fn test_single_value_written() {
        let store = MockStore::new();
        let router = router(&store);

        let count = send(&router, LIVE, r#"{"timestamp":1722500000,"value":[5.0],"sequence":7}"#)
            .await
            .unwrap();

        assert_eq!(count, 1);
        let written = store.get_written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].tag_value("sensor"), Some("Sensor_One"));
        assert_eq!(written[0].tag_value("sequence"), Some("7"));
        assert_eq!(written[0].field_value("value"), Some(&FieldValue::Float(5.0)));
        assert_eq!(written[0].timestamp, 1722500000);
    }

    #[tokio::test]
    async fn test_missing_sequence_defaults_to_zero() {
        let store = MockStore::new();
        let router = router(&store);

        send(&router, LIVE, r#"{"Timestamp":"1722500000","Value":[21.5]}"#)
            .await
            .unwrap();

        assert_eq!(store.get_written()[0].tag_value("sequence"), Some("0"));
    }

    #[tokio::test]
    async fn test_empty_values_dropped() {
        let store = MockStore::new();
        let router = router(&store);

        assert_eq!(send(&router, LIVE, r#"{"timestamp":1,"value":[]}"#).await.unwrap(), 0);
        assert_eq!(send(&router, LIVE, r#"{"timestamp":1,"value":[null]}"#).await.unwrap(), 0);
        assert!(store.get_written().is_empty());
    }

    #[tokio::test]
    async fn test_multiple_values_dropped() {
        let store = MockStore::new();
        let router = router(&store);

        assert_eq!(send(&router, LIVE, r#"{"timestamp":1,"value":[5.0,6.0]}"#).await.unwrap(), 0);
        assert!(store.get_written().is_empty());
    }

    #[tokio::test]
    async fn test_batch_on_live_topic_dropped() {
        let store = MockStore::new();
        let router = router(&store);

        let payload = r#"{"timestamp":1,"value":[1.0],"meta":[{"timestamp":2,"value":[2.0]}]}"#;
        assert_eq!(send(&router, LIVE, payload).await.unwrap(), 0);
        assert!(store.get_written().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_writes_each_leaf_for_sensor() {
        let store = MockStore::new();
        let router = router(&store);

        let payload = r#"{"meta":[{"timestamp":10,"value":[20.5],"sequence":1},null,{"timestamp":11,"value":[20.75],"sequence":2}]}"#;
        let count = send(&router, "dhbw/ai/si2023/2/temp/sensorA/recovered", payload)
            .await
            .unwrap();

        assert_eq!(count, 2);
        let mut written = store.get_written();
        written.sort_by_key(|p| p.timestamp);
        assert_eq!(written.len(), 2);
        assert!(written.iter().all(|p| p.tag_value("sensor") == Some("sensorA")));
        assert_eq!(written[0].timestamp, 10);
        assert_eq!(written[1].field_value("value"), Some(&FieldValue::Float(20.75)));
    }

    #[tokio::test]
    async fn test_recovery_leaf_isolation() {
        let store = MockStore::new();
        let router = router(&store);

        let payload = r#"{"meta":[{"timestamp":1,"value":[1.0,2.0]},{"timestamp":2,"value":[3.0]},{"timestamp":3,"value":[]}]}"#;
        let count = send(&router, "g/2/temp/sensorB/recovered", payload).await.unwrap();

        assert_eq!(count, 1);
        assert_eq!(store.get_written()[0].timestamp, 2);
    }

    #[tokio::test]
    async fn test_recovery_without_batch() {
        let store = MockStore::new();
        let router = router(&store);

        assert_eq!(send(&router, "s/recovered", r#"{"meta":[null,null]}"#).await.unwrap(), 0);
        assert!(store.get_written().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_error() {
        let store = MockStore::new();
        let router = router(&store);

        assert!(send(&router, LIVE, "not json").await.is_err());
        assert!(send(&router, LIVE, r#"{"timestamp":1.5,"value":[1.0]}"#).await.is_err());

        // The handler entry point swallows it
        router
            .handle(InboundMessage::new(LIVE, b"{".to_vec()))
            .await;
        assert!(store.get_written().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_is_cached_not_raised() {
        let store = MockStore::new();
        store.set_unreachable(true);
        let gateway = Arc::new(CacheGateway::new(Arc::new(store.clone()), 1000));
        let router = ReadingRouter::new(gateway.clone());

        let count = send(&router, LIVE, r#"{"timestamp":1,"value":[5.0]}"#).await.unwrap();

        assert_eq!(count, 1);
        assert_eq!(gateway.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_sensors_paired_correctly() {
        let store = MockStore::new();
        let router = Arc::new(router(&store));

        let mut tasks = JoinSet::new();
        for i in 0..100 {
            let router = router.clone();
            tasks.spawn(async move {
                let topic = format!("dhbw/ai/si2023/1/temp/sensor-{}", i);
                let payload = format!(r#"{{"timestamp":{},"value":[{}.0],"sequence":{}}}"#, 1000 + i, i, i);
                router.handle(InboundMessage::new(topic, payload.into_bytes())).await;
            });
        }
        while tasks.join_next().await.is_some() {}

        let written = store.get_written();
        assert_eq!(written.len(), 100);
        for point in &written {
            let sensor = point.tag_value("sensor").unwrap();
            let i: i64 = sensor.trim_start_matches("sensor-").parse().unwrap();
            assert_eq!(point.field_value("value"), Some(&FieldValue::Float(i as f64)));
            assert_eq!(point.timestamp, 1000 + i);
            assert_eq!(point.tag_value("sequence"), Some(i.to_string().as_str()));
        }

        let mut sensors: Vec<&str> = written.iter().filter_map(|p| p.tag_value("sensor")).collect();
        sensors.sort();
        sensors.dedup();
        assert_eq!(sensors.len(), 100);
    }
}
