//! # Subscription Module
//!
//! Turns the configured sensor topics into shared-subscription filters on a
//! live connection.
//!
//! Filters have the shape
//! `$share/<consumer-group>/<path-prefix>/<group-id>/<sensor-type>/<sensor-name>`;
//! sensors with a recovery backlog get a second filter ending in `/recovered`.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::broker::Connection;
use crate::error::{BridgeError, Result};

/// Trailing topic segment of recovery publishes
pub const RECOVERY_SEGMENT: &str = "recovered";

/// Kind of sensor, lower-case in topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    #[default]
    Temp,
    Spl,
    Hum,
    Ikea,
    Co2,
    Mic,
}

impl SensorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Temp => "temp",
            SensorType::Spl => "spl",
            SensorType::Hum => "hum",
            SensorType::Ikea => "ikea",
            SensorType::Co2 => "co2",
            SensorType::Mic => "mic",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured sensor topic
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorTopic {
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    pub group_id: i64,
    #[serde(default)]
    pub sensor_type: SensorType,
    pub sensor_name: String,
    #[serde(default)]
    pub has_recovery: bool,
}

fn default_path_prefix() -> String {
    "dhbw/ai/si2023".to_string()
}

impl SensorTopic {
    /// Topic the sensor publishes live readings on
    pub fn topic(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.path_prefix.trim_matches('/'),
            self.group_id,
            self.sensor_type,
            self.sensor_name
        )
    }
}

/// Source of the sensor topic list
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn topic_settings(&self) -> Result<Vec<SensorTopic>>;
}

#[derive(Debug, Default, Deserialize)]
struct TopicsFile {
    #[serde(default)]
    topics: Vec<SensorTopic>,
}

/// Settings store backed by a TOML file of `[[topics]]` tables.
///
/// The file is read on every call, so edits apply on the next subscription
/// cycle.
#[derive(Debug, Clone)]
pub struct TomlSettingsStore {
    path: PathBuf,
}

impl TomlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SettingsStore for TomlSettingsStore {
    async fn topic_settings(&self) -> Result<Vec<SensorTopic>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            BridgeError::Settings(format!("cannot read {}: {}", self.path.display(), e))
        })?;

        let file: TopicsFile = toml::from_str(&content).map_err(|e| {
            BridgeError::Settings(format!("cannot parse {}: {}", self.path.display(), e))
        })?;

        Ok(file.topics)
    }
}

/// Subscribes a connection to every configured sensor
pub struct SubscriptionManager {
    settings: Arc<dyn SettingsStore>,
    consumer_group: String,
}

impl SubscriptionManager {
    pub fn new(settings: Arc<dyn SettingsStore>, consumer_group: &str) -> Self {
        Self {
            settings,
            consumer_group: consumer_group.to_string(),
        }
    }

    /// Shared-subscription filter for one topic
    pub fn shared_filter(&self, topic: &SensorTopic) -> String {
        format!("$share/{}/{}", self.consumer_group, topic.topic())
    }

    /// Filters for one topic, including the recovery filter when enabled
    pub fn filters(&self, topic: &SensorTopic) -> Vec<String> {
        let live = self.shared_filter(topic);
        if topic.has_recovery {
            let recovery = format!("{}/{}", live, RECOVERY_SEGMENT);
            vec![live, recovery]
        } else {
            vec![live]
        }
    }

    /// Fetch the topic list and subscribe to each filter at QoS 1.
    ///
    /// # Returns
    ///
    /// Number of filters subscribed. An empty topic list subscribes nothing
    /// and still marks the connection subscribed.
    ///
    /// # Errors
    ///
    /// The first settings or subscribe error is returned and the connection
    /// stays unsubscribed. A filter counts as subscribed only once the broker
    /// granted it; a reconnect during the cycle is reported as
    /// `BridgeError::Subscribe`.
    pub async fn subscribe_all(&self, connection: &Connection) -> Result<usize> {
        let session = connection.session();
        let topics = self.settings.topic_settings().await?;
        let mut count = 0;

        for topic in &topics {
            for filter in self.filters(topic) {
                connection.subscribe(&filter).await?;
                debug!("Subscribed to {}", filter);
                count += 1;
            }
        }

        if !connection.confirm_subscribed(session) {
            return Err(BridgeError::Subscribe(
                "connection was re-established while subscribing".to_string(),
            ));
        }
        info!("Subscribed to {} filters for {} sensors", count, topics.len());
        Ok(count)
    }
}
