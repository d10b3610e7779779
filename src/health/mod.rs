//! # Health Module
//!
//! Liveness and degradation signal for the bridge.
//!
//! | Status      | Condition                                               |
//! |-------------|---------------------------------------------------------|
//! | `Unhealthy` | store ping failed or timed out, or broker disconnected |
//! | `Degraded`  | connectivity fine, points waiting in the pending table  |
//! | `Healthy`   | connectivity fine, pending table empty                  |

pub mod server;

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::broker::StateHandle;
use crate::cache::CacheGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of one health check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub description: String,
    pub details: BTreeMap<String, Value>,
}

/// Combines store reachability, broker state and the pending table
#[derive(Debug)]
pub struct HealthReporter {
    gateway: Arc<CacheGateway>,
    connection: StateHandle,
}

impl HealthReporter {
    pub fn new(gateway: Arc<CacheGateway>, connection: StateHandle) -> Self {
        Self { gateway, connection }
    }

    /// Run one check.
    ///
    /// # Arguments
    ///
    /// * `deadline` - Upper bound for the store ping; a slower ping counts
    ///   as unreachable
    pub async fn check_health(&self, deadline: Duration) -> HealthReport {
        let ping = match timeout(deadline, self.gateway.ping_store()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no answer within {}ms", deadline.as_millis())),
        };

        let broker = self.connection.snapshot();
        let pending = self.gateway.pending_count();

        let mut details = BTreeMap::new();
        details.insert("influxdb_connected".to_string(), json!(ping.is_ok()));
        details.insert("cached_points_count".to_string(), json!(pending));
        details.insert("dropped_points".to_string(), json!(self.gateway.dropped_count()));
        details.insert("broker_connected".to_string(), json!(broker.connected));
        details.insert("broker_subscribed".to_string(), json!(broker.subscribed));

        let (status, description) = match ping {
            Err(e) => (HealthStatus::Unhealthy, format!("InfluxDB unreachable: {}", e)),
            Ok(()) if !broker.connected => (
                HealthStatus::Unhealthy,
                "Not connected to the MQTT broker".to_string(),
            ),
            Ok(()) if pending > 0 => (
                HealthStatus::Degraded,
                format!("{} points waiting for retry", pending),
            ),
            Ok(()) => (HealthStatus::Healthy, "All systems operational".to_string()),
        };

        debug!("Health check: {:?} ({})", status, description);

        HealthReport {
            status,
            description,
            details,
        }
    }
}
