//! # Connection Supervisor
//!
//! Long-running worker keeping the bridge connected and subscribed.
//!
//! ```text
//! Connect ──ok──> Subscribe ──ok──> Monitor ──lost──> Connect
//!    │ err            │ err
//!    └─ wait retry_delay, start over
//! ```
//!
//! On cancellation the live connection is closed with an orderly
//! DISCONNECT.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Connection, ConnectionManager};
use crate::subscription::SubscriptionManager;

/// Drives the connection manager and subscription manager
pub struct Supervisor {
    connections: Arc<ConnectionManager>,
    subscriptions: SubscriptionManager,
    retry_delay: Duration,
    monitor_interval: Duration,
}

/// Sleep for `duration`; `true` if the token fired first
async fn cancelled_during(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

impl Supervisor {
    pub fn new(
        connections: Arc<ConnectionManager>,
        subscriptions: SubscriptionManager,
        retry_delay: Duration,
        monitor_interval: Duration,
    ) -> Self {
        Self {
            connections,
            subscriptions,
            retry_delay,
            monitor_interval,
        }
    }

    /// Run until `token` is cancelled
    pub async fn run(self, token: CancellationToken) {
        info!("Supervisor started");
        let mut connection: Option<Connection> = None;

        'cycle: while !token.is_cancelled() {
            if connection.is_none() || !self.connections.state().connected {
                if let Some(stale) = connection.take() {
                    if let Err(e) = stale.disconnect().await {
                        debug!("Closing stale connection: {}", e);
                    }
                }

                match self.connections.connect().await {
                    Ok(fresh) => connection = Some(fresh),
                    Err(e) => {
                        warn!("Broker connection failed, retrying in {:?}: {}", self.retry_delay, e);
                        if cancelled_during(&token, self.retry_delay).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let Some(active) = connection.as_ref() else {
                continue;
            };

            if !self.connections.state().subscribed {
                if let Err(e) = self.subscriptions.subscribe_all(active).await {
                    error!("Subscribing failed, retrying in {:?}: {}", self.retry_delay, e);
                    if cancelled_during(&token, self.retry_delay).await {
                        break;
                    }
                    continue;
                }
            }

            loop {
                if cancelled_during(&token, self.monitor_interval).await {
                    break 'cycle;
                }

                let state = self.connections.state();
                if !state.connected {
                    warn!("Broker connection lost, reconnecting");
                    break;
                }
                if !state.subscribed {
                    warn!("Subscriptions lost, resubscribing");
                    break;
                }
                debug!("Broker connection healthy");
            }
        }

        if let Some(connection) = connection {
            if let Err(e) = connection.disconnect().await {
                warn!("Disconnect failed: {}", e);
            }
        }
        info!("Supervisor stopped");
    }
}
