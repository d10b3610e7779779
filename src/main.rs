//! # Sensor Bridge
//!
//! Ingest temperature telemetry from MQTT into InfluxDB.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use sensor_bridge::broker::{ConnectionManager, MqttConnector};
use sensor_bridge::cache::CacheGateway;
use sensor_bridge::config::{Config, LoggingConfig};
use sensor_bridge::health::{server, HealthReporter};
use sensor_bridge::router::ReadingRouter;
use sensor_bridge::store::{InfluxStore, TimeSeriesStore};
use sensor_bridge::subscription::{SubscriptionManager, TomlSettingsStore};
use sensor_bridge::supervisor::Supervisor;
use sensor_bridge::sweeper::RetrySweeper;

/// Used when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Log file name inside `logging.dir`
const LOG_FILE_NAME: &str = "sensor-bridge.log";

/// First command-line argument, or the default path
fn config_path(mut args: impl Iterator<Item = String>) -> PathBuf {
    args.nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `logging.level`. The returned guard must
/// live as long as file logging is wanted.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.dir.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    } else {
        let appender = tracing_appender::rolling::daily(&config.dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    }
}

/// Main entry point for the Sensor Bridge
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration
///    - Set up logging
///    - Build the store client, cache gateway, router and connection manager
///
/// 2. **Run**
///    - Retry sweeper and health endpoint on their own tasks
///    - Supervisor keeps the broker connection subscribed
///
/// 3. **Graceful Shutdown** on Ctrl+C
///    - Cancel every task and wait for them
///    - Orderly MQTT DISCONNECT
///    - Warn about points still pending
///
/// # Examples
///
/// ```bash
/// cargo run --release -- config/default.toml
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path(std::env::args());
    let config = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;

    let _log_guard = init_logging(&config.logging);

    info!("Sensor Bridge v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {}", path.display());

    let store: Arc<dyn TimeSeriesStore> = Arc::new(InfluxStore::new(&config.influx)?);
    let gateway = Arc::new(CacheGateway::new(store, config.sweeper.max_pending));
    let router = Arc::new(ReadingRouter::new(gateway.clone()));

    let mut connections = ConnectionManager::new(
        Arc::new(MqttConnector::new(&config.broker)),
        &config.broker.client_id_prefix,
        config.broker.connect_timeout(),
    );
    connections.on_message(router);
    let connections = Arc::new(connections);

    let settings = Arc::new(TomlSettingsStore::new(&config.settings.topics_file));
    let subscriptions = SubscriptionManager::new(settings, &config.broker.consumer_group);

    let token = CancellationToken::new();
    let mut tasks = Vec::new();

    let sweeper = RetrySweeper::new(gateway.clone(), config.sweeper.interval());
    tasks.push(tokio::spawn(sweeper.run(token.clone())));

    if config.health.enabled {
        let listener = TcpListener::bind(&config.health.bind)
            .await
            .with_context(|| format!("binding health endpoint to {}", config.health.bind))?;
        let reporter = Arc::new(HealthReporter::new(gateway.clone(), connections.state_handle()));
        let deadline = config.health.timeout();
        let health_token = token.clone();

        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::serve(listener, reporter, deadline, health_token).await {
                error!("Health endpoint failed: {}", e);
            }
        }));
    }

    let supervisor = Supervisor::new(
        connections.clone(),
        subscriptions,
        config.supervisor.retry_delay(),
        config.supervisor.monitor_interval(),
    );
    tasks.push(tokio::spawn(supervisor.run(token.clone())));

    info!(
        "Bridging {}:{} -> {} (database {})",
        config.broker.host, config.broker.port, config.influx.url, config.influx.database
    );
    info!("Press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    token.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!("Task ended abnormally: {}", e);
        }
    }

    let pending = gateway.pending_count();
    if pending > 0 {
        warn!("{} points were still pending and are lost", pending);
    }
    info!("Sensor Bridge stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_config_path_from_args() {
        assert_eq!(
            config_path(args(&["sensor-bridge", "/etc/sensor-bridge.toml"])),
            PathBuf::from("/etc/sensor-bridge.toml")
        );
    }

    #[test]
    fn test_config_path_default() {
        assert_eq!(config_path(args(&["sensor-bridge"])), PathBuf::from(DEFAULT_CONFIG_PATH));
    }
}
