//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::Deserialize;
use serde::de::Error;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Environment variable that overrides `influx.token`
pub const INFLUX_TOKEN_ENV: &str = "INFLUX_TOKEN";

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub influx: InfluxConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// MQTT broker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default = "default_keep_alive_s")]
    pub keep_alive_s: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// InfluxDB configuration
#[derive(Debug, Deserialize, Clone)]
pub struct InfluxConfig {
    #[serde(default = "default_influx_url")]
    pub url: String,

    #[serde(default = "default_influx_database")]
    pub database: String,

    #[serde(default)]
    pub token: String,

    #[serde(default = "default_influx_timeout_ms")]
    pub timeout_ms: u64,
}

/// Sensor topic settings source
#[derive(Debug, Deserialize, Clone)]
pub struct SettingsConfig {
    #[serde(default = "default_topics_file")]
    pub topics_file: String,
}

/// Pending-write retry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SweeperConfig {
    #[serde(default = "default_sweep_interval_s")]
    pub interval_s: u64,

    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

/// Connection supervisor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    #[serde(default = "default_retry_delay_s")]
    pub retry_delay_s: u64,

    #[serde(default = "default_monitor_interval_s")]
    pub monitor_interval_s: u64,
}

/// Health endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,

    #[serde(default = "default_health_bind")]
    pub bind: String,

    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily-rolling log files; empty disables file output
    #[serde(default)]
    pub dir: String,
}

// Default value functions
fn default_broker_host() -> String { "localhost".to_string() }
fn default_broker_port() -> u16 { 1883 }
fn default_keep_alive_s() -> u64 { 60 }
fn default_connect_timeout_ms() -> u64 { 5000 }
fn default_client_id_prefix() -> String { "sensor-bridge".to_string() }
fn default_consumer_group() -> String { "cute-temp-group2".to_string() }
fn default_channel_capacity() -> usize { 100 }

fn default_influx_url() -> String { "http://localhost:8181".to_string() }
fn default_influx_database() -> String { "IsoPruefi".to_string() }
fn default_influx_timeout_ms() -> u64 { 5000 }

fn default_topics_file() -> String { "config/topics.toml".to_string() }

fn default_sweep_interval_s() -> u64 { 300 }
fn default_max_pending() -> usize { 100_000 }

fn default_retry_delay_s() -> u64 { 30 }
fn default_monitor_interval_s() -> u64 { 60 }

fn default_health_enabled() -> bool { true }
fn default_health_bind() -> String { "0.0.0.0:8080".to_string() }
fn default_health_timeout_ms() -> u64 { 2000 }

fn default_log_level() -> String { "info".to_string() }

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            keep_alive_s: default_keep_alive_s(),
            connect_timeout_ms: default_connect_timeout_ms(),
            client_id_prefix: default_client_id_prefix(),
            consumer_group: default_consumer_group(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: default_influx_url(),
            database: default_influx_database(),
            token: String::new(),
            timeout_ms: default_influx_timeout_ms(),
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self { topics_file: default_topics_file() }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_s: default_sweep_interval_s(),
            max_pending: default_max_pending(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_delay_s: default_retry_delay_s(),
            monitor_interval_s: default_monitor_interval_s(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            bind: default_health_bind(),
            timeout_ms: default_health_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: String::new(),
        }
    }
}

impl BrokerConfig {
    /// CONNACK deadline for a single connection attempt
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl InfluxConfig {
    /// Per-request deadline for the HTTP client
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_s)
    }
}

impl SupervisorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_s)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_s)
    }
}

impl HealthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// The InfluxDB token may be supplied through the `INFLUX_TOKEN`
    /// environment variable instead of the file; the variable wins when set.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use sensor_bridge::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        if let Ok(token) = std::env::var(INFLUX_TOKEN_ENV) {
            if !token.is_empty() {
                config.influx.token = token;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.broker.host.is_empty() {
            return Err(invalid("broker host cannot be empty"));
        }

        if self.broker.port == 0 {
            return Err(invalid("broker port must be greater than 0"));
        }

        if self.broker.keep_alive_s < 5 {
            return Err(invalid("keep_alive_s must be at least 5"));
        }

        if self.broker.connect_timeout_ms == 0 || self.broker.connect_timeout_ms > 60000 {
            return Err(invalid("connect_timeout_ms must be between 1 and 60000"));
        }

        if self.broker.client_id_prefix.is_empty() {
            return Err(invalid("client_id_prefix cannot be empty"));
        }

        // The group name becomes a topic level of every shared filter
        if self.broker.consumer_group.is_empty()
            || self.broker.consumer_group.contains(|c| matches!(c, '/' | '+' | '#'))
        {
            return Err(invalid(
                "consumer_group must be non-empty and must not contain '/', '+' or '#'",
            ));
        }

        if self.broker.channel_capacity == 0 {
            return Err(invalid("channel_capacity must be greater than 0"));
        }

        if !(self.influx.url.starts_with("http://") || self.influx.url.starts_with("https://")) {
            return Err(invalid("influx url must start with http:// or https://"));
        }

        if self.influx.database.is_empty() {
            return Err(invalid("influx database cannot be empty"));
        }

        if self.influx.timeout_ms == 0 || self.influx.timeout_ms > 60000 {
            return Err(invalid("influx timeout_ms must be between 1 and 60000"));
        }

        if self.settings.topics_file.is_empty() {
            return Err(invalid("settings topics_file cannot be empty"));
        }

        if self.sweeper.interval_s == 0 {
            return Err(invalid("sweeper interval_s must be greater than 0"));
        }

        if self.sweeper.max_pending == 0 {
            return Err(invalid("sweeper max_pending must be greater than 0"));
        }

        if self.supervisor.retry_delay_s == 0 {
            return Err(invalid("supervisor retry_delay_s must be greater than 0"));
        }

        if self.supervisor.monitor_interval_s == 0 {
            return Err(invalid("supervisor monitor_interval_s must be greater than 0"));
        }

        if self.health.enabled && self.health.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(invalid("health bind must be a socket address such as 0.0.0.0:8080"));
        }

        if self.health.timeout_ms == 0 || self.health.timeout_ms > 60000 {
            return Err(invalid("health timeout_ms must be between 1 and 60000"));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("logging level must be one of: trace, debug, info, warn, error"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> crate::error::BridgeError {
    crate::error::BridgeError::Config(toml::de::Error::custom(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_valid_config() -> Config {
        Config {
            broker: BrokerConfig::default(),
            influx: InfluxConfig::default(),
            settings: SettingsConfig::default(),
            sweeper: SweeperConfig::default(),
            supervisor: SupervisorConfig::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_default_config() {
        assert!(create_valid_config().validate().is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
[broker]
host = "mqtt.example.org"
consumer_group = "ingest"

[influx]
url = "http://influx:8181"
database = "Telemetry"

[sweeper]
interval_s = 60
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.broker.host, "mqtt.example.org");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.consumer_group, "ingest");
        assert_eq!(config.influx.database, "Telemetry");
        assert_eq!(config.sweeper.interval(), Duration::from_secs(60));
        assert_eq!(config.sweeper.max_pending, 100_000);
    }

    #[test]
    fn test_load_empty_file_uses_defaults() {
        use tempfile::NamedTempFile;

        let temp_file = NamedTempFile::new().unwrap();
        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.settings.topics_file, "config/topics.toml");
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/sensor-bridge.toml");
        assert!(matches!(result, Err(crate::error::BridgeError::Io(_))));
    }

    #[test]
    fn test_load_malformed_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[broker\nport = ").unwrap();
        temp_file.flush().unwrap();

        let result = Config::load(temp_file.path());
        assert!(matches!(result, Err(crate::error::BridgeError::Config(_))));
    }

    #[test]
    fn test_empty_host() {
        let mut config = create_valid_config();
        config.broker.host = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_zero() {
        let mut config = create_valid_config();
        config.broker.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keep_alive_too_low() {
        let mut config = create_valid_config();
        config.broker.keep_alive_s = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connect_timeout_bounds() {
        let mut config = create_valid_config();
        config.broker.connect_timeout_ms = 0;
        assert!(config.validate().is_err());

        config.broker.connect_timeout_ms = 60001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_consumer_group_with_wildcards() {
        for group in ["", "a/b", "group+", "#"] {
            let mut config = create_valid_config();
            config.broker.consumer_group = group.to_string();
            assert!(config.validate().is_err(), "group {:?} should be rejected", group);
        }
    }

    #[test]
    fn test_influx_url_scheme() {
        let mut config = create_valid_config();
        config.influx.url = "localhost:8181".to_string();
        assert!(config.validate().is_err());

        config.influx.url = "https://influx.example.org".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_database() {
        let mut config = create_valid_config();
        config.influx.database = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sweeper_zero_values() {
        let mut config = create_valid_config();
        config.sweeper.interval_s = 0;
        assert!(config.validate().is_err());

        let mut config = create_valid_config();
        config.sweeper.max_pending = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_supervisor_zero_values() {
        let mut config = create_valid_config();
        config.supervisor.retry_delay_s = 0;
        assert!(config.validate().is_err());

        let mut config = create_valid_config();
        config.supervisor.monitor_interval_s = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_health_bind_only_checked_when_enabled() {
        let mut config = create_valid_config();
        config.health.bind = "not-an-address".to_string();
        assert!(config.validate().is_err());

        config.health.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = create_valid_config();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_helpers() {
        let config = create_valid_config();
        assert_eq!(config.broker.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.influx.timeout(), Duration::from_secs(5));
        assert_eq!(config.supervisor.retry_delay(), Duration::from_secs(30));
        assert_eq!(config.supervisor.monitor_interval(), Duration::from_secs(60));
        assert_eq!(config.health.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_default_functions() {
        assert_eq!(default_broker_host(), "localhost");
        assert_eq!(default_broker_port(), 1883);
        assert_eq!(default_keep_alive_s(), 60);
        assert_eq!(default_consumer_group(), "cute-temp-group2");
        assert_eq!(default_influx_database(), "IsoPruefi");
        assert_eq!(default_sweep_interval_s(), 300);
        assert_eq!(default_max_pending(), 100_000);
        assert_eq!(default_retry_delay_s(), 30);
        assert_eq!(default_monitor_interval_s(), 60);
        assert_eq!(default_health_bind(), "0.0.0.0:8080");
        assert_eq!(default_log_level(), "info");
    }
}
