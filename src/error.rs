//! # Error Types
//!
//! Custom error types for Sensor Bridge using `thiserror`.

use thiserror::Error;

/// Main error type for Sensor Bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Broker transport errors (connect, disconnect, CONNACK refused)
    #[error("Broker error: {0}")]
    Broker(String),

    /// A subscribe request was rejected or could not be queued
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// Settings store errors
    #[error("Settings error: {0}")]
    Settings(String),

    /// Time-series store errors (non-success HTTP status, bad response body)
    #[error("Store error: {0}")]
    Store(String),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An operation did not finish within its deadline
    #[error("Timed out: {0}")]
    Timeout(String),
}

/// Result type alias for Sensor Bridge
pub type Result<T> = std::result::Result<T, BridgeError>;
