//! # Sensor Bridge Library
//!
//! Ingest temperature telemetry from MQTT into InfluxDB.
//!
//! Sensors publish JSON readings on per-sensor topics. The bridge holds one
//! shared-subscription connection to the broker, normalizes single and
//! recovered (batched) readings, and writes them through an in-memory
//! pending table that a background sweeper retries while the store is down.
//!
//! ```text
//! broker ──> ConnectionManager ──> ReadingRouter ──> CacheGateway ──> InfluxDB
//!                 ^                                       │
//!            Supervisor ── SubscriptionManager      RetrySweeper
//! ```

pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod reading;
pub mod router;
pub mod store;
pub mod subscription;
pub mod supervisor;
pub mod sweeper;
