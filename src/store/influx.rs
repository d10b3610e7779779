//! InfluxDB HTTP client.
//!
//! Writes go through the v2-compatible `/api/v2/write` endpoint, queries
//! through the v1-compatible `/query` endpoint (InfluxQL, JSON results), and
//! reachability is checked with `/ping`. All three are served by InfluxDB 2.x
//! and 3.x.

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::RequestBuilder;
use serde::Deserialize;
use tracing::debug;

use super::{Point, RangeQuery, Row, TimeSeriesStore};
use crate::config::InfluxConfig;
use crate::error::{BridgeError, Result};

/// InfluxDB store backed by a pooled `reqwest` client
pub struct InfluxStore {
    http: reqwest::Client,
    base_url: String,
    database: String,
    token: String,
}

impl std::fmt::Debug for InfluxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxStore")
            .field("base_url", &self.base_url)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl InfluxStore {
    /// Build a client from configuration
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Http` if the HTTP client cannot be constructed
    /// (for example when the TLS backend fails to initialize).
    pub fn new(config: &InfluxConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            token: config.token.clone(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        if self.token.is_empty() {
            request
        } else {
            request.header(AUTHORIZATION, format!("Token {}", self.token))
        }
    }

    async fn run_statement(&self, statement: &str) -> Result<Vec<Row>> {
        let request = self
            .http
            .get(format!("{}/query", self.base_url))
            .query(&[("db", self.database.as_str()), ("q", statement)]);

        let response = self.authorized(request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(BridgeError::Store(format!("query returned {}: {}", status, body)));
        }

        parse_query_response(&body)
    }
}

#[async_trait]
impl TimeSeriesStore for InfluxStore {
    async fn write_point(&self, point: &Point) -> Result<()> {
        let line = point.to_line_protocol();
        let request = self
            .http
            .post(format!("{}/api/v2/write", self.base_url))
            .query(&[("bucket", self.database.as_str()), ("precision", "s")])
            .body(line);

        let response = self.authorized(request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Store(format!("write returned {}: {}", status, body)));
        }

        debug!("Wrote {} point to InfluxDB", point.measurement);
        Ok(())
    }

    async fn query_range(&self, query: &RangeQuery) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for statement in query.statements() {
            rows.extend(self.run_statement(&statement).await?);
        }
        Ok(rows)
    }

    async fn ping(&self) -> Result<()> {
        let request = self.http.get(format!("{}/ping", self.base_url));
        let response = self.authorized(request).send().await?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else {
            Err(BridgeError::Store(format!("ping returned {}", status)))
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    values: Vec<Row>,
}

/// Flatten a v1 `/query` JSON body into rows.
fn parse_query_response(body: &str) -> Result<Vec<Row>> {
    let response: QueryResponse = serde_json::from_str(body)?;

    if let Some(error) = response.error {
        return Err(BridgeError::Store(error));
    }

    let mut rows = Vec::new();
    for result in response.results {
        if let Some(error) = result.error {
            return Err(BridgeError::Store(error));
        }
        for series in result.series {
            rows.extend(series.values);
        }
    }
    Ok(rows)
}
