use crate::model::SensorReading;
use crate::retry::{with_backoff, BackoffPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("warehouse i/o failed: {0}")]
    Transient(String),
    #[error("warehouse rejected request: {0}")]
    Rejected(String),
    #[error("warehouse returned malformed payload: {0}")]
    Decode(String),
}

/// Read-only access to the cold-tier warehouse holding raw readings.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Cheap reachability probe; a failure here is systemic and aborts the
    /// whole run rather than being charged to individual nodes.
    async fn ping(&self) -> Result<(), WarehouseError>;

    /// Raw readings for one node in `[start, end)`, ascending by timestamp.
    async fn fetch_readings(
        &self,
        node_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>, WarehouseError>;
}

#[derive(Debug, Deserialize)]
struct ReadingsResponse {
    rows: Vec<ReadingPayload>,
}

#[derive(Debug, Deserialize)]
struct ReadingPayload {
    ts: DateTime<Utc>,
    flow_rate: f64,
    pressure: f64,
    temperature: f64,
    cumulative_volume: f64,
    #[serde(default = "default_quality")]
    quality: f64,
}

fn default_quality() -> f64 {
    1.0
}

pub struct HttpWarehouse {
    base_url: String,
    api_token: Option<String>,
    http: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpWarehouse {
    pub fn new(
        base_url: String,
        api_token: Option<String>,
        http: reqwest::Client,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            http,
            backoff,
        }
    }

    async fn post_query(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, WarehouseError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.http.post(&url).json(body);
        if let Some(token) = self.api_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| WarehouseError::Transient(err.to_string()))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(WarehouseError::Transient(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            return Err(WarehouseError::Rejected(format!("{url} returned {status}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl ReadingStore for HttpWarehouse {
    async fn ping(&self) -> Result<(), WarehouseError> {
        let url = format!("{}/v1/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| WarehouseError::Transient(err.to_string()))?;
        if !response.status().is_success() {
            return Err(WarehouseError::Transient(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn fetch_readings(
        &self,
        node_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>, WarehouseError> {
        let body = serde_json::json!({
            "node_id": node_id,
            "start_ts": start.to_rfc3339(),
            "end_ts": end.to_rfc3339(),
        });

        let response = with_backoff(&self.backoff, "warehouse_readings_query", || {
            self.post_query("/v1/readings/query", &body)
        })
        .await?;

        let payload: ReadingsResponse = response
            .json()
            .await
            .map_err(|err| WarehouseError::Decode(err.to_string()))?;

        let mut readings: Vec<SensorReading> = payload
            .rows
            .into_iter()
            .map(|row| SensorReading {
                node_id,
                ts: row.ts,
                flow_rate: row.flow_rate,
                pressure: row.pressure,
                temperature: row.temperature,
                cumulative_volume: row.cumulative_volume,
                quality: row.quality.clamp(0.0, 1.0),
            })
            .collect();
        readings.sort_by_key(|reading| reading.ts);
        Ok(readings)
    }
}
