use crate::retry::{with_backoff, BackoffPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ForecastError {
    #[error("forecast service i/o failed: {0}")]
    Transient(String),
    #[error("forecast service rejected request: {0}")]
    Rejected(String),
    #[error("forecast service returned malformed payload: {0}")]
    Decode(String),
}

/// One forecast point for a node at a target timestamp.
#[derive(Debug, Clone, Deserialize)]
pub struct ForecastPoint {
    pub target_ts: DateTime<Utc>,
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyVerdict {
    pub is_anomaly: bool,
    pub score: f64,
}

/// The managed forecasting/anomaly service. Models are referenced by the
/// registry's artifact URI; training happens entirely on the service side.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn forecast(
        &self,
        model_ref: &str,
        node_id: Uuid,
        from: DateTime<Utc>,
        horizon_hours: u32,
        step_minutes: u32,
    ) -> Result<Vec<ForecastPoint>, ForecastError>;

    async fn anomaly_score(
        &self,
        model_ref: &str,
        node_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<AnomalyVerdict, ForecastError>;
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    points: Vec<ForecastPoint>,
}

pub struct HttpForecastService {
    base_url: String,
    api_token: Option<String>,
    http: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpForecastService {
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

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ForecastError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.http.post(&url).json(body);
        if let Some(token) = self.api_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| ForecastError::Transient(err.to_string()))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(ForecastError::Transient(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            return Err(ForecastError::Rejected(format!("{url} returned {status}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl ForecastProvider for HttpForecastService {
    async fn forecast(
        &self,
        model_ref: &str,
        node_id: Uuid,
        from: DateTime<Utc>,
        horizon_hours: u32,
        step_minutes: u32,
    ) -> Result<Vec<ForecastPoint>, ForecastError> {
        let body = serde_json::json!({
            "model": model_ref,
            "node_id": node_id,
            "from_ts": from.to_rfc3339(),
            "horizon_hours": horizon_hours,
            "step_minutes": step_minutes,
        });
        let response = with_backoff(&self.backoff, "forecast_request", || {
            self.post("/v1/forecast", &body)
        })
        .await?;
        let payload: ForecastResponse = response
            .json()
            .await
            .map_err(|err| ForecastError::Decode(err.to_string()))?;
        Ok(payload.points)
    }

    async fn anomaly_score(
        &self,
        model_ref: &str,
        node_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<AnomalyVerdict, ForecastError> {
        let body = serde_json::json!({
            "model": model_ref,
            "node_id": node_id,
            "window_start": window_start.to_rfc3339(),
            "window_end": window_end.to_rfc3339(),
        });
        let response = with_backoff(&self.backoff, "anomaly_score_request", || {
            self.post("/v1/anomaly/score", &body)
        })
        .await?;
        response
            .json()
            .await
            .map_err(|err| ForecastError::Decode(err.to_string()))
    }
}
