pub mod client;
pub mod lifecycle;
pub mod store;

pub use client::{ForecastError, ForecastPoint, ForecastProvider, HttpForecastService};
pub use lifecycle::{ModelKind, ModelStatus};
pub use store::{ModelRow, ModelStoreError, PredictionUpsert};

use crate::config::HydroConfig;
use crate::error::PipelineError;
use crate::services::jobs::types::NodeFailure;
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PredictionSettings {
    pub concurrency: usize,
    pub horizon_hours: u32,
    pub step_minutes: u32,
    pub mape_degraded_threshold: f64,
}

impl PredictionSettings {
    pub fn from_config(config: &HydroConfig) -> Self {
        Self {
            concurrency: config.aggregation_concurrency,
            horizon_hours: config.prediction_horizon_hours,
            step_minutes: config.prediction_step_minutes,
            mape_degraded_threshold: config.mape_degraded_threshold,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PredictionBatchResult {
    pub nodes_processed: u32,
    pub nodes_failed: u32,
    pub predictions_written: u64,
    pub failures: Vec<NodeFailure>,
    pub no_active_model: bool,
}

impl PredictionBatchResult {
    pub fn to_detail(&self) -> serde_json::Value {
        serde_json::json!({
            "nodes_processed": self.nodes_processed,
            "nodes_failed": self.nodes_failed,
            "predictions_written": self.predictions_written,
            "failures": self.failures,
            "no_active_model": self.no_active_model,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationSummary {
    pub models_evaluated: u32,
    pub degraded: Vec<String>,
}

impl EvaluationSummary {
    pub fn to_detail(&self) -> serde_json::Value {
        serde_json::json!({
            "models_evaluated": self.models_evaluated,
            "degraded": self.degraded,
        })
    }
}

/// Mean absolute percentage error and mean absolute error over
/// (predicted, realized) pairs. Pairs with a near-zero realized value are
/// excluded from the MAPE term.
pub fn mape_mae(pairs: &[(f64, f64)]) -> Option<(f64, f64)> {
    if pairs.is_empty() {
        return None;
    }
    let mae = pairs
        .iter()
        .map(|(predicted, realized)| (predicted - realized).abs())
        .sum::<f64>()
        / pairs.len() as f64;
    let pct_terms: Vec<f64> = pairs
        .iter()
        .filter(|(_, realized)| realized.abs() > 1e-9)
        .map(|(predicted, realized)| ((predicted - realized) / realized).abs())
        .collect();
    if pct_terms.is_empty() {
        return None;
    }
    let mape = pct_terms.iter().sum::<f64>() / pct_terms.len() as f64;
    Some((mape, mae))
}

/// Owns the model lifecycle and the prediction cache. Forecasting itself
/// is delegated to the managed service behind `ForecastProvider`.
pub struct PredictionManager {
    db: PgPool,
    provider: Arc<dyn ForecastProvider>,
    settings: PredictionSettings,
}

impl PredictionManager {
    pub fn new(
        db: PgPool,
        provider: Arc<dyn ForecastProvider>,
        settings: PredictionSettings,
    ) -> Self {
        Self {
            db,
            provider,
            settings,
        }
    }

    pub fn provider(&self) -> Arc<dyn ForecastProvider> {
        self.provider.clone()
    }

    pub async fn promote(&self, model_id: Uuid) -> Result<ModelRow, ModelStoreError> {
        store::promote(&self.db, model_id).await
    }

    /// Requests a forecast from the active flow model for each node and
    /// upserts the points. One node's forecasting failure is recorded and
    /// does not block the rest of the batch.
    pub async fn generate_predictions(
        &self,
        node_ids: &[Uuid],
        horizon_hours: u32,
    ) -> Result<PredictionBatchResult, PipelineError> {
        let mut result = PredictionBatchResult::default();
        let Some(model) = store::active_model(&self.db, ModelKind::FlowForecast).await? else {
            tracing::info!("no active flow-forecast model; skipping prediction batch");
            result.no_active_model = true;
            return Ok(result);
        };

        let from = Utc::now();
        let model_ref = model.service_ref();
        let outcomes: Vec<(Uuid, Result<u64, String>)> = stream::iter(node_ids.iter().copied())
            .map(|node_id| {
                let model_ref = model_ref.clone();
                let model_id = model.id;
                async move {
                    let outcome = self
                        .predict_node(model_id, &model_ref, node_id, from, horizon_hours)
                        .await;
                    (node_id, outcome)
                }
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for (node_id, outcome) in outcomes {
            match outcome {
                Ok(written) => {
                    result.nodes_processed += 1;
                    result.predictions_written += written;
                }
                Err(message) => {
                    tracing::warn!(node_id = %node_id, error = %message, "node forecast failed; continuing");
                    result.nodes_failed += 1;
                    result.failures.push(NodeFailure { node_id, message });
                }
            }
        }
        Ok(result)
    }

    async fn predict_node(
        &self,
        model_id: Uuid,
        model_ref: &str,
        node_id: Uuid,
        from: chrono::DateTime<Utc>,
        horizon_hours: u32,
    ) -> Result<u64, String> {
        let points = self
            .provider
            .forecast(
                model_ref,
                node_id,
                from,
                horizon_hours,
                self.settings.step_minutes,
            )
            .await
            .map_err(|err| err.to_string())?;

        let mut written = 0u64;
        for point in points {
            store::upsert_prediction(
                &self.db,
                &PredictionUpsert {
                    model_id,
                    node_id,
                    target_ts: point.target_ts,
                    predicted_value: point.value,
                    lower_bound: point.lower,
                    upper_bound: point.upper,
                    confidence: point.confidence.clamp(0.0, 1.0),
                },
            )
            .await
            .map_err(|err| err.to_string())?;
            written += 1;
        }
        Ok(written)
    }

    /// Daily evaluation: rolling MAPE/MAE over the trailing seven days of
    /// realized predictions. A degraded flag is informational; the model
    /// stays active.
    pub async fn evaluate_models(&self) -> Result<EvaluationSummary, PipelineError> {
        let mut summary = EvaluationSummary::default();
        let since = Utc::now() - ChronoDuration::days(7);

        for model in store::active_models(&self.db).await? {
            let rows = store::realized_predictions(&self.db, model.id, since).await?;
            let pairs: Vec<(f64, f64)> = rows
                .iter()
                .map(|row| (row.predicted_value, row.realized_value))
                .collect();

            let evaluation = match mape_mae(&pairs) {
                Some((mape, mae)) => {
                    let degraded = mape > self.settings.mape_degraded_threshold;
                    if degraded {
                        tracing::warn!(
                            model_id = %model.id,
                            model_type = %model.model_type,
                            mape,
                            threshold = self.settings.mape_degraded_threshold,
                            "model accuracy degraded over the trailing week"
                        );
                        summary.degraded.push(model.model_type.clone());
                    }
                    serde_json::json!({
                        "mape": mape,
                        "mae": mae,
                        "samples": pairs.len(),
                        "degraded": degraded,
                        "evaluated_at": Utc::now().to_rfc3339(),
                    })
                }
                None => serde_json::json!({
                    "samples": pairs.len(),
                    "degraded": false,
                    "evaluated_at": Utc::now().to_rfc3339(),
                }),
            };

            store::record_evaluation(&self.db, model.id, evaluation).await?;
            summary.models_evaluated += 1;
        }
        Ok(summary)
    }
}
