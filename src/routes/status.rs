use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::collections::HashMap;

use crate::error::map_db_error;
use crate::services::jobs::{store, JobKind, JobStatus};
use crate::services::ml::store as ml_store;
use crate::state::AppState;

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobKindStatus {
    pub job_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<String>,
    pub items_failed: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ModelSummary {
    pub model_type: String,
    pub version: String,
    pub status: String,
    pub degraded: bool,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct PipelineStatusResponse {
    pub jobs: Vec<JobKindStatus>,
    pub models: Vec<ModelSummary>,
    /// None when the hot cache is unreachable; the pipeline keeps running
    /// on warm-store reads in that state.
    pub cache_keys: Option<usize>,
}

#[utoipa::path(
    get,
    path = "/api/pipeline/status",
    tag = "pipeline",
    responses((status = 200, description = "Pipeline health overview", body = PipelineStatusResponse))
)]
pub async fn pipeline_status(
    State(state): State<AppState>,
) -> Result<Json<PipelineStatusResponse>, (StatusCode, String)> {
    let latest = store::latest_per_kind(&state.db)
        .await
        .map_err(map_db_error)?;
    let successes = store::latest_completed_per_kind(&state.db)
        .await
        .map_err(map_db_error)?;
    let by_kind: HashMap<&str, _> = latest
        .iter()
        .map(|row| (row.job_kind.as_str(), row))
        .collect();
    let success_by_kind: HashMap<&str, _> = successes
        .iter()
        .map(|row| (row.job_kind.as_str(), row))
        .collect();

    let jobs = JobKind::ALL
        .iter()
        .map(|kind| {
            let last_success_at = success_by_kind
                .get(kind.as_str())
                .and_then(|row| row.finished_at)
                .map(|ts| ts.to_rfc3339());
            match by_kind.get(kind.as_str()) {
                Some(row) => JobKindStatus {
                    job_kind: kind.as_str().to_string(),
                    last_status: Some(row.status_enum()),
                    last_finished_at: row.finished_at.map(|ts| ts.to_rfc3339()),
                    last_success_at,
                    items_failed: row.items_failed,
                    last_error_code: row.error.as_ref().map(|err| err.0.code.clone()),
                },
                None => JobKindStatus {
                    job_kind: kind.as_str().to_string(),
                    last_status: None,
                    last_finished_at: None,
                    last_success_at,
                    items_failed: 0,
                    last_error_code: None,
                },
            }
        })
        .collect();

    let models = ml_store::active_models(&state.db)
        .await
        .map_err(map_db_error)?
        .iter()
        .map(|model| ModelSummary {
            model_type: model.model_type.clone(),
            version: model.version.clone(),
            status: model.status.clone(),
            degraded: model.is_degraded(),
        })
        .collect();

    let cache_keys = match state.cache.key_count().await {
        Ok(count) => Some(count),
        Err(err) => {
            tracing::warn!(error = %err, "cache key count unavailable");
            None
        }
    };

    Ok(Json(PipelineStatusResponse {
        jobs,
        models,
        cache_keys,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/pipeline/status", get(pipeline_status))
}
