use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{internal_error, map_db_error};
use crate::services::jobs::{store, JobKind, JobPublic, RunOutcome};
use crate::state::AppState;

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct TriggerRequest {
    pub job_kind: String,
    #[serde(default)]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct TriggerResponse {
    pub job: JobPublic,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct JobListResponse {
    pub jobs: Vec<JobPublic>,
}

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    #[serde(default)]
    limit: Option<i64>,
}

#[utoipa::path(
    post,
    path = "/api/pipeline/trigger",
    tag = "pipeline",
    request_body = TriggerRequest,
    responses(
        (status = 200, description = "Job executed", body = TriggerResponse),
        (status = 400, description = "Invalid request"),
        (status = 409, description = "Job of this kind already running")
    )
)]
pub async fn trigger_job(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, (StatusCode, String)> {
    let Some(kind) = JobKind::parse(&request.job_kind) else {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("unknown job_kind: {}", request.job_kind),
        ));
    };

    let range = match (request.start_ts, request.end_ts) {
        (None, None) => None,
        (Some(start), Some(end)) if start < end => Some((start, end)),
        (Some(_), Some(_)) => {
            return Err((
                StatusCode::BAD_REQUEST,
                "start_ts must precede end_ts".to_string(),
            ));
        }
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                "start_ts and end_ts must be provided together".to_string(),
            ));
        }
    };

    match state.jobs.run_once(kind, "manual", range).await {
        Ok(RunOutcome::Ran(job)) => Ok(Json(TriggerResponse {
            job: job.to_public(),
        })),
        Ok(RunOutcome::Skipped { running_job_id }) => Err((
            StatusCode::CONFLICT,
            match running_job_id {
                Some(id) => format!("{} is already running (job {id})", kind.as_str()),
                None => format!("{} is already running", kind.as_str()),
            },
        )),
        Err(err) => Err(internal_error(err)),
    }
}

#[utoipa::path(
    get,
    path = "/api/pipeline/jobs",
    tag = "pipeline",
    responses((status = 200, description = "Recent job audit rows", body = JobListResponse))
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> Result<Json<JobListResponse>, (StatusCode, String)> {
    let rows = store::recent_jobs(&state.db, query.limit.unwrap_or(50))
        .await
        .map_err(map_db_error)?;
    Ok(Json(JobListResponse {
        jobs: rows.iter().map(|row| row.to_public()).collect(),
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/pipeline/trigger", post(trigger_job))
        .route("/pipeline/jobs", get(list_jobs))
}
