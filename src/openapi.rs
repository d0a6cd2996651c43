use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::healthz_handler,
        crate::routes::pipeline::trigger_job,
        crate::routes::pipeline::list_jobs,
        crate::routes::status::pipeline_status,
    ),
    components(schemas(
        crate::routes::health::HealthResponse,
        crate::routes::pipeline::TriggerRequest,
        crate::routes::pipeline::TriggerResponse,
        crate::routes::pipeline::JobListResponse,
        crate::routes::status::PipelineStatusResponse,
        crate::routes::status::JobKindStatus,
        crate::routes::status::ModelSummary,
        crate::services::jobs::types::JobPublic,
        crate::services::jobs::types::JobStatus,
        crate::services::jobs::types::JobError,
        crate::services::jobs::types::JobKind,
    )),
    info(
        title = "hydronet-core",
        description = "Operational trigger/status surface of the water-network processing pipeline"
    )
)]
pub struct ApiDoc;

pub fn openapi_json() -> serde_json::Value {
    serde_json::to_value(ApiDoc::openapi()).unwrap_or_default()
}

async fn serve_openapi() -> Json<serde_json::Value> {
    Json(openapi_json())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(serve_openapi))
}
