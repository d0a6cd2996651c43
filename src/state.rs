use crate::cache::KeyValueCache;
use crate::config::HydroConfig;
use crate::services::jobs::PipelineJobService;
use axum::extract::FromRef;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: HydroConfig,
    pub db: PgPool,
    pub cache: Arc<dyn KeyValueCache>,
    pub jobs: Arc<PipelineJobService>,
    pub http: reqwest::Client,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.db.clone()
    }
}
