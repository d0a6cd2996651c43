use super::lifecycle::{ModelKind, ModelStatus};
use chrono::{DateTime, Utc};
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ModelStoreError {
    #[error("model {0} not found")]
    NotFound(Uuid),
    #[error("illegal model transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

const MODEL_COLUMNS: &str = r#"
    id, model_type, version, status, metrics, trained_from, trained_to,
    artifact_uri, created_at, updated_at
"#;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ModelRow {
    pub id: Uuid,
    pub model_type: String,
    pub version: String,
    pub status: String,
    pub metrics: SqlJson<serde_json::Value>,
    pub trained_from: Option<DateTime<Utc>>,
    pub trained_to: Option<DateTime<Utc>>,
    pub artifact_uri: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelRow {
    pub fn status_enum(&self) -> ModelStatus {
        ModelStatus::parse(&self.status).unwrap_or_else(|| {
            tracing::warn!(model_id = %self.id, status = %self.status, "unknown model status; treating as retired");
            ModelStatus::Retired
        })
    }

    pub fn kind_enum(&self) -> Option<ModelKind> {
        ModelKind::parse(&self.model_type)
    }

    /// Reference handed to the forecasting service.
    pub fn service_ref(&self) -> String {
        self.artifact_uri
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    pub fn is_degraded(&self) -> bool {
        self.metrics.0["degraded"].as_bool().unwrap_or(false)
    }
}

pub async fn register_model(
    db: &PgPool,
    kind: ModelKind,
    version: &str,
    artifact_uri: Option<&str>,
) -> Result<ModelRow, sqlx::Error> {
    sqlx::query_as(&format!(
        r#"
        INSERT INTO ml_models (id, model_type, version, status, artifact_uri, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, now(), now())
        RETURNING {MODEL_COLUMNS}
        "#,
    ))
    .bind(Uuid::new_v4())
    .bind(kind.as_str())
    .bind(version)
    .bind(ModelStatus::Created.as_str())
    .bind(artifact_uri)
    .fetch_one(db)
    .await
}

pub async fn get_model(db: &PgPool, model_id: Uuid) -> Result<Option<ModelRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        r#"
        SELECT {MODEL_COLUMNS}
        FROM ml_models
        WHERE id = $1
        LIMIT 1
        "#,
    ))
    .bind(model_id)
    .fetch_optional(db)
    .await
}

/// Walks a model one step along the lifecycle. Illegal edges are rejected
/// before any row is touched; the row is locked for the duration of the
/// check-then-set.
pub async fn advance_status(
    db: &PgPool,
    model_id: Uuid,
    next: ModelStatus,
) -> Result<ModelRow, ModelStoreError> {
    let mut tx = db.begin().await?;
    let current: Option<ModelRow> = sqlx::query_as(&format!(
        r#"
        SELECT {MODEL_COLUMNS}
        FROM ml_models
        WHERE id = $1
        FOR UPDATE
        "#,
    ))
    .bind(model_id)
    .fetch_optional(&mut *tx)
    .await?;

    let current = current.ok_or(ModelStoreError::NotFound(model_id))?;
    if !current.status_enum().can_transition(next) {
        return Err(ModelStoreError::IllegalTransition {
            from: current.status.clone(),
            to: next.as_str().to_string(),
        });
    }

    let updated: ModelRow = sqlx::query_as(&format!(
        r#"
        UPDATE ml_models
        SET status = $2, updated_at = now()
        WHERE id = $1
        RETURNING {MODEL_COLUMNS}
        "#,
    ))
    .bind(model_id)
    .bind(next.as_str())
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(updated)
}

/// Atomic promotion swap: retires whichever model of the same type is
/// currently active and activates the candidate in one transaction.
/// Concurrent callers serialize on the candidate's row lock, so readers
/// observe either the old or the new active model, never neither.
pub async fn promote(db: &PgPool, model_id: Uuid) -> Result<ModelRow, ModelStoreError> {
    let mut tx = db.begin().await?;

    // Serializes promotions per model type; the partial unique index on
    // (model_type) WHERE status = 'active' backstops the invariant.
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext('ml_models_promote'), hashtext((SELECT model_type FROM ml_models WHERE id = $1)))")
        .bind(model_id)
        .execute(&mut *tx)
        .await?;

    let candidate: Option<ModelRow> = sqlx::query_as(&format!(
        r#"
        SELECT {MODEL_COLUMNS}
        FROM ml_models
        WHERE id = $1
        FOR UPDATE
        "#,
    ))
    .bind(model_id)
    .fetch_optional(&mut *tx)
    .await?;
    let candidate = candidate.ok_or(ModelStoreError::NotFound(model_id))?;

    if !candidate.status_enum().is_promotable() {
        return Err(ModelStoreError::IllegalTransition {
            from: candidate.status.clone(),
            to: ModelStatus::Active.as_str().to_string(),
        });
    }

    sqlx::query(
        r#"
        UPDATE ml_models
        SET status = $2, updated_at = now()
        WHERE model_type = $1 AND status = $3 AND id <> $4
        "#,
    )
    .bind(&candidate.model_type)
    .bind(ModelStatus::Retired.as_str())
    .bind(ModelStatus::Active.as_str())
    .bind(candidate.id)
    .execute(&mut *tx)
    .await?;

    let promoted: ModelRow = sqlx::query_as(&format!(
        r#"
        UPDATE ml_models
        SET status = $2, updated_at = now()
        WHERE id = $1
        RETURNING {MODEL_COLUMNS}
        "#,
    ))
    .bind(candidate.id)
    .bind(ModelStatus::Active.as_str())
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    tracing::info!(
        model_id = %promoted.id,
        model_type = %promoted.model_type,
        version = %promoted.version,
        "model promoted to active"
    );
    Ok(promoted)
}

pub async fn active_model(db: &PgPool, kind: ModelKind) -> Result<Option<ModelRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        r#"
        SELECT {MODEL_COLUMNS}
        FROM ml_models
        WHERE model_type = $1 AND status = $2
        LIMIT 1
        "#,
    ))
    .bind(kind.as_str())
    .bind(ModelStatus::Active.as_str())
    .fetch_optional(db)
    .await
}

pub async fn active_models(db: &PgPool) -> Result<Vec<ModelRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        r#"
        SELECT {MODEL_COLUMNS}
        FROM ml_models
        WHERE status = $1
        ORDER BY model_type
        "#,
    ))
    .bind(ModelStatus::Active.as_str())
    .fetch_all(db)
    .await
}

/// Merges an evaluation result into the model's performance metrics.
pub async fn record_evaluation(
    db: &PgPool,
    model_id: Uuid,
    evaluation: serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE ml_models
        SET metrics = metrics || $2,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(model_id)
    .bind(SqlJson(evaluation))
    .execute(db)
    .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PredictionUpsert {
    pub model_id: Uuid,
    pub node_id: Uuid,
    pub target_ts: DateTime<Utc>,
    pub predicted_value: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub confidence: f64,
}

/// Re-running a horizon overwrites rather than duplicates: the prediction
/// cache is unique on (model, node, target timestamp).
pub async fn upsert_prediction(db: &PgPool, row: &PredictionUpsert) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO prediction_cache (
            model_id, node_id, target_ts, predicted_value,
            lower_bound, upper_bound, confidence, generated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, now())
        ON CONFLICT (model_id, node_id, target_ts)
        DO UPDATE SET
            predicted_value = EXCLUDED.predicted_value,
            lower_bound = EXCLUDED.lower_bound,
            upper_bound = EXCLUDED.upper_bound,
            confidence = EXCLUDED.confidence,
            generated_at = now()
        "#,
    )
    .bind(row.model_id)
    .bind(row.node_id)
    .bind(row.target_ts)
    .bind(row.predicted_value)
    .bind(row.lower_bound)
    .bind(row.upper_bound)
    .bind(row.confidence)
    .execute(db)
    .await?;
    Ok(())
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct RealizedPrediction {
    pub predicted_value: f64,
    pub realized_value: f64,
}

/// Predictions whose target has passed, paired with the realized hourly
/// average flow from the computed metrics.
pub async fn realized_predictions(
    db: &PgPool,
    model_id: Uuid,
    since: DateTime<Utc>,
) -> Result<Vec<RealizedPrediction>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT p.predicted_value,
               m.avg_flow_rate AS realized_value
        FROM prediction_cache p
        JOIN computed_metrics m
          ON m.node_id = p.node_id
         AND m.time_window = '1hour'
         AND m.window_start <= p.target_ts
         AND p.target_ts < m.window_end
        WHERE p.model_id = $1
          AND p.target_ts >= $2
          AND p.target_ts < now()
          AND m.avg_flow_rate IS NOT NULL
        "#,
    )
    .bind(model_id)
    .bind(since)
    .fetch_all(db)
    .await
}
