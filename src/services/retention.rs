use crate::config::HydroConfig;
use crate::error::PipelineError;
use sqlx::PgPool;

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub metric_days: u32,
    pub quality_days: u32,
    pub prediction_days: u32,
}

impl RetentionSettings {
    pub fn from_config(config: &HydroConfig) -> Self {
        Self {
            metric_days: config.metric_retention_days,
            quality_days: config.quality_retention_days,
            prediction_days: config.prediction_retention_days,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CleanupSummary {
    pub metrics_deleted: u64,
    pub quality_deleted: u64,
    pub predictions_deleted: u64,
}

impl CleanupSummary {
    pub fn total(&self) -> u64 {
        self.metrics_deleted + self.quality_deleted + self.predictions_deleted
    }

    pub fn to_detail(&self) -> serde_json::Value {
        serde_json::json!({
            "metrics_deleted": self.metrics_deleted,
            "quality_deleted": self.quality_deleted,
            "predictions_deleted": self.predictions_deleted,
        })
    }
}

/// Weekly pruning of aged derived data. Only the fine-grained 5-minute
/// metrics are pruned; coarser windows stay for long-horizon dashboards.
/// Processing job rows are never touched here.
pub async fn cleanup(db: &PgPool, settings: &RetentionSettings) -> Result<CleanupSummary, PipelineError> {
    let mut summary = CleanupSummary::default();

    let result = sqlx::query(
        r#"
        DELETE FROM computed_metrics
        WHERE time_window = '5min'
          AND window_start < now() - make_interval(days => $1)
        "#,
    )
    .bind(settings.metric_days as i32)
    .execute(db)
    .await?;
    summary.metrics_deleted = result.rows_affected();

    let result = sqlx::query(
        r#"
        DELETE FROM data_quality
        WHERE window_start < now() - make_interval(days => $1)
        "#,
    )
    .bind(settings.quality_days as i32)
    .execute(db)
    .await?;
    summary.quality_deleted = result.rows_affected();

    let result = sqlx::query(
        r#"
        DELETE FROM prediction_cache
        WHERE target_ts < now() - make_interval(days => $1)
        "#,
    )
    .bind(settings.prediction_days as i32)
    .execute(db)
    .await?;
    summary.predictions_deleted = result.rows_affected();

    tracing::info!(
        metrics_deleted = summary.metrics_deleted,
        quality_deleted = summary.quality_deleted,
        predictions_deleted = summary.predictions_deleted,
        "retention cleanup finished"
    );
    Ok(summary)
}
