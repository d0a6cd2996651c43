use super::types::{JobError, JobKind, JobMetrics, JobRow};
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;
use uuid::Uuid;

pub const JOB_STATUS_QUEUED: &str = "queued";
pub const JOB_STATUS_RUNNING: &str = "running";
pub const JOB_STATUS_COMPLETED: &str = "completed";
pub const JOB_STATUS_FAILED: &str = "failed";

const JOB_COLUMNS: &str = r#"
    id, job_kind, status, triggered_by, items_processed, items_failed,
    detail, error, created_at, updated_at, started_at, finished_at
"#;

pub async fn create_job(
    db: &PgPool,
    kind: JobKind,
    triggered_by: &str,
) -> Result<JobRow, sqlx::Error> {
    let job_id = Uuid::new_v4();
    let row: JobRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO processing_jobs (id, job_kind, status, triggered_by, created_at, updated_at)
        VALUES ($1, $2, $3, $4, now(), now())
        RETURNING {JOB_COLUMNS}
        "#,
    ))
    .bind(job_id)
    .bind(kind.as_str())
    .bind(JOB_STATUS_QUEUED)
    .bind(triggered_by)
    .fetch_one(db)
    .await?;

    append_event(
        db,
        row.id,
        "created",
        serde_json::json!({ "job_kind": row.job_kind, "triggered_by": triggered_by }),
    )
    .await?;
    Ok(row)
}

pub async fn mark_running(db: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    let mut tx = db.begin().await?;
    sqlx::query(
        r#"
        UPDATE processing_jobs
        SET status = $2,
            started_at = now(),
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(JOB_STATUS_RUNNING)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        INSERT INTO processing_job_events (job_id, kind, payload, created_at)
        VALUES ($1, 'started', '{}'::jsonb, now())
        "#,
    )
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn mark_completed(
    db: &PgPool,
    job_id: Uuid,
    metrics: &JobMetrics,
) -> Result<(), sqlx::Error> {
    let mut tx = db.begin().await?;
    sqlx::query(
        r#"
        UPDATE processing_jobs
        SET status = $2,
            items_processed = $3,
            items_failed = $4,
            detail = $5,
            finished_at = now(),
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(JOB_STATUS_COMPLETED)
    .bind(metrics.processed as i64)
    .bind(metrics.failed as i64)
    .bind(SqlJson(metrics.detail.clone()))
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        INSERT INTO processing_job_events (job_id, kind, payload, created_at)
        VALUES ($1, 'completed', $2, now())
        "#,
    )
    .bind(job_id)
    .bind(SqlJson(serde_json::json!({
        "processed": metrics.processed,
        "failed": metrics.failed,
    })))
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn mark_failed(db: &PgPool, job_id: Uuid, error: JobError) -> Result<(), sqlx::Error> {
    let mut tx = db.begin().await?;
    sqlx::query(
        r#"
        UPDATE processing_jobs
        SET status = $2,
            error = $3,
            finished_at = now(),
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(JOB_STATUS_FAILED)
    .bind(SqlJson(error.clone()))
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        INSERT INTO processing_job_events (job_id, kind, payload, created_at)
        VALUES ($1, 'failed', $2, now())
        "#,
    )
    .bind(job_id)
    .bind(SqlJson(serde_json::json!({ "code": error.code })))
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn append_event(
    db: &PgPool,
    job_id: Uuid,
    kind: &str,
    payload: serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO processing_job_events (job_id, kind, payload, created_at)
        VALUES ($1, $2, $3, now())
        "#,
    )
    .bind(job_id)
    .bind(kind)
    .bind(SqlJson(payload))
    .execute(db)
    .await?;
    Ok(())
}

pub async fn get_job(db: &PgPool, job_id: Uuid) -> Result<Option<JobRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM processing_jobs
        WHERE id = $1
        LIMIT 1
        "#,
    ))
    .bind(job_id)
    .fetch_optional(db)
    .await
}

pub async fn find_running(db: &PgPool, kind: JobKind) -> Result<Option<JobRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM processing_jobs
        WHERE job_kind = $1 AND status = $2
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    ))
    .bind(kind.as_str())
    .bind(JOB_STATUS_RUNNING)
    .fetch_optional(db)
    .await
}

/// Newest job row per kind, for the status surface.
pub async fn latest_per_kind(db: &PgPool) -> Result<Vec<JobRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        r#"
        SELECT DISTINCT ON (job_kind) {JOB_COLUMNS}
        FROM processing_jobs
        ORDER BY job_kind, created_at DESC
        "#,
    ))
    .fetch_all(db)
    .await
}

/// Newest successfully completed job row per kind.
pub async fn latest_completed_per_kind(db: &PgPool) -> Result<Vec<JobRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        r#"
        SELECT DISTINCT ON (job_kind) {JOB_COLUMNS}
        FROM processing_jobs
        WHERE status = $1
        ORDER BY job_kind, created_at DESC
        "#,
    ))
    .bind(JOB_STATUS_COMPLETED)
    .fetch_all(db)
    .await
}

pub async fn recent_jobs(db: &PgPool, limit: i64) -> Result<Vec<JobRow>, sqlx::Error> {
    let limit = limit.clamp(1, 200);
    sqlx::query_as(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM processing_jobs
        ORDER BY created_at DESC
        LIMIT $1
        "#,
    ))
    .bind(limit)
    .fetch_all(db)
    .await
}
