//! End-to-end pipeline properties against a real PostgreSQL instance.
//!
//! These tests are skipped unless HYDRO_INTEGRATION_TEST=1 and
//! HYDRO_TEST_DATABASE_URL point at a disposable database; each test works
//! inside its own schema.

use crate::cache::KeyValueCache;
use crate::model::SensorReading;
use crate::services::jobs::{JobKind, JobStatus, RunOutcome};
use crate::services::ml::{store as ml_store, ModelKind, ModelStatus, ModelStoreError};
use crate::test_support::harness_with_pool;
use crate::time::TimeWindow;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;
use std::time::Duration;
use uuid::Uuid;

const SCHEMA_DDL: &str = r#"
CREATE TABLE monitoring_nodes (
    id uuid PRIMARY KEY,
    name text NOT NULL,
    zone text NOT NULL DEFAULT 'default',
    kind text NOT NULL DEFAULT 'distribution',
    active boolean NOT NULL DEFAULT true,
    created_at timestamptz NOT NULL DEFAULT now()
);
CREATE TABLE node_latest_readings (
    node_id uuid PRIMARY KEY,
    ts timestamptz NOT NULL,
    flow_rate double precision NOT NULL,
    pressure double precision NOT NULL,
    temperature double precision NOT NULL,
    cumulative_volume double precision NOT NULL,
    quality double precision NOT NULL DEFAULT 1.0,
    updated_at timestamptz NOT NULL DEFAULT now()
);
CREATE TABLE computed_metrics (
    node_id uuid NOT NULL,
    time_window text NOT NULL,
    window_start timestamptz NOT NULL,
    window_end timestamptz NOT NULL,
    avg_flow_rate double precision,
    min_flow_rate double precision,
    max_flow_rate double precision,
    stddev_flow_rate double precision,
    avg_pressure double precision,
    min_pressure double precision,
    max_pressure double precision,
    stddev_pressure double precision,
    total_volume double precision NOT NULL DEFAULT 0,
    reading_count bigint NOT NULL DEFAULT 0,
    anomaly_count bigint NOT NULL DEFAULT 0,
    completeness_pct double precision NOT NULL DEFAULT 0,
    quality_score double precision NOT NULL DEFAULT 0,
    computed_at timestamptz NOT NULL DEFAULT now(),
    PRIMARY KEY (node_id, time_window, window_start)
);
CREATE TABLE data_quality (
    node_id uuid NOT NULL,
    time_window text NOT NULL,
    window_start timestamptz NOT NULL,
    completeness double precision NOT NULL,
    validity double precision NOT NULL,
    consistency double precision NOT NULL,
    overall_score double precision NOT NULL,
    issues jsonb NOT NULL DEFAULT '[]'::jsonb,
    created_at timestamptz NOT NULL DEFAULT now(),
    PRIMARY KEY (node_id, time_window, window_start)
);
CREATE TABLE network_efficiency (
    id bigserial PRIMARY KEY,
    zone text NOT NULL,
    window_start timestamptz NOT NULL,
    window_end timestamptz NOT NULL,
    input_volume double precision NOT NULL DEFAULT 0,
    output_volume double precision NOT NULL DEFAULT 0,
    loss_volume double precision NOT NULL DEFAULT 0,
    efficiency_pct double precision NOT NULL DEFAULT 0,
    active_nodes int NOT NULL DEFAULT 0,
    total_nodes int NOT NULL DEFAULT 0,
    anomaly_count bigint NOT NULL DEFAULT 0,
    created_at timestamptz NOT NULL DEFAULT now()
);
CREATE TABLE ml_models (
    id uuid PRIMARY KEY,
    model_type text NOT NULL,
    version text NOT NULL,
    status text NOT NULL DEFAULT 'created',
    metrics jsonb NOT NULL DEFAULT '{}'::jsonb,
    trained_from timestamptz,
    trained_to timestamptz,
    artifact_uri text,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now(),
    UNIQUE (model_type, version)
);
CREATE UNIQUE INDEX idx_ml_models_single_active
    ON ml_models (model_type)
    WHERE status = 'active';
CREATE TABLE prediction_cache (
    model_id uuid NOT NULL,
    node_id uuid NOT NULL,
    target_ts timestamptz NOT NULL,
    predicted_value double precision NOT NULL,
    lower_bound double precision NOT NULL,
    upper_bound double precision NOT NULL,
    confidence double precision NOT NULL,
    generated_at timestamptz NOT NULL DEFAULT now(),
    PRIMARY KEY (model_id, node_id, target_ts)
);
CREATE TABLE processing_jobs (
    id uuid PRIMARY KEY,
    job_kind text NOT NULL,
    status text NOT NULL DEFAULT 'queued',
    triggered_by text NOT NULL DEFAULT 'scheduled',
    items_processed bigint NOT NULL DEFAULT 0,
    items_failed bigint NOT NULL DEFAULT 0,
    detail jsonb,
    error jsonb,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now(),
    started_at timestamptz,
    finished_at timestamptz
);
CREATE TABLE processing_job_events (
    id bigserial PRIMARY KEY,
    job_id uuid NOT NULL,
    kind text NOT NULL,
    payload jsonb NOT NULL DEFAULT '{}'::jsonb,
    created_at timestamptz NOT NULL DEFAULT now()
);
"#;

async fn setup_pool(schema: &str) -> Result<Option<PgPool>> {
    if env::var("HYDRO_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return Ok(None);
    }
    let database_url = match env::var("HYDRO_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => return Ok(None),
    };

    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await?;
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(&admin_pool)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(&admin_pool)
        .await?;
    drop(admin_pool);

    let schema_name = schema.to_string();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let schema = schema_name.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {schema}"))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&database_url)
        .await?;

    sqlx::raw_sql(SCHEMA_DDL).execute(&pool).await?;
    Ok(Some(pool))
}

async fn insert_node(pool: &PgPool, name: &str, zone: &str, kind: &str) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO monitoring_nodes (id, name, zone, kind, active) VALUES ($1, $2, $3, $4, true)")
        .bind(id)
        .bind(name)
        .bind(zone)
        .bind(kind)
        .execute(pool)
        .await?;
    Ok(id)
}

fn ts(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .expect("valid rfc3339")
        .with_timezone(&Utc)
}

fn quarter_hourly(node_id: Uuid, start: DateTime<Utc>, flows: &[f64]) -> Vec<SensorReading> {
    flows
        .iter()
        .enumerate()
        .map(|(idx, flow)| SensorReading {
            node_id,
            ts: start + ChronoDuration::minutes(15 * idx as i64),
            flow_rate: *flow,
            pressure: 4.0,
            temperature: 12.0,
            cumulative_volume: 100.0 + 10.0 * idx as f64,
            quality: 1.0,
        })
        .collect()
}

#[derive(sqlx::FromRow, Debug, PartialEq)]
struct MetricRowProbe {
    avg_flow_rate: Option<f64>,
    min_flow_rate: Option<f64>,
    max_flow_rate: Option<f64>,
    stddev_flow_rate: Option<f64>,
    reading_count: i64,
}

#[tokio::test]
async fn aggregation_is_idempotent_and_matches_the_hourly_scenario() -> Result<()> {
    let Some(pool) = setup_pool("hydronet_test_idempotence").await? else {
        return Ok(());
    };
    let harness = harness_with_pool(pool.clone());
    let node = insert_node(&pool, "n1", "zone-a", "distribution").await?;
    harness.warehouse.seed(
        node,
        quarter_hourly(node, ts("2024-01-01T00:00:00Z"), &[10.0, 12.0, 11.0, 13.0]),
    );

    let start = ts("2024-01-01T00:00:00Z");
    let end = ts("2024-01-01T01:00:00Z");

    let first = harness
        .aggregation
        .process_new_data(start, end, &[TimeWindow::Hour])
        .await
        .expect("first run");
    assert_eq!(first.nodes_processed, 1);
    // One snapshot fetch per node per run: later windows in the run can
    // never observe newer data than earlier ones.
    assert_eq!(harness.warehouse.fetch_count(node), 1);

    let probe_sql = r#"
        SELECT avg_flow_rate, min_flow_rate, max_flow_rate, stddev_flow_rate, reading_count
        FROM computed_metrics
        WHERE node_id = $1 AND time_window = '1hour'
    "#;
    let rows: Vec<MetricRowProbe> = sqlx::query_as(probe_sql).bind(node).fetch_all(&pool).await?;
    assert_eq!(rows.len(), 1);
    assert!((rows[0].avg_flow_rate.unwrap() - 11.5).abs() < 1e-9);
    assert_eq!(rows[0].min_flow_rate, Some(10.0));
    assert_eq!(rows[0].max_flow_rate, Some(13.0));
    assert_eq!(rows[0].reading_count, 4);

    harness
        .aggregation
        .process_new_data(start, end, &[TimeWindow::Hour])
        .await
        .expect("second run");
    let rerun: Vec<MetricRowProbe> = sqlx::query_as(probe_sql).bind(node).fetch_all(&pool).await?;
    assert_eq!(rerun.len(), 1, "recompute must overwrite, not append");
    assert_eq!(rows, rerun, "identical snapshot must produce identical rows");
    Ok(())
}

#[tokio::test]
async fn one_malformed_node_does_not_fail_the_job() -> Result<()> {
    let Some(pool) = setup_pool("hydronet_test_partial_failure").await? else {
        return Ok(());
    };
    let harness = harness_with_pool(pool.clone());
    let start = ts("2024-01-01T00:00:00Z");
    let end = ts("2024-01-01T01:00:00Z");

    let mut nodes = Vec::new();
    for idx in 0..10 {
        let node = insert_node(&pool, &format!("n{idx}"), "zone-a", "distribution").await?;
        harness
            .warehouse
            .seed(node, quarter_hourly(node, start, &[10.0, 12.0, 11.0, 13.0]));
        nodes.push(node);
    }
    harness.warehouse.fail_node(nodes[3]);

    let outcome = harness
        .jobs
        .run_once(JobKind::RealtimeSync, "manual", Some((start, end)))
        .await?;
    let RunOutcome::Ran(job) = outcome else {
        panic!("expected the job to run");
    };
    // Node-scoped failures leave the job completed, with the failure
    // recorded against the node.
    assert_eq!(job.status_enum(), JobStatus::Completed);
    assert_eq!(job.items_processed, 9);
    assert_eq!(job.items_failed, 1);

    let metric_nodes: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT node_id) FROM computed_metrics WHERE time_window = '1hour'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(metric_nodes, 9);
    Ok(())
}

#[tokio::test]
async fn unreachable_warehouse_is_systemic_and_fails_the_job() -> Result<()> {
    let Some(pool) = setup_pool("hydronet_test_systemic").await? else {
        return Ok(());
    };
    let harness = harness_with_pool(pool.clone());
    insert_node(&pool, "n1", "zone-a", "distribution").await?;
    harness.warehouse.set_fail_ping(true);

    let start = ts("2024-01-01T00:00:00Z");
    let end = ts("2024-01-01T01:00:00Z");
    let outcome = harness
        .jobs
        .run_once(JobKind::RealtimeSync, "manual", Some((start, end)))
        .await?;
    let RunOutcome::Ran(job) = outcome else {
        panic!("expected the job to run");
    };
    assert_eq!(job.status_enum(), JobStatus::Failed);
    assert_eq!(
        job.error.as_ref().map(|err| err.0.code.clone()),
        Some("systemic".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn overlapping_triggers_skip_without_a_duplicate_row() -> Result<()> {
    let Some(pool) = setup_pool("hydronet_test_mutex").await? else {
        return Ok(());
    };
    let harness = harness_with_pool(pool.clone());
    let start = ts("2024-01-01T00:00:00Z");
    let end = ts("2024-01-01T01:00:00Z");
    let node = insert_node(&pool, "n1", "zone-a", "distribution").await?;
    harness
        .warehouse
        .seed(node, quarter_hourly(node, start, &[10.0, 12.0, 11.0, 13.0]));
    harness.warehouse.set_fetch_delay(Duration::from_millis(400));

    let jobs = harness.jobs.clone();
    let first = tokio::spawn(async move {
        jobs.run_once(JobKind::RealtimeSync, "scheduled", Some((start, end)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(120)).await;
    let second = harness
        .jobs
        .run_once(JobKind::RealtimeSync, "scheduled", Some((start, end)))
        .await?;
    let first = first.await??;

    assert!(matches!(first, RunOutcome::Ran(_)));
    assert!(matches!(second, RunOutcome::Skipped { .. }));

    let job_rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM processing_jobs WHERE job_kind = 'realtime_sync'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(job_rows, 1, "a skipped trigger must not create a job row");

    let skip_events: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM processing_job_events WHERE kind = 'trigger_skipped'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(skip_events, 1, "the skip must be visible in the audit trail");
    Ok(())
}

#[tokio::test]
async fn promotion_keeps_exactly_one_active_model() -> Result<()> {
    let Some(pool) = setup_pool("hydronet_test_promotion").await? else {
        return Ok(());
    };

    let v1 = ml_store::register_model(&pool, ModelKind::FlowForecast, "v1", None).await?;
    ml_store::advance_status(&pool, v1.id, ModelStatus::Training).await?;
    ml_store::advance_status(&pool, v1.id, ModelStatus::Validating).await?;
    ml_store::promote(&pool, v1.id).await?;

    let v2 = ml_store::register_model(&pool, ModelKind::FlowForecast, "v2", None).await?;
    ml_store::advance_status(&pool, v2.id, ModelStatus::Training).await?;
    ml_store::advance_status(&pool, v2.id, ModelStatus::Validating).await?;
    let v3 = ml_store::register_model(&pool, ModelKind::FlowForecast, "v3", None).await?;
    ml_store::advance_status(&pool, v3.id, ModelStatus::Training).await?;
    ml_store::advance_status(&pool, v3.id, ModelStatus::Validating).await?;

    let pool_a = pool.clone();
    let pool_b = pool.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { ml_store::promote(&pool_a, v2.id).await }),
        tokio::spawn(async move { ml_store::promote(&pool_b, v3.id).await }),
    );
    a?.expect("first concurrent promotion");
    b?.expect("second concurrent promotion");

    let active: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ml_models WHERE model_type = 'flow_forecast' AND status = 'active'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(active, 1, "promotion swap must never leave zero or two actives");

    let v1_status: String = sqlx::query_scalar("SELECT status FROM ml_models WHERE id = $1")
        .bind(v1.id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(v1_status, "retired");

    // A retired model can never come back.
    let err = ml_store::promote(&pool, v1.id).await.unwrap_err();
    assert!(matches!(err, ModelStoreError::IllegalTransition { .. }));
    Ok(())
}

#[tokio::test]
async fn lifecycle_rejects_illegal_edges_at_the_store_boundary() -> Result<()> {
    let Some(pool) = setup_pool("hydronet_test_lifecycle").await? else {
        return Ok(());
    };
    let model = ml_store::register_model(&pool, ModelKind::AnomalyDetection, "v1", None).await?;

    let err = ml_store::advance_status(&pool, model.id, ModelStatus::Active)
        .await
        .unwrap_err();
    assert!(matches!(err, ModelStoreError::IllegalTransition { .. }));

    let status: String = sqlx::query_scalar("SELECT status FROM ml_models WHERE id = $1")
        .bind(model.id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(status, "created", "rejected transitions must not touch the row");
    Ok(())
}

#[tokio::test]
async fn rerunning_predictions_overwrites_instead_of_duplicating() -> Result<()> {
    let Some(pool) = setup_pool("hydronet_test_predictions").await? else {
        return Ok(());
    };
    let harness = harness_with_pool(pool.clone());
    let node = insert_node(&pool, "n1", "zone-a", "distribution").await?;
    let failing = insert_node(&pool, "n2", "zone-a", "distribution").await?;
    harness.forecaster.fail_node(failing);

    let model = ml_store::register_model(&pool, ModelKind::FlowForecast, "v1", None).await?;
    ml_store::advance_status(&pool, model.id, ModelStatus::Training).await?;
    ml_store::advance_status(&pool, model.id, ModelStatus::Validating).await?;
    harness.predictions.promote(model.id).await?;

    let first = harness
        .predictions
        .generate_predictions(&[node, failing], 3)
        .await
        .expect("first batch");
    assert_eq!(first.nodes_processed, 1);
    assert_eq!(first.nodes_failed, 1);
    assert_eq!(first.predictions_written, 3);

    let second = harness
        .predictions
        .generate_predictions(&[node, failing], 3)
        .await
        .expect("second batch");
    assert_eq!(second.nodes_failed, 1);

    let rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM prediction_cache WHERE model_id = $1 AND node_id = $2",
    )
    .bind(model.id)
    .bind(node)
    .fetch_one(&pool)
    .await?;
    assert_eq!(rows, 3, "re-running a horizon must overwrite, not duplicate");
    Ok(())
}

#[tokio::test]
async fn full_and_incremental_refresh_leave_identical_cache_contents() -> Result<()> {
    let Some(pool) = setup_pool("hydronet_test_cache_roundtrip").await? else {
        return Ok(());
    };
    let harness = harness_with_pool(pool.clone());
    let start = TimeWindow::FiveMinutes.align_down(Utc::now() - ChronoDuration::minutes(60));
    let end = start + ChronoDuration::minutes(60);
    let node = insert_node(&pool, "n1", "zone-a", "distribution").await?;
    harness
        .warehouse
        .seed(node, quarter_hourly(node, start, &[10.0, 12.0, 11.0, 13.0]));

    harness
        .aggregation
        .process_new_data(start, end, &[TimeWindow::FiveMinutes])
        .await
        .expect("aggregation");

    let outcome = harness
        .jobs
        .run_once(JobKind::FullSync, "manual", Some((start, end)))
        .await?;
    let RunOutcome::Ran(job) = outcome else {
        panic!("expected the job to run");
    };
    assert_eq!(job.status_enum(), JobStatus::Completed);
    let full_latest = harness
        .cache
        .get(&crate::cache::keys::node_latest(node))
        .await?
        .expect("latest key after full refresh");
    let full_rollup = harness
        .cache
        .get(&crate::cache::keys::node_metrics(node, crate::time::RollingRange::H24))
        .await?
        .expect("rollup key after full refresh");

    // Wipe the cache, then run the incremental path for the same node set
    // against unchanged warm-store data.
    harness
        .cache
        .delete(&crate::cache::keys::node_latest(node))
        .await?;
    harness
        .cache
        .delete(&crate::cache::keys::node_metrics(node, crate::time::RollingRange::H24))
        .await?;
    let outcome = harness
        .jobs
        .run_once(JobKind::RealtimeSync, "manual", Some((start, end)))
        .await?;
    let RunOutcome::Ran(job) = outcome else {
        panic!("expected the job to run");
    };
    assert_eq!(job.status_enum(), JobStatus::Completed);

    let incremental_latest = harness
        .cache
        .get(&crate::cache::keys::node_latest(node))
        .await?
        .expect("latest key after incremental refresh");
    let incremental_rollup = harness
        .cache
        .get(&crate::cache::keys::node_metrics(node, crate::time::RollingRange::H24))
        .await?
        .expect("rollup key after incremental refresh");

    assert_eq!(full_latest, incremental_latest);
    assert_eq!(full_rollup, incremental_rollup);
    Ok(())
}
