pub mod store;
pub mod types;

pub use types::{JobError, JobKind, JobMetrics, JobPublic, JobRow, JobStatus};

use crate::config::HydroConfig;
use crate::error::PipelineError;
use crate::model::active_nodes;
use crate::services::aggregation::AggregationEngine;
use crate::services::anomaly::AnomalyScanner;
use crate::services::cache_sync::CacheSynchronizer;
use crate::services::efficiency::EfficiencyRollup;
use crate::services::ml::PredictionManager;
use crate::services::quality;
use crate::services::retention::{self, RetentionSettings};
use crate::time::TimeWindow;
use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug)]
pub enum RunOutcome {
    Ran(JobRow),
    Skipped { running_job_id: Option<Uuid> },
}

/// Runs pipeline jobs with per-kind mutual exclusion and a per-kind
/// wall-clock budget, recording every run in the processing_jobs audit
/// trail.
#[derive(Clone)]
pub struct PipelineJobService {
    db: PgPool,
    config: HydroConfig,
    running: Arc<Mutex<HashSet<JobKind>>>,
    aggregation: Arc<AggregationEngine>,
    cache_sync: Arc<CacheSynchronizer>,
    predictions: Arc<PredictionManager>,
    anomaly: Arc<AnomalyScanner>,
    efficiency: Arc<EfficiencyRollup>,
    retention: RetentionSettings,
}

impl PipelineJobService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: PgPool,
        config: HydroConfig,
        aggregation: Arc<AggregationEngine>,
        cache_sync: Arc<CacheSynchronizer>,
        predictions: Arc<PredictionManager>,
        anomaly: Arc<AnomalyScanner>,
        efficiency: Arc<EfficiencyRollup>,
    ) -> Self {
        let retention = RetentionSettings::from_config(&config);
        Self {
            db,
            config,
            running: Arc::new(Mutex::new(HashSet::new())),
            aggregation,
            cache_sync,
            predictions,
            anomaly,
            efficiency,
            retention,
        }
    }

    pub fn db(&self) -> &PgPool {
        &self.db
    }

    /// Executes one job synchronously. An overlapping trigger for a kind
    /// that is already running is skipped: logged and appended to the
    /// running job's event stream, with no second job row.
    pub async fn run_once(
        &self,
        kind: JobKind,
        triggered_by: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> anyhow::Result<RunOutcome> {
        {
            let mut running = self.running.lock().await;
            if !running.insert(kind) {
                drop(running);
                let running_job = store::find_running(&self.db, kind).await?;
                if let Some(job) = &running_job {
                    store::append_event(
                        &self.db,
                        job.id,
                        "trigger_skipped",
                        serde_json::json!({ "triggered_by": triggered_by }),
                    )
                    .await?;
                }
                tracing::info!(
                    job_kind = kind.as_str(),
                    triggered_by,
                    "job already running; trigger skipped"
                );
                return Ok(RunOutcome::Skipped {
                    running_job_id: running_job.map(|job| job.id),
                });
            }
        }

        let result = self.execute(kind, triggered_by, range).await;

        {
            let mut running = self.running.lock().await;
            running.remove(&kind);
        }

        result.map(RunOutcome::Ran)
    }

    async fn execute(
        &self,
        kind: JobKind,
        triggered_by: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> anyhow::Result<JobRow> {
        let job = store::create_job(&self.db, kind, triggered_by).await?;
        store::mark_running(&self.db, job.id).await?;

        let budget = kind.timeout(&self.config);
        let started = Instant::now();
        let worker = self.clone();
        let handle = tokio::spawn(async move { worker.dispatch(kind, range).await });

        match tokio::time::timeout(budget, handle).await {
            Ok(Ok(Ok(metrics))) => {
                store::mark_completed(&self.db, job.id, &metrics).await?;
                tracing::info!(
                    job_kind = kind.as_str(),
                    job_id = %job.id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    processed = metrics.processed,
                    failed = metrics.failed,
                    "job completed"
                );
            }
            Ok(Ok(Err(err))) => {
                tracing::warn!(
                    job_kind = kind.as_str(),
                    job_id = %job.id,
                    error = %err,
                    "job failed"
                );
                store::mark_failed(
                    &self.db,
                    job.id,
                    JobError {
                        code: err.code().to_string(),
                        message: err.to_string(),
                        details: None,
                    },
                )
                .await?;
            }
            Ok(Err(join_err)) => {
                tracing::error!(
                    job_kind = kind.as_str(),
                    job_id = %job.id,
                    error = %join_err,
                    "job task aborted"
                );
                store::mark_failed(
                    &self.db,
                    job.id,
                    JobError {
                        code: "panicked".to_string(),
                        message: join_err.to_string(),
                        details: None,
                    },
                )
                .await?;
            }
            Err(_) => {
                // The detached task may still finish its in-flight node
                // work; upserts are idempotent so that is harmless. The
                // slot is released so the next trigger can proceed.
                tracing::warn!(
                    job_kind = kind.as_str(),
                    job_id = %job.id,
                    budget_seconds = budget.as_secs(),
                    "job exceeded its wall-clock budget"
                );
                store::mark_failed(
                    &self.db,
                    job.id,
                    JobError {
                        code: "timeout".to_string(),
                        message: format!("job exceeded its {}s budget", budget.as_secs()),
                        details: None,
                    },
                )
                .await?;
            }
        }

        store::get_job(&self.db, job.id)
            .await?
            .context("job row vanished after completion")
    }

    async fn dispatch(
        self,
        kind: JobKind,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<JobMetrics, PipelineError> {
        match kind {
            JobKind::RealtimeSync => {
                let (start, end) = range.unwrap_or_else(|| {
                    let end = Utc::now();
                    (
                        end - ChronoDuration::minutes(self.config.realtime_lookback_minutes as i64),
                        end,
                    )
                });
                let result = self
                    .aggregation
                    .process_new_data(start, end, &TimeWindow::REALTIME)
                    .await?;
                // Cache refresh consumes the aggregation output list, so a
                // window's keys are only rebuilt after its metrics exist.
                let sync = self.cache_sync.refresh(&result.nodes_with_data).await?;
                Ok(JobMetrics {
                    processed: result.nodes_processed as u64,
                    failed: result.nodes_failed as u64,
                    detail: serde_json::json!({
                        "aggregation": result.to_detail(),
                        "cache": sync.to_detail(),
                    }),
                })
            }
            JobKind::FullSync => {
                let (start, end) = range.unwrap_or_else(|| {
                    let end = Utc::now();
                    (
                        end - ChronoDuration::hours(self.config.full_sync_lookback_hours as i64),
                        end,
                    )
                });
                let result = self
                    .aggregation
                    .process_new_data(start, end, &TimeWindow::ALL)
                    .await?;
                let sync = self.cache_sync.refresh_all().await?;
                Ok(JobMetrics {
                    processed: result.nodes_processed as u64,
                    failed: result.nodes_failed as u64,
                    detail: serde_json::json!({
                        "aggregation": result.to_detail(),
                        "cache": sync.to_detail(),
                    }),
                })
            }
            JobKind::CacheRefresh => {
                let sync = self.cache_sync.refresh_all().await?;
                let nodes = active_nodes(&self.db).await?;
                let node_ids: Vec<Uuid> = nodes.iter().map(|node| node.id).collect();
                let predictions = self
                    .predictions
                    .generate_predictions(&node_ids, self.config.prediction_horizon_hours)
                    .await?;
                Ok(JobMetrics {
                    processed: sync.nodes as u64 + predictions.nodes_processed as u64,
                    failed: predictions.nodes_failed as u64,
                    detail: serde_json::json!({
                        "cache": sync.to_detail(),
                        "predictions": predictions.to_detail(),
                    }),
                })
            }
            JobKind::AnomalyScan => {
                let sweep = self.anomaly.scan().await?;
                Ok(JobMetrics {
                    processed: sweep.nodes_scanned as u64,
                    failed: 0,
                    detail: sweep.to_detail(),
                })
            }
            JobKind::QualityCheck => {
                let summary = quality::daily_check(&self.db, self.config.quality_floor).await?;
                Ok(JobMetrics {
                    processed: summary.windows_scanned,
                    failed: 0,
                    detail: summary.to_detail(),
                })
            }
            JobKind::EfficiencyRollup => {
                let summary = self.efficiency.rollup_latest().await?;
                Ok(JobMetrics {
                    processed: summary.records_written as u64,
                    failed: 0,
                    detail: summary.to_detail(),
                })
            }
            JobKind::RetentionCleanup => {
                let summary = retention::cleanup(&self.db, &self.retention).await?;
                Ok(JobMetrics {
                    processed: summary.total(),
                    failed: 0,
                    detail: summary.to_detail(),
                })
            }
            JobKind::ModelEvaluation => {
                let summary = self.predictions.evaluate_models().await?;
                Ok(JobMetrics {
                    processed: summary.models_evaluated as u64,
                    failed: 0,
                    detail: summary.to_detail(),
                })
            }
        }
    }
}
