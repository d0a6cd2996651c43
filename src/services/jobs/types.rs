use crate::config::HydroConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json as SqlJson;
use std::time::Duration;
use uuid::Uuid;

/// The recurring pipeline job kinds. At most one job of a given kind runs
/// at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FullSync,
    CacheRefresh,
    RealtimeSync,
    AnomalyScan,
    QualityCheck,
    EfficiencyRollup,
    RetentionCleanup,
    ModelEvaluation,
}

impl JobKind {
    pub const ALL: [JobKind; 8] = [
        JobKind::FullSync,
        JobKind::CacheRefresh,
        JobKind::RealtimeSync,
        JobKind::AnomalyScan,
        JobKind::QualityCheck,
        JobKind::EfficiencyRollup,
        JobKind::RetentionCleanup,
        JobKind::ModelEvaluation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::FullSync => "full_sync",
            JobKind::CacheRefresh => "cache_refresh",
            JobKind::RealtimeSync => "realtime_sync",
            JobKind::AnomalyScan => "anomaly_scan",
            JobKind::QualityCheck => "quality_check",
            JobKind::EfficiencyRollup => "efficiency_rollup",
            JobKind::RetentionCleanup => "retention_cleanup",
            JobKind::ModelEvaluation => "model_evaluation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "full_sync" => Some(JobKind::FullSync),
            "cache_refresh" => Some(JobKind::CacheRefresh),
            "realtime_sync" => Some(JobKind::RealtimeSync),
            "anomaly_scan" => Some(JobKind::AnomalyScan),
            "quality_check" => Some(JobKind::QualityCheck),
            "efficiency_rollup" => Some(JobKind::EfficiencyRollup),
            "retention_cleanup" => Some(JobKind::RetentionCleanup),
            "model_evaluation" => Some(JobKind::ModelEvaluation),
            _ => None,
        }
    }

    /// Wall-clock budget; exceeding it marks the job failed with a timeout
    /// cause and releases the mutual-exclusion slot.
    pub fn timeout(&self, config: &HydroConfig) -> Duration {
        match self {
            JobKind::FullSync => Duration::from_secs(config.full_sync_timeout_seconds),
            _ => Duration::from_secs(config.job_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct JobError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// What a job dispatcher hands back for the audit row.
#[derive(Debug, Clone, Default)]
pub struct JobMetrics {
    pub processed: u64,
    pub failed: u64,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct NodeFailure {
    pub node_id: Uuid,
    pub message: String,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct JobRow {
    pub id: Uuid,
    pub job_kind: String,
    pub status: String,
    pub triggered_by: String,
    pub items_processed: i64,
    pub items_failed: i64,
    pub detail: Option<SqlJson<serde_json::Value>>,
    pub error: Option<SqlJson<JobError>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    pub fn status_enum(&self) -> JobStatus {
        match self.status.as_str() {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            other => {
                tracing::warn!(status = %other, job_id = %self.id, "unknown job status; treating as failed");
                JobStatus::Failed
            }
        }
    }

    pub fn to_public(&self) -> JobPublic {
        JobPublic {
            id: self.id.to_string(),
            job_kind: self.job_kind.clone(),
            status: self.status_enum(),
            triggered_by: self.triggered_by.clone(),
            items_processed: self.items_processed,
            items_failed: self.items_failed,
            detail: self.detail.as_ref().map(|value| value.0.clone()),
            error: self.error.as_ref().map(|value| value.0.clone()),
            created_at: self.created_at.to_rfc3339(),
            started_at: self.started_at.map(|ts| ts.to_rfc3339()),
            finished_at: self.finished_at.map(|ts| ts.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct JobPublic {
    pub id: String,
    pub job_kind: String,
    pub status: JobStatus,
    pub triggered_by: String,
    pub items_processed: i64,
    pub items_failed: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}
