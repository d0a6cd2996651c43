use crate::cache::{keys, KeyValueCache};
use crate::error::PipelineError;
use crate::model::MetricKind;
use crate::services::aggregation::mean_stddev;
use crate::services::ml::{store as ml_store, ForecastProvider, ModelKind};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How many findings are enriched with a model score per sweep; the
/// heuristic detector runs on everything regardless.
const MODEL_SCORE_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyFinding {
    pub node_id: Uuid,
    pub metric: MetricKind,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub avg_flow_rate: f64,
    pub z_score: f64,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_score: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct AnomalySweep {
    pub nodes_scanned: u32,
    pub findings: Vec<AnomalyFinding>,
    pub cache_write_failures: u64,
}

impl AnomalySweep {
    pub fn to_detail(&self) -> serde_json::Value {
        serde_json::json!({
            "nodes_scanned": self.nodes_scanned,
            "anomalies_found": self.findings.len(),
            "cache_write_failures": self.cache_write_failures,
        })
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
struct MetricPoint {
    node_id: Uuid,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    avg_flow_rate: Option<f64>,
    anomaly_count: i64,
}

/// Flags windows in `(recent_cutoff, ..]` whose average flow deviates more
/// than `z_threshold` standard deviations from the node's trailing series,
/// or that already carried out-of-range readings at aggregation time.
fn detect(
    node_id: Uuid,
    series: &[MetricPoint],
    z_threshold: f64,
    recent_cutoff: DateTime<Utc>,
) -> Vec<AnomalyFinding> {
    let flows: Vec<f64> = series.iter().filter_map(|p| p.avg_flow_rate).collect();
    if flows.is_empty() {
        return Vec::new();
    }
    let (mean, stddev) = mean_stddev(&flows);

    series
        .iter()
        .filter(|point| point.window_start >= recent_cutoff)
        .filter_map(|point| {
            let avg = point.avg_flow_rate?;
            let z = if stddev > f64::EPSILON {
                (avg - mean) / stddev
            } else {
                0.0
            };
            let reason = if point.anomaly_count > 0 {
                "out_of_range_readings"
            } else if z.abs() > z_threshold {
                "flow_deviation"
            } else {
                return None;
            };
            Some(AnomalyFinding {
                node_id,
                metric: MetricKind::FlowRate,
                window_start: point.window_start,
                window_end: point.window_end,
                avg_flow_rate: avg,
                z_score: z,
                reason: reason.to_string(),
                model_score: None,
            })
        })
        .collect()
}

pub struct AnomalyScanner {
    db: PgPool,
    cache: Arc<dyn KeyValueCache>,
    provider: Arc<dyn ForecastProvider>,
    ttl: Duration,
    z_threshold: f64,
    lookback_hours: u32,
}

impl AnomalyScanner {
    pub fn new(
        db: PgPool,
        cache: Arc<dyn KeyValueCache>,
        provider: Arc<dyn ForecastProvider>,
        ttl: Duration,
        z_threshold: f64,
        lookback_hours: u32,
    ) -> Self {
        Self {
            db,
            cache,
            provider,
            ttl,
            z_threshold,
            lookback_hours,
        }
    }

    pub async fn scan(&self) -> Result<AnomalySweep, PipelineError> {
        let now = Utc::now();
        let lookback_start = now - ChronoDuration::hours(self.lookback_hours as i64);
        let recent_cutoff = now - ChronoDuration::hours(1);

        let points: Vec<MetricPoint> = sqlx::query_as(
            r#"
            SELECT node_id, window_start, window_end, avg_flow_rate, anomaly_count
            FROM computed_metrics
            WHERE time_window = '5min' AND window_start >= $1
            ORDER BY node_id, window_start
            "#,
        )
        .bind(lookback_start)
        .fetch_all(&self.db)
        .await?;

        let mut by_node: BTreeMap<Uuid, Vec<MetricPoint>> = BTreeMap::new();
        for point in points {
            by_node.entry(point.node_id).or_default().push(point);
        }

        let mut sweep = AnomalySweep::default();
        for (node_id, series) in &by_node {
            sweep.nodes_scanned += 1;
            sweep
                .findings
                .extend(detect(*node_id, series, self.z_threshold, recent_cutoff));
        }

        self.enrich_with_model_scores(&mut sweep.findings).await?;

        let payload = serde_json::json!({
            "generated_at": now.to_rfc3339(),
            "findings": sweep.findings,
        });
        if let Err(err) = self
            .cache
            .put(keys::ANOMALIES_RECENT, payload, self.ttl)
            .await
        {
            tracing::warn!(error = %err, "anomaly cache write failed; continuing");
            sweep.cache_write_failures += 1;
        }

        if !sweep.findings.is_empty() {
            tracing::info!(
                findings = sweep.findings.len(),
                nodes = sweep.nodes_scanned,
                "anomaly scan flagged windows"
            );
        }
        Ok(sweep)
    }

    /// Scores the strongest findings with the active anomaly model when
    /// one exists. Scoring failures only cost the enrichment.
    async fn enrich_with_model_scores(
        &self,
        findings: &mut [AnomalyFinding],
    ) -> Result<(), PipelineError> {
        let Some(model) = ml_store::active_model(&self.db, ModelKind::AnomalyDetection).await?
        else {
            return Ok(());
        };
        let model_ref = model.service_ref();
        for finding in findings.iter_mut().take(MODEL_SCORE_LIMIT) {
            match self
                .provider
                .anomaly_score(
                    &model_ref,
                    finding.node_id,
                    finding.window_start,
                    finding.window_end,
                )
                .await
            {
                Ok(verdict) => finding.model_score = Some(verdict.score),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        node_id = %finding.node_id,
                        "anomaly model scoring failed; keeping heuristic finding"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text)
            .expect("valid rfc3339")
            .with_timezone(&Utc)
    }

    fn series(flows: &[f64], anomaly_counts: &[i64]) -> Vec<MetricPoint> {
        let start = ts("2024-01-01T00:00:00Z");
        flows
            .iter()
            .zip(anomaly_counts)
            .enumerate()
            .map(|(idx, (flow, count))| MetricPoint {
                node_id: Uuid::nil(),
                window_start: start + ChronoDuration::minutes(5 * idx as i64),
                window_end: start + ChronoDuration::minutes(5 * (idx as i64 + 1)),
                avg_flow_rate: Some(*flow),
                anomaly_count: *count,
            })
            .collect()
    }

    #[test]
    fn spike_in_recent_windows_is_flagged() {
        let flows = [10.0, 10.2, 9.8, 10.1, 9.9, 10.0, 10.1, 60.0];
        let counts = [0i64; 8];
        let points = series(&flows, &counts);
        let findings = detect(Uuid::nil(), &points, 3.0, ts("2024-01-01T00:00:00Z"));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].reason, "flow_deviation");
        assert!(findings[0].z_score > 2.0);
    }

    #[test]
    fn steady_series_yields_no_findings() {
        let flows = [10.0; 8];
        let counts = [0i64; 8];
        let points = series(&flows, &counts);
        assert!(detect(Uuid::nil(), &points, 3.0, ts("2024-01-01T00:00:00Z")).is_empty());
    }

    #[test]
    fn aggregation_time_anomalies_are_carried_through() {
        let flows = [10.0, 10.0, 10.0, 10.0];
        let counts = [0, 0, 0, 2];
        let points = series(&flows, &counts);
        let findings = detect(Uuid::nil(), &points, 3.0, ts("2024-01-01T00:00:00Z"));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].reason, "out_of_range_readings");
    }

    #[test]
    fn only_recent_windows_are_reported() {
        let flows = [60.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0];
        let counts = [0i64; 8];
        let points = series(&flows, &counts);
        // Cutoff excludes the spike at index 0.
        let findings = detect(Uuid::nil(), &points, 2.0, ts("2024-01-01T00:05:00Z"));
        assert!(findings.is_empty());
    }
}
