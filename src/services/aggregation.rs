use crate::config::HydroConfig;
use crate::error::PipelineError;
use crate::model::{active_nodes, NodeRow, SensorReading};
use crate::services::jobs::types::NodeFailure;
use crate::services::quality::{self, Baseline, SaneRanges};
use crate::time::TimeWindow;
use crate::warehouse::ReadingStore;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AggregationSettings {
    pub concurrency: usize,
    pub expected_interval_seconds: i64,
    pub quality_floor: f64,
    pub ranges: SaneRanges,
    pub anomaly_z_threshold: f64,
}

impl AggregationSettings {
    pub fn from_config(config: &HydroConfig) -> Self {
        Self {
            concurrency: config.aggregation_concurrency,
            expected_interval_seconds: config.expected_reading_interval_seconds,
            quality_floor: config.quality_floor,
            ranges: SaneRanges::from_config(config),
            anomaly_z_threshold: config.anomaly_z_threshold,
        }
    }
}

/// Per-run outcome reported back to the job audit row.
#[derive(Debug, Clone, Default)]
pub struct ProcessingResult {
    pub nodes_processed: u32,
    pub nodes_failed: u32,
    pub windows_written: u64,
    pub quality_flagged: u64,
    pub nodes_with_data: Vec<Uuid>,
    pub failures: Vec<NodeFailure>,
}

impl ProcessingResult {
    pub fn to_detail(&self) -> serde_json::Value {
        serde_json::json!({
            "nodes_processed": self.nodes_processed,
            "nodes_failed": self.nodes_failed,
            "windows_written": self.windows_written,
            "quality_flagged": self.quality_flagged,
            "failures": self.failures,
        })
    }
}

#[derive(Debug, Default)]
struct NodeOutcome {
    windows_written: u64,
    quality_flagged: u64,
    had_data: bool,
}

/// Statistics for one node/window bucket, computed from the raw snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowStats {
    pub count: i64,
    pub avg_flow: f64,
    pub min_flow: f64,
    pub max_flow: f64,
    pub stddev_flow: f64,
    pub avg_pressure: f64,
    pub min_pressure: f64,
    pub max_pressure: f64,
    pub stddev_pressure: f64,
    pub total_volume: f64,
    pub anomaly_count: i64,
}

impl WindowStats {
    /// Pure aggregate over a non-empty, timestamp-ordered slice. Anomalies
    /// are readings outside the sane ranges or more than `z_threshold`
    /// standard deviations from the bucket mean flow.
    pub fn compute(readings: &[SensorReading], ranges: &SaneRanges, z_threshold: f64) -> Option<Self> {
        if readings.is_empty() {
            return None;
        }
        let count = readings.len() as i64;
        let flows: Vec<f64> = readings.iter().map(|r| r.flow_rate).collect();
        let pressures: Vec<f64> = readings.iter().map(|r| r.pressure).collect();

        let (avg_flow, stddev_flow) = mean_stddev(&flows);
        let (avg_pressure, stddev_pressure) = mean_stddev(&pressures);
        let min_flow = flows.iter().copied().fold(f64::INFINITY, f64::min);
        let max_flow = flows.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min_pressure = pressures.iter().copied().fold(f64::INFINITY, f64::min);
        let max_pressure = pressures.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let total_volume = (readings[readings.len() - 1].cumulative_volume
            - readings[0].cumulative_volume)
            .max(0.0);

        let anomaly_count = readings
            .iter()
            .filter(|r| {
                !ranges.contains(r)
                    || (stddev_flow > f64::EPSILON
                        && ((r.flow_rate - avg_flow) / stddev_flow).abs() > z_threshold)
            })
            .count() as i64;

        Some(Self {
            count,
            avg_flow,
            min_flow,
            max_flow,
            stddev_flow,
            avg_pressure,
            min_pressure,
            max_pressure,
            stddev_pressure,
            total_volume,
            anomaly_count,
        })
    }
}

pub(crate) fn mean_stddev(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}

/// Union span of every window bucket overlapping `[start, end)`, so one
/// snapshot fetch per node covers all windows of the run.
pub fn snapshot_span(
    windows: &[TimeWindow],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let mut span: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
    for window in windows {
        let buckets = window.buckets_overlapping(start, end);
        let (Some(first), Some(last)) = (buckets.first(), buckets.last()) else {
            continue;
        };
        span = Some(match span {
            None => (first.0, last.1),
            Some((lo, hi)) => (lo.min(first.0), hi.max(last.1)),
        });
    }
    span
}

pub struct AggregationEngine {
    db: PgPool,
    readings: Arc<dyn ReadingStore>,
    settings: AggregationSettings,
}

impl AggregationEngine {
    pub fn new(db: PgPool, readings: Arc<dyn ReadingStore>, settings: AggregationSettings) -> Self {
        Self {
            db,
            readings,
            settings,
        }
    }

    /// Recomputes every window bucket overlapping `[start, end)` for every
    /// active node from a single per-node raw snapshot, upserting the
    /// results. Idempotent for a fixed snapshot; per-node failures are
    /// recorded without aborting the other nodes.
    pub async fn process_new_data(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        windows: &[TimeWindow],
    ) -> Result<ProcessingResult, PipelineError> {
        if end <= start {
            return Err(PipelineError::Systemic(format!(
                "invalid aggregation range: {start} .. {end}"
            )));
        }

        let nodes = active_nodes(&self.db).await?;
        self.readings.ping().await.map_err(|err| {
            PipelineError::Systemic(format!("source store unreachable: {err}"))
        })?;

        let mut result = ProcessingResult::default();
        let outcomes: Vec<(Uuid, Result<NodeOutcome, NodeFailure>)> = stream::iter(nodes)
            .map(|node| async move {
                let outcome = self.process_node(&node, start, end, windows).await;
                (node.id, outcome)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for (node_id, outcome) in outcomes {
            match outcome {
                Ok(node_outcome) => {
                    result.nodes_processed += 1;
                    result.windows_written += node_outcome.windows_written;
                    result.quality_flagged += node_outcome.quality_flagged;
                    if node_outcome.had_data {
                        result.nodes_with_data.push(node_id);
                    }
                }
                Err(failure) => {
                    tracing::warn!(
                        node_id = %failure.node_id,
                        error = %failure.message,
                        "node aggregation failed; continuing with remaining nodes"
                    );
                    result.nodes_failed += 1;
                    result.failures.push(failure);
                }
            }
        }

        tracing::info!(
            nodes_processed = result.nodes_processed,
            nodes_failed = result.nodes_failed,
            windows_written = result.windows_written,
            "aggregation run finished"
        );
        Ok(result)
    }

    async fn process_node(
        &self,
        node: &NodeRow,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        windows: &[TimeWindow],
    ) -> Result<NodeOutcome, NodeFailure> {
        let fail = |message: String| NodeFailure {
            node_id: node.id,
            message,
        };

        let Some((span_start, span_end)) = snapshot_span(windows, start, end) else {
            return Ok(NodeOutcome::default());
        };

        // One snapshot per node per run: every window below is computed
        // from the same data, so later windows can never observe an older
        // snapshot than earlier ones.
        let snapshot = self
            .readings
            .fetch_readings(node.id, span_start, span_end)
            .await
            .map_err(|err| fail(format!("snapshot fetch failed: {err}")))?;

        let mut outcome = NodeOutcome::default();
        for window in windows {
            let buckets = window.buckets_overlapping(start, end);
            let Some(first_bucket) = buckets.first().map(|b| b.0) else {
                continue;
            };
            let baseline = self
                .load_baseline(node.id, *window, first_bucket)
                .await
                .map_err(|err| fail(format!("baseline query failed: {err}")))?;
            let expected = window.duration_seconds() as f64
                / self.settings.expected_interval_seconds.max(1) as f64;

            for (bucket_start, bucket_end) in buckets {
                let slice: Vec<SensorReading> = snapshot
                    .iter()
                    .filter(|r| r.ts >= bucket_start && r.ts < bucket_end)
                    .cloned()
                    .collect();

                let breakdown = quality::assess(
                    &slice,
                    expected,
                    &self.settings.ranges,
                    baseline,
                    self.settings.quality_floor,
                );
                if breakdown.issues.contains(&"quality_below_floor".to_string()) {
                    outcome.quality_flagged += 1;
                }

                self.upsert_quality(node.id, *window, bucket_start, &breakdown)
                    .await
                    .map_err(|err| fail(format!("quality upsert failed: {err}")))?;

                let Some(stats) = WindowStats::compute(
                    &slice,
                    &self.settings.ranges,
                    self.settings.anomaly_z_threshold,
                ) else {
                    // Gap bucket: quality row flags the hole, nothing to aggregate.
                    continue;
                };

                self.upsert_metric(
                    node.id,
                    *window,
                    bucket_start,
                    bucket_end,
                    &stats,
                    &breakdown,
                )
                .await
                .map_err(|err| fail(format!("metric upsert failed: {err}")))?;
                outcome.windows_written += 1;
            }
        }

        if let Some(latest) = snapshot.last() {
            outcome.had_data = true;
            self.upsert_latest_reading(latest)
                .await
                .map_err(|err| fail(format!("latest-reading upsert failed: {err}")))?;
        }

        Ok(outcome)
    }

    async fn load_baseline(
        &self,
        node_id: Uuid,
        window: TimeWindow,
        before: DateTime<Utc>,
    ) -> Result<Option<Baseline>, sqlx::Error> {
        #[derive(sqlx::FromRow)]
        struct Row {
            mean_flow: Option<f64>,
            stddev_flow: Option<f64>,
        }

        let row: Row = sqlx::query_as(
            r#"
            SELECT AVG(avg_flow_rate) AS mean_flow,
                   STDDEV_SAMP(avg_flow_rate) AS stddev_flow
            FROM (
                SELECT avg_flow_rate
                FROM computed_metrics
                WHERE node_id = $1 AND time_window = $2 AND window_start < $3
                ORDER BY window_start DESC
                LIMIT 24
            ) recent
            "#,
        )
        .bind(node_id)
        .bind(window.as_str())
        .bind(before)
        .fetch_one(&self.db)
        .await?;

        Ok(match (row.mean_flow, row.stddev_flow) {
            (Some(mean_flow), Some(stddev_flow)) => Some(Baseline {
                mean_flow,
                stddev_flow,
            }),
            _ => None,
        })
    }

    async fn upsert_metric(
        &self,
        node_id: Uuid,
        window: TimeWindow,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        stats: &WindowStats,
        breakdown: &quality::QualityBreakdown,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO computed_metrics (
                node_id, time_window, window_start, window_end,
                avg_flow_rate, min_flow_rate, max_flow_rate, stddev_flow_rate,
                avg_pressure, min_pressure, max_pressure, stddev_pressure,
                total_volume, reading_count, anomaly_count,
                completeness_pct, quality_score, computed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, now())
            ON CONFLICT (node_id, time_window, window_start)
            DO UPDATE SET
                window_end = EXCLUDED.window_end,
                avg_flow_rate = EXCLUDED.avg_flow_rate,
                min_flow_rate = EXCLUDED.min_flow_rate,
                max_flow_rate = EXCLUDED.max_flow_rate,
                stddev_flow_rate = EXCLUDED.stddev_flow_rate,
                avg_pressure = EXCLUDED.avg_pressure,
                min_pressure = EXCLUDED.min_pressure,
                max_pressure = EXCLUDED.max_pressure,
                stddev_pressure = EXCLUDED.stddev_pressure,
                total_volume = EXCLUDED.total_volume,
                reading_count = EXCLUDED.reading_count,
                anomaly_count = EXCLUDED.anomaly_count,
                completeness_pct = EXCLUDED.completeness_pct,
                quality_score = EXCLUDED.quality_score,
                computed_at = now()
            "#,
        )
        .bind(node_id)
        .bind(window.as_str())
        .bind(window_start)
        .bind(window_end)
        .bind(stats.avg_flow)
        .bind(stats.min_flow)
        .bind(stats.max_flow)
        .bind(stats.stddev_flow)
        .bind(stats.avg_pressure)
        .bind(stats.min_pressure)
        .bind(stats.max_pressure)
        .bind(stats.stddev_pressure)
        .bind(stats.total_volume)
        .bind(stats.count)
        .bind(stats.anomaly_count)
        .bind(breakdown.completeness * 100.0)
        .bind(breakdown.overall)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn upsert_quality(
        &self,
        node_id: Uuid,
        window: TimeWindow,
        window_start: DateTime<Utc>,
        breakdown: &quality::QualityBreakdown,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO data_quality (
                node_id, time_window, window_start,
                completeness, validity, consistency, overall_score, issues, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
            ON CONFLICT (node_id, time_window, window_start)
            DO UPDATE SET
                completeness = EXCLUDED.completeness,
                validity = EXCLUDED.validity,
                consistency = EXCLUDED.consistency,
                overall_score = EXCLUDED.overall_score,
                issues = EXCLUDED.issues,
                created_at = now()
            "#,
        )
        .bind(node_id)
        .bind(window.as_str())
        .bind(window_start)
        .bind(breakdown.completeness)
        .bind(breakdown.validity)
        .bind(breakdown.consistency)
        .bind(breakdown.overall)
        .bind(SqlJson(serde_json::json!(breakdown.issues)))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn upsert_latest_reading(&self, reading: &SensorReading) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO node_latest_readings (
                node_id, ts, flow_rate, pressure, temperature,
                cumulative_volume, quality, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            ON CONFLICT (node_id)
            DO UPDATE SET
                ts = EXCLUDED.ts,
                flow_rate = EXCLUDED.flow_rate,
                pressure = EXCLUDED.pressure,
                temperature = EXCLUDED.temperature,
                cumulative_volume = EXCLUDED.cumulative_volume,
                quality = EXCLUDED.quality,
                updated_at = now()
            WHERE node_latest_readings.ts <= EXCLUDED.ts
            "#,
        )
        .bind(reading.node_id)
        .bind(reading.ts)
        .bind(reading.flow_rate)
        .bind(reading.pressure)
        .bind(reading.temperature)
        .bind(reading.cumulative_volume)
        .bind(reading.quality)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn ranges() -> SaneRanges {
        SaneRanges {
            flow: (0.0, 10_000.0),
            pressure: (0.0, 25.0),
            temperature: (-10.0, 60.0),
        }
    }

    fn ts(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text)
            .expect("valid rfc3339")
            .with_timezone(&Utc)
    }

    fn readings_quarter_hourly(start: DateTime<Utc>, flows: &[f64]) -> Vec<SensorReading> {
        flows
            .iter()
            .enumerate()
            .map(|(idx, flow)| SensorReading {
                node_id: Uuid::nil(),
                ts: start + ChronoDuration::minutes(15 * idx as i64),
                flow_rate: *flow,
                pressure: 4.0 + idx as f64 * 0.1,
                temperature: 12.0,
                cumulative_volume: 100.0 + 10.0 * idx as f64,
                quality: 1.0,
            })
            .collect()
    }

    #[test]
    fn hourly_window_matches_expected_statistics() {
        // Four quarter-hour readings with flows [10, 12, 11, 13].
        let readings =
            readings_quarter_hourly(ts("2024-01-01T00:00:00Z"), &[10.0, 12.0, 11.0, 13.0]);
        let stats = WindowStats::compute(&readings, &ranges(), 3.0).expect("stats");
        assert_eq!(stats.count, 4);
        assert!((stats.avg_flow - 11.5).abs() < 1e-9);
        assert_eq!(stats.min_flow, 10.0);
        assert_eq!(stats.max_flow, 13.0);
        assert!((stats.total_volume - 30.0).abs() < 1e-9);
        assert_eq!(stats.anomaly_count, 0);
    }

    #[test]
    fn recomputing_the_same_snapshot_is_bit_identical() {
        let readings =
            readings_quarter_hourly(ts("2024-01-01T00:00:00Z"), &[10.0, 12.0, 11.0, 13.0]);
        let first = WindowStats::compute(&readings, &ranges(), 3.0).expect("stats");
        let second = WindowStats::compute(&readings, &ranges(), 3.0).expect("stats");
        assert_eq!(first, second);
    }

    #[test]
    fn out_of_range_readings_are_counted_as_anomalies() {
        let mut readings =
            readings_quarter_hourly(ts("2024-01-01T00:00:00Z"), &[10.0, 12.0, 11.0]);
        readings.push(SensorReading {
            node_id: Uuid::nil(),
            ts: ts("2024-01-01T00:45:00Z"),
            flow_rate: -5.0,
            pressure: 4.0,
            temperature: 12.0,
            cumulative_volume: 130.0,
            quality: 1.0,
        });
        let stats = WindowStats::compute(&readings, &ranges(), 3.0).expect("stats");
        assert!(stats.anomaly_count >= 1);
    }

    #[test]
    fn empty_bucket_yields_no_stats() {
        assert_eq!(WindowStats::compute(&[], &ranges(), 3.0), None);
    }

    #[test]
    fn single_reading_has_zero_spread_and_volume() {
        let readings = readings_quarter_hourly(ts("2024-01-01T00:00:00Z"), &[10.0]);
        let stats = WindowStats::compute(&readings, &ranges(), 3.0).expect("stats");
        assert_eq!(stats.stddev_flow, 0.0);
        assert_eq!(stats.total_volume, 0.0);
    }

    #[test]
    fn snapshot_span_covers_all_windows() {
        let start = ts("2024-01-01T10:07:00Z");
        let end = ts("2024-01-01T10:22:00Z");
        let span = snapshot_span(&[TimeWindow::FiveMinutes, TimeWindow::Hour], start, end)
            .expect("span");
        assert_eq!(span.0, ts("2024-01-01T10:00:00Z"));
        assert_eq!(span.1, ts("2024-01-01T11:00:00Z"));
    }

    #[test]
    fn snapshot_span_is_empty_for_empty_range() {
        let at = ts("2024-01-01T10:00:00Z");
        assert_eq!(snapshot_span(&[TimeWindow::Hour], at, at), None);
    }
}
