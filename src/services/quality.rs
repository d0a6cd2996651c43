use crate::config::HydroConfig;
use crate::error::PipelineError;
use crate::model::{MetricKind, SensorReading};
use sqlx::PgPool;
use statrs::distribution::{ContinuousCDF, Normal};
use uuid::Uuid;

// Fixed weighting of the composite quality score.
pub const WEIGHT_COMPLETENESS: f64 = 0.5;
pub const WEIGHT_VALIDITY: f64 = 0.3;
pub const WEIGHT_CONSISTENCY: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct SaneRanges {
    pub flow: (f64, f64),
    pub pressure: (f64, f64),
    pub temperature: (f64, f64),
}

impl SaneRanges {
    pub fn from_config(config: &HydroConfig) -> Self {
        Self {
            flow: (0.0, config.flow_rate_max),
            pressure: (0.0, config.pressure_max),
            temperature: (config.temperature_min, config.temperature_max),
        }
    }

    /// Sane bounds per metric kind. Reservoir level rides on the
    /// cumulative volume meter and has no network-wide bound.
    pub fn bounds(&self, kind: MetricKind) -> Option<(f64, f64)> {
        match kind {
            MetricKind::FlowRate => Some(self.flow),
            MetricKind::Pressure => Some(self.pressure),
            MetricKind::ReservoirLevel => None,
            MetricKind::Temperature => Some(self.temperature),
        }
    }

    pub fn contains(&self, reading: &SensorReading) -> bool {
        out_of_range_kinds(reading, self).is_empty()
    }
}

/// Which of a reading's measurements fall outside their sane range.
pub fn out_of_range_kinds(reading: &SensorReading, ranges: &SaneRanges) -> Vec<MetricKind> {
    MetricKind::ALL
        .iter()
        .copied()
        .filter(|kind| {
            ranges
                .bounds(*kind)
                .is_some_and(|(lo, hi)| {
                    let value = reading.value(*kind);
                    value < lo || value > hi
                })
        })
        .collect()
}

/// Trailing per-node flow statistics used for the consistency component.
#[derive(Debug, Clone, Copy)]
pub struct Baseline {
    pub mean_flow: f64,
    pub stddev_flow: f64,
}

#[derive(Debug, Clone)]
pub struct QualityBreakdown {
    pub completeness: f64,
    pub validity: f64,
    pub consistency: f64,
    pub overall: f64,
    pub issues: Vec<String>,
}

/// Scores one node/window batch of readings. A score below `floor` is
/// flagged through `issues`; the window is still aggregated and stored,
/// never dropped.
pub fn assess(
    readings: &[SensorReading],
    expected_count: f64,
    ranges: &SaneRanges,
    baseline: Option<Baseline>,
    floor: f64,
) -> QualityBreakdown {
    let mut issues = Vec::new();

    let completeness = if expected_count <= 0.0 {
        1.0
    } else {
        (readings.len() as f64 / expected_count).clamp(0.0, 1.0)
    };
    if readings.is_empty() {
        issues.push("no_data".to_string());
    } else if completeness < 0.9 {
        issues.push("low_completeness".to_string());
    }

    let validity = if readings.is_empty() {
        0.0
    } else {
        let in_range = readings.iter().filter(|r| ranges.contains(r)).count();
        in_range as f64 / readings.len() as f64
    };
    if !readings.is_empty() && validity < 1.0 {
        issues.push("out_of_range_readings".to_string());
    }

    let consistency = consistency_score(readings, baseline);
    if consistency < 0.2 {
        issues.push("baseline_deviation".to_string());
    }

    let overall = WEIGHT_COMPLETENESS * completeness
        + WEIGHT_VALIDITY * validity
        + WEIGHT_CONSISTENCY * consistency;
    if overall < floor {
        issues.push("quality_below_floor".to_string());
    }

    QualityBreakdown {
        completeness,
        validity,
        consistency,
        overall,
        issues,
    }
}

/// Two-sided tail probability of the window mean under the trailing
/// baseline: 1.0 when the mean sits on the baseline, approaching 0 as it
/// drifts several standard deviations away.
fn consistency_score(readings: &[SensorReading], baseline: Option<Baseline>) -> f64 {
    if readings.is_empty() {
        return 0.0;
    }
    let Some(baseline) = baseline else {
        return 1.0;
    };
    if baseline.stddev_flow <= f64::EPSILON {
        return 1.0;
    }
    let mean = readings.iter().map(|r| r.flow_rate).sum::<f64>() / readings.len() as f64;
    let z = ((mean - baseline.mean_flow) / baseline.stddev_flow).abs();
    let Ok(normal) = Normal::new(0.0, 1.0) else {
        return 1.0;
    };
    (2.0 * (1.0 - normal.cdf(z))).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Default)]
pub struct QualityCheckSummary {
    pub windows_scanned: u64,
    pub windows_flagged: u64,
    pub nodes_flagged: Vec<Uuid>,
}

impl QualityCheckSummary {
    pub fn to_detail(&self) -> serde_json::Value {
        serde_json::json!({
            "windows_scanned": self.windows_scanned,
            "windows_flagged": self.windows_flagged,
            "nodes_flagged": self.nodes_flagged,
        })
    }
}

/// Daily sweep over stored quality rows: surfaces the nodes that spent the
/// trailing day below the configured floor.
pub async fn daily_check(db: &PgPool, floor: f64) -> Result<QualityCheckSummary, PipelineError> {
    #[derive(sqlx::FromRow)]
    struct Row {
        node_id: Uuid,
        windows: i64,
        flagged: i64,
    }

    let rows: Vec<Row> = sqlx::query_as(
        r#"
        SELECT node_id,
               COUNT(*)::BIGINT AS windows,
               COUNT(*) FILTER (WHERE overall_score < $1)::BIGINT AS flagged
        FROM data_quality
        WHERE window_start >= now() - interval '1 day'
        GROUP BY node_id
        ORDER BY flagged DESC
        "#,
    )
    .bind(floor)
    .fetch_all(db)
    .await?;

    let mut summary = QualityCheckSummary::default();
    for row in rows {
        summary.windows_scanned += row.windows as u64;
        summary.windows_flagged += row.flagged as u64;
        if row.flagged > 0 {
            summary.nodes_flagged.push(row.node_id);
        }
    }
    if summary.windows_flagged > 0 {
        tracing::warn!(
            windows_flagged = summary.windows_flagged,
            nodes = summary.nodes_flagged.len(),
            "data-quality check found windows below the floor"
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn ranges() -> SaneRanges {
        SaneRanges {
            flow: (0.0, 100.0),
            pressure: (0.0, 10.0),
            temperature: (-10.0, 60.0),
        }
    }

    fn reading(flow: f64) -> SensorReading {
        SensorReading {
            node_id: Uuid::nil(),
            ts: DateTime::<Utc>::UNIX_EPOCH,
            flow_rate: flow,
            pressure: 4.0,
            temperature: 12.0,
            cumulative_volume: 0.0,
            quality: 1.0,
        }
    }

    #[test]
    fn perfect_batch_scores_one() {
        let readings: Vec<SensorReading> = (0..4).map(|_| reading(10.0)).collect();
        let breakdown = assess(&readings, 4.0, &ranges(), None, 0.6);
        assert!((breakdown.overall - 1.0).abs() < 1e-9);
        assert!(breakdown.issues.is_empty());
    }

    #[test]
    fn missing_readings_reduce_completeness() {
        let readings: Vec<SensorReading> = (0..2).map(|_| reading(10.0)).collect();
        let breakdown = assess(&readings, 4.0, &ranges(), None, 0.6);
        assert!((breakdown.completeness - 0.5).abs() < 1e-9);
        assert!(breakdown.issues.contains(&"low_completeness".to_string()));
    }

    #[test]
    fn out_of_range_kinds_names_the_offending_metric() {
        let mut bad = reading(10.0);
        bad.pressure = 99.0;
        assert_eq!(out_of_range_kinds(&bad, &ranges()), vec![MetricKind::Pressure]);
        // Cumulative volume has no bound, so a huge meter value is fine.
        let mut meter = reading(10.0);
        meter.cumulative_volume = 1e12;
        assert!(out_of_range_kinds(&meter, &ranges()).is_empty());
    }

    #[test]
    fn out_of_range_readings_reduce_validity() {
        let mut readings: Vec<SensorReading> = (0..3).map(|_| reading(10.0)).collect();
        readings.push(reading(5_000.0));
        let breakdown = assess(&readings, 4.0, &ranges(), None, 0.6);
        assert!((breakdown.validity - 0.75).abs() < 1e-9);
        assert!(breakdown
            .issues
            .contains(&"out_of_range_readings".to_string()));
    }

    #[test]
    fn baseline_drift_reduces_consistency() {
        let readings: Vec<SensorReading> = (0..4).map(|_| reading(50.0)).collect();
        let baseline = Baseline {
            mean_flow: 10.0,
            stddev_flow: 2.0,
        };
        let breakdown = assess(&readings, 4.0, &ranges(), Some(baseline), 0.6);
        assert!(breakdown.consistency < 0.01);
        assert!(breakdown.issues.contains(&"baseline_deviation".to_string()));
    }

    #[test]
    fn empty_batch_is_flagged_not_dropped() {
        let breakdown = assess(&[], 4.0, &ranges(), None, 0.6);
        assert_eq!(breakdown.completeness, 0.0);
        assert!(breakdown.issues.contains(&"no_data".to_string()));
        assert!(breakdown.issues.contains(&"quality_below_floor".to_string()));
    }

    #[test]
    fn score_below_floor_is_flagged() {
        let readings: Vec<SensorReading> = (0..1).map(|_| reading(10.0)).collect();
        let breakdown = assess(&readings, 12.0, &ranges(), None, 0.6);
        assert!(breakdown.overall < 0.6);
        assert!(breakdown.issues.contains(&"quality_below_floor".to_string()));
    }
}
