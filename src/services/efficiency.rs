use crate::error::PipelineError;
use crate::model::NodeKind;
use crate::time::TimeWindow;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Loss volume and efficiency percentage for one zone window. Source
/// meters can read slightly below distribution meters, so loss is floored
/// at zero and the percentage clamped.
pub fn efficiency_parts(input_volume: f64, output_volume: f64) -> (f64, f64) {
    let loss = (input_volume - output_volume).max(0.0);
    let pct = if input_volume > 0.0 {
        (output_volume / input_volume * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };
    (loss, pct)
}

#[derive(Debug, Clone, Default)]
pub struct EfficiencySummary {
    pub zones: u32,
    pub records_written: u32,
}

impl EfficiencySummary {
    pub fn to_detail(&self) -> serde_json::Value {
        serde_json::json!({
            "zones": self.zones,
            "records_written": self.records_written,
        })
    }
}

#[derive(Debug, Clone)]
struct NodeVolume {
    zone: String,
    kind: NodeKind,
    volume: f64,
    windows: i64,
    anomaly_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ZoneAggregate {
    input_volume: f64,
    output_volume: f64,
    active_nodes: i32,
    total_nodes: i32,
    anomaly_count: i64,
}

/// Folds per-node volumes into per-zone totals. Storage nodes hold water
/// rather than moving it, so they count toward node totals but neither
/// side of the balance.
fn fold_zones(nodes: &[NodeVolume]) -> BTreeMap<String, ZoneAggregate> {
    let mut zones: BTreeMap<String, ZoneAggregate> = BTreeMap::new();
    for node in nodes {
        let zone = zones.entry(node.zone.clone()).or_default();
        zone.total_nodes += 1;
        if node.windows > 0 {
            zone.active_nodes += 1;
        }
        zone.anomaly_count += node.anomaly_count;
        match node.kind {
            NodeKind::Source => zone.input_volume += node.volume,
            NodeKind::Distribution => zone.output_volume += node.volume,
            NodeKind::Storage => {}
        }
    }
    zones
}

pub struct EfficiencyRollup {
    db: PgPool,
}

impl EfficiencyRollup {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Rolls up the most recent closed 5-minute bucket.
    pub async fn rollup_latest(&self) -> Result<EfficiencySummary, PipelineError> {
        let window = TimeWindow::FiveMinutes;
        let window_end = window.align_down(Utc::now());
        let window_start = window_end - chrono::Duration::seconds(window.duration_seconds());
        self.rollup(window_start, window_end).await
    }

    /// Per-zone input (source nodes) vs output (distribution nodes) volume
    /// over `[window_start, window_end)`, appended to the efficiency
    /// history.
    pub async fn rollup(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<EfficiencySummary, PipelineError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            id: Uuid,
            zone: String,
            kind: String,
            volume: Option<f64>,
            windows: Option<i64>,
            anomaly_count: Option<i64>,
        }

        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT n.id, n.zone, n.kind,
                   SUM(m.total_volume) AS volume,
                   COUNT(m.node_id)::BIGINT AS windows,
                   SUM(m.anomaly_count)::BIGINT AS anomaly_count
            FROM monitoring_nodes n
            LEFT JOIN computed_metrics m
              ON m.node_id = n.id
             AND m.time_window = '5min'
             AND m.window_start >= $1
             AND m.window_start < $2
            WHERE n.active = true
            GROUP BY n.id, n.zone, n.kind
            ORDER BY n.zone, n.id
            "#,
        )
        .bind(window_start)
        .bind(window_end)
        .fetch_all(&self.db)
        .await?;

        let nodes: Vec<NodeVolume> = rows
            .iter()
            .map(|row| NodeVolume {
                zone: row.zone.clone(),
                kind: NodeKind::parse(&row.kind).unwrap_or_else(|| {
                    tracing::warn!(node_id = %row.id, kind = %row.kind, "unknown node kind; treating as distribution");
                    NodeKind::Distribution
                }),
                volume: row.volume.unwrap_or(0.0),
                windows: row.windows.unwrap_or(0),
                anomaly_count: row.anomaly_count.unwrap_or(0),
            })
            .collect();

        let mut summary = EfficiencySummary::default();
        for (zone, aggregate) in fold_zones(&nodes) {
            summary.zones += 1;
            if aggregate.active_nodes == 0 {
                continue;
            }
            let (loss_volume, efficiency_pct) =
                efficiency_parts(aggregate.input_volume, aggregate.output_volume);
            sqlx::query(
                r#"
                INSERT INTO network_efficiency (
                    zone, window_start, window_end,
                    input_volume, output_volume, loss_volume, efficiency_pct,
                    active_nodes, total_nodes, anomaly_count, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
                "#,
            )
            .bind(&zone)
            .bind(window_start)
            .bind(window_end)
            .bind(aggregate.input_volume)
            .bind(aggregate.output_volume)
            .bind(loss_volume)
            .bind(efficiency_pct)
            .bind(aggregate.active_nodes)
            .bind(aggregate.total_nodes)
            .bind(aggregate.anomaly_count)
            .execute(&self.db)
            .await?;
            summary.records_written += 1;
        }
        Ok(summary)
    }
}
