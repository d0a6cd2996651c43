use crate::cache::{keys, KeyValueCache};
use crate::error::PipelineError;
use crate::time::RollingRange;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Pushes warm-store state into the hot cache. Reads warm, writes hot,
/// never mutates warm rows. Cache write failures are counted and logged
/// but never fail the surrounding job; the API layer falls back to warm
/// reads for missing keys.
pub struct CacheSynchronizer {
    db: PgPool,
    cache: Arc<dyn KeyValueCache>,
    ttl: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub nodes: u32,
    pub keys_written: u64,
    pub write_failures: u64,
}

impl SyncStats {
    pub fn to_detail(&self) -> JsonValue {
        serde_json::json!({
            "nodes": self.nodes,
            "keys_written": self.keys_written,
            "write_failures": self.write_failures,
        })
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
struct LatestRow {
    ts: DateTime<Utc>,
    flow_rate: f64,
    pressure: f64,
    temperature: f64,
    cumulative_volume: f64,
    quality: f64,
}

#[derive(sqlx::FromRow, Debug, Clone, Default)]
pub(crate) struct RollupRow {
    avg_flow: Option<f64>,
    min_flow: Option<f64>,
    max_flow: Option<f64>,
    avg_pressure: Option<f64>,
    total_volume: Option<f64>,
    reading_count: Option<i64>,
    anomaly_count: Option<i64>,
    avg_quality: Option<f64>,
}

/// Everything needed to rebuild one node's cache keys.
struct NodeCacheSnapshot {
    latest: Option<LatestRow>,
    rollups: Vec<(RollingRange, RollupRow)>,
}

fn latest_payload(row: &LatestRow) -> JsonValue {
    serde_json::json!({
        "ts": row.ts.to_rfc3339(),
        "flow_rate": row.flow_rate,
        "pressure": row.pressure,
        "temperature": row.temperature,
        "cumulative_volume": row.cumulative_volume,
        "quality": row.quality,
    })
}

fn rollup_payload(range: RollingRange, row: &RollupRow) -> JsonValue {
    serde_json::json!({
        "range": range.as_str(),
        "avg_flow_rate": row.avg_flow,
        "min_flow_rate": row.min_flow,
        "max_flow_rate": row.max_flow,
        "avg_pressure": row.avg_pressure,
        "total_volume": row.total_volume.unwrap_or(0.0),
        "reading_count": row.reading_count.unwrap_or(0),
        "anomaly_count": row.anomaly_count.unwrap_or(0),
        "avg_quality": row.avg_quality,
    })
}

/// The full key set for one node. Both the incremental and the full
/// refresh go through this single function, which is what makes the two
/// paths write identical contents for identical warm-store data.
fn node_entries(node_id: Uuid, snapshot: &NodeCacheSnapshot) -> Vec<(String, JsonValue)> {
    let mut entries = Vec::with_capacity(snapshot.rollups.len() + 1);
    if let Some(latest) = &snapshot.latest {
        entries.push((keys::node_latest(node_id), latest_payload(latest)));
    }
    for (range, rollup) in &snapshot.rollups {
        entries.push((keys::node_metrics(node_id, *range), rollup_payload(*range, rollup)));
    }
    entries
}

impl CacheSynchronizer {
    pub fn new(db: PgPool, cache: Arc<dyn KeyValueCache>, ttl: Duration) -> Self {
        Self { db, cache, ttl }
    }

    /// Incremental refresh: rebuilds keys only for the given nodes (the
    /// just-completed aggregation's output list), plus the system-wide
    /// keys derived from them.
    pub async fn refresh(&self, node_ids: &[Uuid]) -> Result<SyncStats, PipelineError> {
        let mut stats = SyncStats::default();
        for node_id in node_ids {
            let snapshot = self.load_node_snapshot(*node_id).await?;
            let entries = node_entries(*node_id, &snapshot);
            self.write_entries(entries, &mut stats).await;
            stats.nodes += 1;
        }
        self.write_system_entries(&mut stats).await?;
        tracing::info!(
            nodes = stats.nodes,
            keys_written = stats.keys_written,
            write_failures = stats.write_failures,
            "cache refresh finished"
        );
        Ok(stats)
    }

    /// Full rebuild: every key for every active node. Used after the
    /// daily full sync.
    pub async fn refresh_all(&self) -> Result<SyncStats, PipelineError> {
        let node_ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM monitoring_nodes WHERE active = true ORDER BY name")
                .fetch_all(&self.db)
                .await?;
        self.refresh(&node_ids).await
    }

    async fn load_node_snapshot(&self, node_id: Uuid) -> Result<NodeCacheSnapshot, sqlx::Error> {
        let latest: Option<LatestRow> = sqlx::query_as(
            r#"
            SELECT ts, flow_rate, pressure, temperature, cumulative_volume, quality
            FROM node_latest_readings
            WHERE node_id = $1
            "#,
        )
        .bind(node_id)
        .fetch_optional(&self.db)
        .await?;

        let mut rollups = Vec::with_capacity(RollingRange::ALL.len());
        for range in RollingRange::ALL {
            let since = Utc::now() - range.duration();
            let rollup: RollupRow = sqlx::query_as(
                r#"
                SELECT AVG(avg_flow_rate) AS avg_flow,
                       MIN(min_flow_rate) AS min_flow,
                       MAX(max_flow_rate) AS max_flow,
                       AVG(avg_pressure) AS avg_pressure,
                       SUM(total_volume) AS total_volume,
                       SUM(reading_count)::BIGINT AS reading_count,
                       SUM(anomaly_count)::BIGINT AS anomaly_count,
                       AVG(quality_score) AS avg_quality
                FROM computed_metrics
                WHERE node_id = $1 AND time_window = '5min' AND window_start >= $2
                "#,
            )
            .bind(node_id)
            .bind(since)
            .fetch_one(&self.db)
            .await?;
            rollups.push((range, rollup));
        }

        Ok(NodeCacheSnapshot { latest, rollups })
    }

    async fn write_system_entries(&self, stats: &mut SyncStats) -> Result<(), PipelineError> {
        for range in RollingRange::ALL {
            let since = Utc::now() - range.duration();
            let rollup: RollupRow = sqlx::query_as(
                r#"
                SELECT AVG(avg_flow_rate) AS avg_flow,
                       MIN(min_flow_rate) AS min_flow,
                       MAX(max_flow_rate) AS max_flow,
                       AVG(avg_pressure) AS avg_pressure,
                       SUM(total_volume) AS total_volume,
                       SUM(reading_count)::BIGINT AS reading_count,
                       SUM(anomaly_count)::BIGINT AS anomaly_count,
                       AVG(quality_score) AS avg_quality
                FROM computed_metrics
                WHERE time_window = '5min' AND window_start >= $1
                "#,
            )
            .bind(since)
            .fetch_one(&self.db)
            .await?;
            let entries = vec![(keys::system_metrics(range), rollup_payload(range, &rollup))];
            self.write_entries(entries, stats).await;
        }

        #[derive(sqlx::FromRow)]
        struct NodeListRow {
            id: Uuid,
            name: String,
            zone: String,
            kind: String,
        }
        let nodes: Vec<NodeListRow> = sqlx::query_as(
            r#"
            SELECT id, name, zone, kind
            FROM monitoring_nodes
            WHERE active = true
            ORDER BY name
            "#,
        )
        .fetch_all(&self.db)
        .await?;
        let payload = serde_json::json!(nodes
            .iter()
            .map(|node| serde_json::json!({
                "id": node.id,
                "name": node.name,
                "zone": node.zone,
                "kind": node.kind,
            }))
            .collect::<Vec<_>>());
        self.write_entries(vec![(keys::NODES_ALL.to_string(), payload)], stats)
            .await;
        Ok(())
    }

    async fn write_entries(&self, entries: Vec<(String, JsonValue)>, stats: &mut SyncStats) {
        for (key, value) in entries {
            match self.cache.put(&key, value, self.ttl).await {
                Ok(()) => stats.keys_written += 1,
                Err(err) => {
                    tracing::warn!(error = %err, key = %key, "cache write failed; continuing");
                    stats.write_failures += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, MemoryCache};
    use async_trait::async_trait;

    fn sample_snapshot() -> NodeCacheSnapshot {
        NodeCacheSnapshot {
            latest: Some(LatestRow {
                ts: DateTime::parse_from_rfc3339("2024-01-01T00:45:00Z")
                    .unwrap()
                    .with_timezone(&Utc),
                flow_rate: 13.0,
                pressure: 4.3,
                temperature: 12.0,
                cumulative_volume: 130.0,
                quality: 1.0,
            }),
            rollups: RollingRange::ALL
                .iter()
                .map(|range| {
                    (
                        *range,
                        RollupRow {
                            avg_flow: Some(11.5),
                            min_flow: Some(10.0),
                            max_flow: Some(13.0),
                            avg_pressure: Some(4.15),
                            total_volume: Some(30.0),
                            reading_count: Some(4),
                            anomaly_count: Some(0),
                            avg_quality: Some(1.0),
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn node_entries_are_deterministic_for_identical_data() {
        let node_id = Uuid::nil();
        // Full and incremental refresh both derive their writes from this
        // function, so equal inputs must yield byte-equal key contents.
        let full = node_entries(node_id, &sample_snapshot());
        let incremental = node_entries(node_id, &sample_snapshot());
        assert_eq!(full, incremental);
        assert_eq!(full.len(), 1 + RollingRange::ALL.len());
        assert_eq!(full[0].0, keys::node_latest(node_id));
    }

    #[test]
    fn empty_rollup_row_serializes_with_zero_counts() {
        let payload = rollup_payload(RollingRange::H1, &RollupRow::default());
        assert_eq!(payload["reading_count"], 0);
        assert_eq!(payload["anomaly_count"], 0);
        assert_eq!(payload["avg_flow_rate"], JsonValue::Null);
    }

    struct BrokenCache;

    #[async_trait]
    impl KeyValueCache for BrokenCache {
        async fn put(&self, _: &str, _: JsonValue, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        async fn get(&self, _: &str) -> Result<Option<JsonValue>, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        async fn delete(&self, _: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        async fn key_count(&self) -> Result<usize, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }

    fn synchronizer_with(cache: Arc<dyn KeyValueCache>) -> CacheSynchronizer {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgresql://postgres@localhost/postgres")
            .expect("lazy pool");
        CacheSynchronizer::new(pool, cache, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn write_failures_are_counted_not_raised() {
        let sync = synchronizer_with(Arc::new(BrokenCache));
        let mut stats = SyncStats::default();
        let entries = node_entries(Uuid::nil(), &sample_snapshot());
        sync.write_entries(entries, &mut stats).await;
        assert_eq!(stats.keys_written, 0);
        assert_eq!(stats.write_failures, (1 + RollingRange::ALL.len()) as u64);
    }

    #[tokio::test]
    async fn successful_writes_land_under_the_documented_keys() {
        let cache = Arc::new(MemoryCache::new());
        let sync = synchronizer_with(cache.clone());
        let mut stats = SyncStats::default();
        let node_id = Uuid::nil();
        sync.write_entries(node_entries(node_id, &sample_snapshot()), &mut stats)
            .await;
        assert_eq!(stats.write_failures, 0);
        let latest = cache.get(&keys::node_latest(node_id)).await.unwrap();
        assert_eq!(latest.unwrap()["flow_rate"], 13.0);
        let rollup = cache
            .get(&keys::node_metrics(node_id, RollingRange::H24))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rollup["range"], "24h");
        assert_eq!(rollup["reading_count"], 4);
    }
}
