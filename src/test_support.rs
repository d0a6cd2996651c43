use crate::cache::MemoryCache;
use crate::config::{HydroConfig, JobTriggers};
use crate::db;
use crate::model::SensorReading;
use crate::services::aggregation::{AggregationEngine, AggregationSettings};
use crate::services::anomaly::AnomalyScanner;
use crate::services::cache_sync::CacheSynchronizer;
use crate::services::efficiency::EfficiencyRollup;
use crate::services::jobs::PipelineJobService;
use crate::services::ml::client::{AnomalyVerdict, ForecastError, ForecastPoint, ForecastProvider};
use crate::services::ml::{PredictionManager, PredictionSettings};
use crate::services::scheduler::TriggerSpec;
use crate::state::AppState;
use crate::time::align_up;
use crate::warehouse::{ReadingStore, WarehouseError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub fn test_config() -> HydroConfig {
    HydroConfig {
        database_url: "postgresql://postgres@localhost/postgres".to_string(),
        warehouse_base_url: "http://127.0.0.1:9050".to_string(),
        warehouse_api_token: None,
        forecast_base_url: "http://127.0.0.1:9060".to_string(),
        forecast_api_token: None,
        cache_ttl_seconds: 3600,
        scheduler_poll_interval_seconds: 5,
        aggregation_concurrency: 4,
        expected_reading_interval_seconds: 900,
        quality_floor: 0.6,
        flow_rate_max: 10_000.0,
        pressure_max: 25.0,
        temperature_min: -10.0,
        temperature_max: 60.0,
        anomaly_z_threshold: 3.0,
        anomaly_lookback_hours: 24,
        mape_degraded_threshold: 0.20,
        prediction_horizon_hours: 24,
        prediction_step_minutes: 60,
        realtime_lookback_minutes: 15,
        full_sync_lookback_hours: 36,
        metric_retention_days: 90,
        quality_retention_days: 90,
        prediction_retention_days: 30,
        job_timeout_seconds: 900,
        full_sync_timeout_seconds: 3600,
        triggers: JobTriggers {
            full_sync: TriggerSpec::parse("daily@02:00").expect("trigger"),
            cache_refresh: TriggerSpec::parse("every 1h").expect("trigger"),
            realtime_sync: TriggerSpec::parse("every 5m").expect("trigger"),
            anomaly_scan: TriggerSpec::parse("every 15m").expect("trigger"),
            quality_check: TriggerSpec::parse("daily@04:30").expect("trigger"),
            efficiency_rollup: TriggerSpec::parse("every 5m").expect("trigger"),
            retention_cleanup: TriggerSpec::parse("weekly@sun 03:00").expect("trigger"),
            model_evaluation: TriggerSpec::parse("daily@05:00").expect("trigger"),
        },
    }
}

/// In-memory cold tier: readings per node, optional per-node failures,
/// an optional fetch delay, and fetch counters for snapshot assertions.
#[derive(Default)]
pub struct FakeWarehouse {
    readings: Mutex<HashMap<Uuid, Vec<SensorReading>>>,
    failing_nodes: Mutex<HashSet<Uuid>>,
    fetch_counts: Mutex<HashMap<Uuid, u32>>,
    fail_ping: AtomicBool,
    fetch_delay: Mutex<Option<Duration>>,
}

impl FakeWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, node_id: Uuid, readings: Vec<SensorReading>) {
        self.readings.lock().unwrap().insert(node_id, readings);
    }

    pub fn fail_node(&self, node_id: Uuid) {
        self.failing_nodes.lock().unwrap().insert(node_id);
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub fn fetch_count(&self, node_id: Uuid) -> u32 {
        self.fetch_counts
            .lock()
            .unwrap()
            .get(&node_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn reset_fetch_counts(&self) {
        self.fetch_counts.lock().unwrap().clear();
    }
}

#[async_trait]
impl ReadingStore for FakeWarehouse {
    async fn ping(&self) -> Result<(), WarehouseError> {
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(WarehouseError::Transient("warehouse offline".to_string()));
        }
        Ok(())
    }

    async fn fetch_readings(
        &self,
        node_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>, WarehouseError> {
        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        *self
            .fetch_counts
            .lock()
            .unwrap()
            .entry(node_id)
            .or_insert(0) += 1;
        if self.failing_nodes.lock().unwrap().contains(&node_id) {
            return Err(WarehouseError::Decode(
                "malformed source partition".to_string(),
            ));
        }
        let readings = self.readings.lock().unwrap();
        Ok(readings
            .get(&node_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.ts >= start && r.ts < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Deterministic forecaster: hour-aligned targets so repeated runs within
/// the same hour hit the same (model, node, target) keys.
#[derive(Default)]
pub struct FakeForecaster {
    failing_nodes: Mutex<HashSet<Uuid>>,
}

impl FakeForecaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_node(&self, node_id: Uuid) {
        self.failing_nodes.lock().unwrap().insert(node_id);
    }
}

#[async_trait]
impl ForecastProvider for FakeForecaster {
    async fn forecast(
        &self,
        _model_ref: &str,
        node_id: Uuid,
        from: DateTime<Utc>,
        horizon_hours: u32,
        step_minutes: u32,
    ) -> Result<Vec<ForecastPoint>, ForecastError> {
        if self.failing_nodes.lock().unwrap().contains(&node_id) {
            return Err(ForecastError::Transient("model endpoint 503".to_string()));
        }
        let first = align_up(from, 3600);
        let steps = (horizon_hours as i64 * 60 / step_minutes.max(1) as i64).max(1);
        Ok((0..steps)
            .map(|idx| {
                let target_ts = first + ChronoDuration::minutes(step_minutes as i64 * idx);
                ForecastPoint {
                    target_ts,
                    value: 10.0 + idx as f64,
                    lower: 8.0 + idx as f64,
                    upper: 12.0 + idx as f64,
                    confidence: 0.9,
                }
            })
            .collect())
    }

    async fn anomaly_score(
        &self,
        _model_ref: &str,
        _node_id: Uuid,
        _window_start: DateTime<Utc>,
        _window_end: DateTime<Utc>,
    ) -> Result<AnomalyVerdict, ForecastError> {
        Ok(AnomalyVerdict {
            is_anomaly: false,
            score: 0.1,
        })
    }
}

pub struct TestHarness {
    pub warehouse: Arc<FakeWarehouse>,
    pub forecaster: Arc<FakeForecaster>,
    pub cache: Arc<MemoryCache>,
    pub jobs: Arc<PipelineJobService>,
    pub aggregation: Arc<AggregationEngine>,
    pub predictions: Arc<PredictionManager>,
}

pub fn harness_with_pool(pool: PgPool) -> TestHarness {
    let config = test_config();
    let warehouse = Arc::new(FakeWarehouse::new());
    let forecaster = Arc::new(FakeForecaster::new());
    let cache = Arc::new(MemoryCache::new());

    let aggregation = Arc::new(AggregationEngine::new(
        pool.clone(),
        warehouse.clone(),
        AggregationSettings::from_config(&config),
    ));
    let cache_sync = Arc::new(CacheSynchronizer::new(
        pool.clone(),
        cache.clone(),
        Duration::from_secs(config.cache_ttl_seconds),
    ));
    let predictions = Arc::new(PredictionManager::new(
        pool.clone(),
        forecaster.clone(),
        PredictionSettings::from_config(&config),
    ));
    let anomaly = Arc::new(AnomalyScanner::new(
        pool.clone(),
        cache.clone(),
        forecaster.clone(),
        Duration::from_secs(config.cache_ttl_seconds),
        config.anomaly_z_threshold,
        config.anomaly_lookback_hours,
    ));
    let efficiency = Arc::new(EfficiencyRollup::new(pool.clone()));

    let jobs = Arc::new(PipelineJobService::new(
        pool,
        config,
        aggregation.clone(),
        cache_sync,
        predictions.clone(),
        anomaly,
        efficiency,
    ));

    TestHarness {
        warehouse,
        forecaster,
        cache,
        jobs,
        aggregation,
        predictions,
    }
}

pub fn test_state() -> AppState {
    let config = test_config();
    let pool = db::connect_lazy(&config.database_url).expect("connect_lazy");
    let harness = harness_with_pool(pool.clone());
    AppState {
        config,
        db: pool,
        cache: harness.cache,
        jobs: harness.jobs,
        http: reqwest::Client::new(),
    }
}
