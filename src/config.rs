use crate::services::scheduler::TriggerSpec;
use anyhow::{Context, Result};

/// Recurring trigger for every pipeline job kind, parsed once at startup.
/// Malformed specs fail here, never at tick time.
#[derive(Debug, Clone)]
pub struct JobTriggers {
    pub full_sync: TriggerSpec,
    pub cache_refresh: TriggerSpec,
    pub realtime_sync: TriggerSpec,
    pub anomaly_scan: TriggerSpec,
    pub quality_check: TriggerSpec,
    pub efficiency_rollup: TriggerSpec,
    pub retention_cleanup: TriggerSpec,
    pub model_evaluation: TriggerSpec,
}

#[derive(Debug, Clone)]
pub struct HydroConfig {
    pub database_url: String,
    pub warehouse_base_url: String,
    pub warehouse_api_token: Option<String>,
    pub forecast_base_url: String,
    pub forecast_api_token: Option<String>,
    pub cache_ttl_seconds: u64,
    pub scheduler_poll_interval_seconds: u64,
    pub aggregation_concurrency: usize,
    pub expected_reading_interval_seconds: i64,
    pub quality_floor: f64,
    pub flow_rate_max: f64,
    pub pressure_max: f64,
    pub temperature_min: f64,
    pub temperature_max: f64,
    pub anomaly_z_threshold: f64,
    pub anomaly_lookback_hours: u32,
    pub mape_degraded_threshold: f64,
    pub prediction_horizon_hours: u32,
    pub prediction_step_minutes: u32,
    pub realtime_lookback_minutes: u64,
    pub full_sync_lookback_hours: u64,
    pub metric_retention_days: u32,
    pub quality_retention_days: u32,
    pub prediction_retention_days: u32,
    pub job_timeout_seconds: u64,
    pub full_sync_timeout_seconds: u64,
    pub triggers: JobTriggers,
}

impl HydroConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("HYDRO_DATABASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("HYDRO_DATABASE_URL must be set for the pipeline runtime")?;

        let warehouse_base_url = env_string("HYDRO_WAREHOUSE_BASE_URL", "http://127.0.0.1:9050");
        let warehouse_api_token = env_optional_string("HYDRO_WAREHOUSE_API_TOKEN");
        let forecast_base_url = env_string("HYDRO_FORECAST_BASE_URL", "http://127.0.0.1:9060");
        let forecast_api_token = env_optional_string("HYDRO_FORECAST_API_TOKEN");

        let cache_ttl_seconds = env_u64("HYDRO_CACHE_TTL_SECONDS", 86_400).clamp(60, 7 * 24 * 3600);
        let scheduler_poll_interval_seconds =
            env_u64("HYDRO_SCHEDULER_POLL_INTERVAL_SECONDS", 15).clamp(5, 300);
        let aggregation_concurrency =
            env_u64("HYDRO_AGGREGATION_CONCURRENCY", 4).clamp(1, 32) as usize;
        let expected_reading_interval_seconds =
            env_u64("HYDRO_EXPECTED_READING_INTERVAL_SECONDS", 900).clamp(30, 3600) as i64;
        let quality_floor = env_f64("HYDRO_QUALITY_FLOOR", 0.6).clamp(0.0, 1.0);

        let flow_rate_max = env_f64("HYDRO_FLOW_RATE_MAX", 10_000.0).max(1.0);
        let pressure_max = env_f64("HYDRO_PRESSURE_MAX", 25.0).max(0.1);
        let temperature_min = env_f64("HYDRO_TEMPERATURE_MIN", -10.0);
        let temperature_max = env_f64("HYDRO_TEMPERATURE_MAX", 60.0);
        if temperature_max <= temperature_min {
            anyhow::bail!("HYDRO_TEMPERATURE_MAX must be greater than HYDRO_TEMPERATURE_MIN");
        }

        let anomaly_z_threshold = env_f64("HYDRO_ANOMALY_Z_THRESHOLD", 3.0).max(0.5);
        let anomaly_lookback_hours = env_u32("HYDRO_ANOMALY_LOOKBACK_HOURS", 24).clamp(1, 24 * 7);
        let mape_degraded_threshold =
            env_f64("HYDRO_MAPE_DEGRADED_THRESHOLD", 0.20).clamp(0.01, 1.0);
        let prediction_horizon_hours =
            env_u32("HYDRO_PREDICTION_HORIZON_HOURS", 24).clamp(1, 168);
        let prediction_step_minutes = env_u32("HYDRO_PREDICTION_STEP_MINUTES", 60).clamp(5, 1440);
        let realtime_lookback_minutes =
            env_u64("HYDRO_REALTIME_LOOKBACK_MINUTES", 15).clamp(5, 180);
        let full_sync_lookback_hours = env_u64("HYDRO_FULL_SYNC_LOOKBACK_HOURS", 36).clamp(1, 24 * 45);

        let metric_retention_days = env_u32("HYDRO_METRIC_RETENTION_DAYS", 90).max(1);
        let quality_retention_days = env_u32("HYDRO_QUALITY_RETENTION_DAYS", 90).max(1);
        let prediction_retention_days = env_u32("HYDRO_PREDICTION_RETENTION_DAYS", 30).max(1);

        let job_timeout_seconds = env_u64("HYDRO_JOB_TIMEOUT_SECONDS", 900).clamp(30, 6 * 3600);
        let full_sync_timeout_seconds =
            env_u64("HYDRO_FULL_SYNC_TIMEOUT_SECONDS", 3600).clamp(60, 12 * 3600);

        let triggers = JobTriggers {
            full_sync: env_trigger("HYDRO_TRIGGER_FULL_SYNC", "daily@02:00")?,
            cache_refresh: env_trigger("HYDRO_TRIGGER_CACHE_REFRESH", "every 1h")?,
            realtime_sync: env_trigger("HYDRO_TRIGGER_REALTIME_SYNC", "every 5m")?,
            anomaly_scan: env_trigger("HYDRO_TRIGGER_ANOMALY_SCAN", "every 15m")?,
            quality_check: env_trigger("HYDRO_TRIGGER_QUALITY_CHECK", "daily@04:30")?,
            efficiency_rollup: env_trigger("HYDRO_TRIGGER_EFFICIENCY_ROLLUP", "every 5m")?,
            retention_cleanup: env_trigger("HYDRO_TRIGGER_RETENTION_CLEANUP", "weekly@sun 03:00")?,
            model_evaluation: env_trigger("HYDRO_TRIGGER_MODEL_EVALUATION", "daily@05:00")?,
        };

        Ok(Self {
            database_url,
            warehouse_base_url,
            warehouse_api_token,
            forecast_base_url,
            forecast_api_token,
            cache_ttl_seconds,
            scheduler_poll_interval_seconds,
            aggregation_concurrency,
            expected_reading_interval_seconds,
            quality_floor,
            flow_rate_max,
            pressure_max,
            temperature_min,
            temperature_max,
            anomaly_z_threshold,
            anomaly_lookback_hours,
            mape_degraded_threshold,
            prediction_horizon_hours,
            prediction_step_minutes,
            realtime_lookback_minutes,
            full_sync_lookback_hours,
            metric_retention_days,
            quality_retention_days,
            prediction_retention_days,
            job_timeout_seconds,
            full_sync_timeout_seconds,
            triggers,
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_trigger(key: &str, default: &str) -> Result<TriggerSpec> {
    let raw = env_string(key, default);
    TriggerSpec::parse(&raw).with_context(|| format!("{key} holds an invalid trigger spec: {raw:?}"))
}
