use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff applied to individual calls against the
/// cold tier and the forecasting service. Delays double from `base_delay`
/// up to `max_delay`, with +/-25% jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.75..1.25);
        capped.mul_f64(jitter)
    }
}

pub async fn with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => {
                tracing::warn!(error = %err, label, attempt, "giving up after retries");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(error = %err, label, attempt, delay_ms = delay.as_millis() as u64, "transient failure; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
