use crate::services::jobs::{PipelineJobService, RunOutcome};
use crate::services::jobs::types::JobKind;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, Utc, Weekday};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid trigger spec: {0}")]
pub struct TriggerParseError(String);

/// Typed recurring trigger: a fixed interval aligned to the Unix epoch,
/// or a daily / weekly wall-clock spec (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSpec {
    Interval { every_seconds: i64 },
    Daily { hour: u32, minute: u32 },
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
}

impl TriggerSpec {
    /// Accepted forms: `every <N>{s|m|h}`, `daily@HH:MM`,
    /// `weekly@<mon..sun> HH:MM`.
    pub fn parse(raw: &str) -> Result<Self, TriggerParseError> {
        let trimmed = raw.trim();
        if let Some(rest) = trimmed.strip_prefix("every ") {
            return parse_interval(rest.trim());
        }
        if let Some(rest) = trimmed.strip_prefix("daily@") {
            let (hour, minute) = parse_hhmm(rest.trim())
                .ok_or_else(|| TriggerParseError(trimmed.to_string()))?;
            return Ok(TriggerSpec::Daily { hour, minute });
        }
        if let Some(rest) = trimmed.strip_prefix("weekly@") {
            let (day_raw, time_raw) = rest
                .trim()
                .split_once(' ')
                .ok_or_else(|| TriggerParseError(trimmed.to_string()))?;
            let weekday = parse_weekday(day_raw.trim())
                .ok_or_else(|| TriggerParseError(trimmed.to_string()))?;
            let (hour, minute) = parse_hhmm(time_raw.trim())
                .ok_or_else(|| TriggerParseError(trimmed.to_string()))?;
            return Ok(TriggerSpec::Weekly {
                weekday,
                hour,
                minute,
            });
        }
        Err(TriggerParseError(trimmed.to_string()))
    }

    /// Whether an occurrence falls in the half-open window `(after, upto]`.
    /// Stateless: interval triggers fire at epoch multiples, so a missed
    /// tick is picked up by the next poll without bookkeeping.
    pub fn fires_within(&self, after: DateTime<Utc>, upto: DateTime<Utc>) -> bool {
        if upto <= after {
            return false;
        }
        match self {
            TriggerSpec::Interval { every_seconds } => {
                let every = (*every_seconds).max(1);
                upto.timestamp().div_euclid(every) > after.timestamp().div_euclid(every)
            }
            TriggerSpec::Daily { hour, minute } => {
                occurrence_in_window(after, upto, None, *hour, *minute)
            }
            TriggerSpec::Weekly {
                weekday,
                hour,
                minute,
            } => occurrence_in_window(after, upto, Some(*weekday), *hour, *minute),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TriggerSpec::Interval { every_seconds } => format!("every {every_seconds}s"),
            TriggerSpec::Daily { hour, minute } => format!("daily@{hour:02}:{minute:02}"),
            TriggerSpec::Weekly {
                weekday,
                hour,
                minute,
            } => format!("weekly@{weekday} {hour:02}:{minute:02}"),
        }
    }
}

fn parse_interval(rest: &str) -> Result<TriggerSpec, TriggerParseError> {
    let err = || TriggerParseError(format!("every {rest}"));
    if rest.len() < 2 {
        return Err(err());
    }
    let (digits, unit) = rest.split_at(rest.len() - 1);
    let amount: i64 = digits.trim().parse().map_err(|_| err())?;
    if amount <= 0 {
        return Err(err());
    }
    let every_seconds = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        _ => return Err(err()),
    };
    Ok(TriggerSpec::Interval { every_seconds })
}

fn parse_hhmm(value: &str) -> Option<(u32, u32)> {
    let (hour_raw, minute_raw) = value.split_once(':')?;
    let hour: u32 = hour_raw.trim().parse().ok()?;
    let minute: u32 = minute_raw.trim().parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

fn parse_weekday(value: &str) -> Option<Weekday> {
    match value.to_ascii_lowercase().as_str() {
        "mon" => Some(Weekday::Mon),
        "tue" => Some(Weekday::Tue),
        "wed" => Some(Weekday::Wed),
        "thu" => Some(Weekday::Thu),
        "fri" => Some(Weekday::Fri),
        "sat" => Some(Weekday::Sat),
        "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

fn occurrence_in_window(
    after: DateTime<Utc>,
    upto: DateTime<Utc>,
    weekday: Option<Weekday>,
    hour: u32,
    minute: u32,
) -> bool {
    let Some(time) = NaiveTime::from_hms_opt(hour, minute, 0) else {
        return false;
    };
    let mut date = after.date_naive();
    let end_date = upto.date_naive();
    while date <= end_date {
        if weekday.map_or(true, |day| date.weekday() == day) {
            let candidate = DateTime::<Utc>::from_naive_utc_and_offset(date.and_time(time), Utc);
            if candidate > after && candidate <= upto {
                return true;
            }
        }
        date += ChronoDuration::days(1);
    }
    false
}

/// Drives the registered job triggers. Owned by the process entry point
/// and handed the job service by reference; there is no ambient global, so
/// tests can run any number of independent schedulers.
pub struct Scheduler {
    jobs: Arc<PipelineJobService>,
    poll_interval: Duration,
    entries: Vec<(JobKind, TriggerSpec)>,
}

impl Scheduler {
    pub fn new(jobs: Arc<PipelineJobService>, poll_interval: Duration) -> Self {
        Self {
            jobs,
            poll_interval,
            entries: Vec::new(),
        }
    }

    pub fn schedule(&mut self, kind: JobKind, trigger: TriggerSpec) {
        tracing::info!(
            job_kind = kind.as_str(),
            trigger = %trigger.describe(),
            "registered recurring job"
        );
        self.entries.push((kind, trigger));
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            let mut last_tick = Utc::now();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let now = Utc::now();
                        self.tick(last_tick, now);
                        last_tick = now;
                    }
                }
            }
        });
    }

    fn tick(&self, after: DateTime<Utc>, now: DateTime<Utc>) {
        for (kind, trigger) in &self.entries {
            if !trigger.fires_within(after, now) {
                continue;
            }
            let jobs = self.jobs.clone();
            let kind = *kind;
            tokio::spawn(async move {
                match jobs.run_once(kind, "scheduled", None).await {
                    Ok(RunOutcome::Ran(job)) => {
                        tracing::debug!(job_kind = kind.as_str(), job_id = %job.id, status = %job.status, "scheduled run finished");
                    }
                    Ok(RunOutcome::Skipped { .. }) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, job_kind = kind.as_str(), "scheduled run errored before job bookkeeping");
                    }
                }
            });
        }
    }
}
