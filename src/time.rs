use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

/// Fixed-size aggregation buckets. Buckets are aligned to the Unix epoch,
/// so a `Week` bucket is any 7-day span starting at an epoch multiple and
/// `Month` is a fixed 30-day span, not a calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    FiveMinutes,
    Hour,
    Day,
    Week,
    Month,
}

impl TimeWindow {
    pub const ALL: [TimeWindow; 5] = [
        TimeWindow::FiveMinutes,
        TimeWindow::Hour,
        TimeWindow::Day,
        TimeWindow::Week,
        TimeWindow::Month,
    ];

    /// The window set recomputed by the frequent incremental sync.
    pub const REALTIME: [TimeWindow; 2] = [TimeWindow::FiveMinutes, TimeWindow::Hour];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::FiveMinutes => "5min",
            TimeWindow::Hour => "1hour",
            TimeWindow::Day => "1day",
            TimeWindow::Week => "1week",
            TimeWindow::Month => "1month",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "5min" => Some(TimeWindow::FiveMinutes),
            "1hour" => Some(TimeWindow::Hour),
            "1day" => Some(TimeWindow::Day),
            "1week" => Some(TimeWindow::Week),
            "1month" => Some(TimeWindow::Month),
            _ => None,
        }
    }

    pub fn duration_seconds(&self) -> i64 {
        match self {
            TimeWindow::FiveMinutes => 5 * 60,
            TimeWindow::Hour => 3600,
            TimeWindow::Day => 24 * 3600,
            TimeWindow::Week => 7 * 24 * 3600,
            TimeWindow::Month => 30 * 24 * 3600,
        }
    }

    pub fn align_down(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        align_down(ts, self.duration_seconds())
    }

    pub fn align_up(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        align_up(ts, self.duration_seconds())
    }

    /// Bucket boundaries `[start, end)` overlapping the half-open range
    /// `[range_start, range_end)`.
    pub fn buckets_overlapping(
        &self,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let mut buckets = Vec::new();
        if range_end <= range_start {
            return buckets;
        }
        let step = ChronoDuration::seconds(self.duration_seconds());
        let mut start = self.align_down(range_start);
        while start < range_end {
            buckets.push((start, start + step));
            start += step;
        }
        buckets
    }
}

/// Standard rolling ranges served from the hot cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollingRange {
    H1,
    H6,
    H24,
    D3,
    D7,
    D30,
}

impl RollingRange {
    pub const ALL: [RollingRange; 6] = [
        RollingRange::H1,
        RollingRange::H6,
        RollingRange::H24,
        RollingRange::D3,
        RollingRange::D7,
        RollingRange::D30,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RollingRange::H1 => "1h",
            RollingRange::H6 => "6h",
            RollingRange::H24 => "24h",
            RollingRange::D3 => "3d",
            RollingRange::D7 => "7d",
            RollingRange::D30 => "30d",
        }
    }

    pub fn duration(&self) -> ChronoDuration {
        match self {
            RollingRange::H1 => ChronoDuration::hours(1),
            RollingRange::H6 => ChronoDuration::hours(6),
            RollingRange::H24 => ChronoDuration::hours(24),
            RollingRange::D3 => ChronoDuration::days(3),
            RollingRange::D7 => ChronoDuration::days(7),
            RollingRange::D30 => ChronoDuration::days(30),
        }
    }
}

pub fn align_down(ts: DateTime<Utc>, interval_seconds: i64) -> DateTime<Utc> {
    let interval = interval_seconds.max(1);
    let interval_ms = interval * 1000;
    let ts_ms = ts.timestamp_millis();
    let bucket_ms = ts_ms.div_euclid(interval_ms) * interval_ms;
    Utc.timestamp_millis_opt(bucket_ms).single().unwrap_or(ts)
}

pub fn align_up(ts: DateTime<Utc>, interval_seconds: i64) -> DateTime<Utc> {
    let interval = interval_seconds.max(1);
    let interval_ms = interval * 1000;
    let ts_ms = ts.timestamp_millis();
    if ts_ms % interval_ms == 0 {
        return align_down(ts, interval_seconds);
    }
    align_down(ts, interval_seconds) + ChronoDuration::milliseconds(interval_ms)
}
