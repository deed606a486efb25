//! Warm-up records and the values derived from them.

use crate::error::WarmupError;
use crate::health::CachedHealth;
use crate::store::DailyCounter;
use amber_relay_core::WorkspaceId;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Daily send caps for the default 42-day ramp.
pub const DEFAULT_WARMUP_SCHEDULE: [u32; 42] = [
    10, 15, 20, 25, 35, 45, 50, // week 1
    65, 80, 100, 120, 150, 175, 200, // week 2
    250, 300, 350, 400, 500, 600, 750, // week 3
    900, 1_000, 1_200, 1_500, 1_800, 2_000, 2_500, // week 4
    3_000, 3_500, 4_000, 4_500, 5_000, 5_500, 6_000, // week 5
    6_500, 7_000, 7_500, 8_000, 8_500, 9_000, 10_000, // week 6
];

pub const DEFAULT_SEND_WINDOW_START: u8 = 9;
pub const DEFAULT_SEND_WINDOW_END: u8 = 19;
pub const DEFAULT_MAX_BOUNCE_RATE: f64 = 5.0;
pub const DEFAULT_MAX_COMPLAINT_RATE: f64 = 0.1;

static ADDRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s<>]+@([^@\s<>]+\.[^@\s<>]+)$").expect("address pattern is valid")
});

/// Lifecycle state of a warm-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl WarmupStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WarmupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The warm-up state of one sending domain.
///
/// Lifetime counters only move when a day is rolled over by
/// [`SendRateGovernor::advance_day`](crate::SendRateGovernor::advance_day);
/// the current day's activity lives in the store's daily counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupDomain {
    pub domain: String,
    pub workspace_id: WorkspaceId,
    pub status: WarmupStatus,
    /// Index into `schedule`.
    pub warmup_day: u32,
    pub schedule: Vec<u32>,
    /// First hour (UTC) of the send window.
    pub send_window_start: u8,
    /// Hour (UTC) at which the send window closes. May be below the start
    /// for windows that cross midnight.
    pub send_window_end: u8,
    /// Auto-pause threshold, percent.
    pub max_bounce_rate: f64,
    /// Auto-pause threshold, percent.
    pub max_complaint_rate: f64,
    pub total_sent: u64,
    pub total_bounced: u64,
    pub total_complaints: u64,
    pub total_delivered: u64,
    pub total_opens: u64,
    pub total_clicks: u64,
    pub total_replies: u64,
    pub bounce_rate: f64,
    pub complaint_rate: f64,
    pub open_rate: f64,
    pub low_engagement_warning: bool,
    pub pause_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Date whose counters were last rolled into the lifetime totals.
    #[serde(default)]
    pub last_advanced_on: Option<NaiveDate>,
    pub health: Option<CachedHealth>,
    /// Incremented by the store on every successful update.
    pub version: u64,
}

impl WarmupDomain {
    /// Creates an active warm-up on day zero of `request`'s schedule.
    #[must_use]
    pub fn start(request: &StartWarmup, now: DateTime<Utc>) -> Self {
        Self {
            domain: request.domain.to_lowercase(),
            workspace_id: request.workspace_id,
            status: WarmupStatus::Active,
            warmup_day: 0,
            schedule: request.schedule(),
            send_window_start: request.send_window_start,
            send_window_end: request.send_window_end,
            max_bounce_rate: request.max_bounce_rate,
            max_complaint_rate: request.max_complaint_rate,
            total_sent: 0,
            total_bounced: 0,
            total_complaints: 0,
            total_delivered: 0,
            total_opens: 0,
            total_clicks: 0,
            total_replies: 0,
            bounce_rate: 0.0,
            complaint_rate: 0.0,
            open_rate: 0.0,
            low_engagement_warning: false,
            pause_reason: None,
            started_at: Some(now),
            updated_at: now,
            last_advanced_on: None,
            health: None,
            version: 0,
        }
    }

    /// True once the schedule has been exhausted.
    #[must_use]
    pub fn is_graduated(&self) -> bool {
        self.warmup_day as usize >= self.schedule.len()
    }

    /// Today's send cap, or `None` once graduated.
    #[must_use]
    pub fn daily_limit(&self) -> Option<u32> {
        self.schedule.get(self.warmup_day as usize).copied()
    }

    /// Hours in the send window, at least one.
    #[must_use]
    pub fn window_hours(&self) -> u32 {
        window_hours(self.send_window_start, self.send_window_end)
    }

    /// Per-hour cap: the daily cap spread evenly over the window.
    #[must_use]
    pub fn hourly_limit(&self) -> Option<u32> {
        self.daily_limit()
            .map(|daily| daily.div_ceil(self.window_hours()))
    }

    #[must_use]
    pub fn in_send_window(&self, hour: u32) -> bool {
        in_send_window(hour, self.send_window_start, self.send_window_end)
    }

    /// Status view with `today`'s live counters.
    #[must_use]
    pub fn report(&self, today: DailyCounter) -> WarmupStatusReport {
        WarmupStatusReport {
            domain: self.domain.clone(),
            status: self.status,
            warmup_day: self.warmup_day,
            daily_limit: self.daily_limit().map_or(-1, i64::from),
            schedule_length: self.schedule.len(),
            schedule: self.schedule.clone(),
            send_window_start: self.send_window_start,
            send_window_end: self.send_window_end,
            total_sent: self.total_sent,
            total_bounced: self.total_bounced,
            total_complaints: self.total_complaints,
            total_delivered: self.total_delivered,
            total_opens: self.total_opens,
            bounce_rate: self.bounce_rate,
            complaint_rate: self.complaint_rate,
            open_rate: self.open_rate,
            low_engagement_warning: self.low_engagement_warning,
            max_bounce_rate: self.max_bounce_rate,
            max_complaint_rate: self.max_complaint_rate,
            pause_reason: self.pause_reason.clone(),
            started_at: self.started_at,
            today,
        }
    }
}

/// Parameters for starting a warm-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartWarmup {
    pub workspace_id: WorkspaceId,
    pub domain: String,
    /// Custom daily caps; the default ramp when absent.
    #[serde(default)]
    pub schedule: Option<Vec<u32>>,
    #[serde(default = "default_max_bounce_rate")]
    pub max_bounce_rate: f64,
    #[serde(default = "default_max_complaint_rate")]
    pub max_complaint_rate: f64,
    #[serde(default = "default_send_window_start")]
    pub send_window_start: u8,
    #[serde(default = "default_send_window_end")]
    pub send_window_end: u8,
}

fn default_max_bounce_rate() -> f64 {
    DEFAULT_MAX_BOUNCE_RATE
}

fn default_max_complaint_rate() -> f64 {
    DEFAULT_MAX_COMPLAINT_RATE
}

fn default_send_window_start() -> u8 {
    DEFAULT_SEND_WINDOW_START
}

fn default_send_window_end() -> u8 {
    DEFAULT_SEND_WINDOW_END
}

impl StartWarmup {
    /// A request using the default schedule, window and thresholds.
    #[must_use]
    pub fn new(workspace_id: WorkspaceId, domain: impl Into<String>) -> Self {
        Self {
            workspace_id,
            domain: domain.into(),
            schedule: None,
            max_bounce_rate: DEFAULT_MAX_BOUNCE_RATE,
            max_complaint_rate: DEFAULT_MAX_COMPLAINT_RATE,
            send_window_start: DEFAULT_SEND_WINDOW_START,
            send_window_end: DEFAULT_SEND_WINDOW_END,
        }
    }

    #[must_use]
    pub fn with_schedule(mut self, schedule: Vec<u32>) -> Self {
        self.schedule = Some(schedule);
        self
    }

    #[must_use]
    pub fn with_send_window(mut self, start: u8, end: u8) -> Self {
        self.send_window_start = start;
        self.send_window_end = end;
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, max_bounce_rate: f64, max_complaint_rate: f64) -> Self {
        self.max_bounce_rate = max_bounce_rate;
        self.max_complaint_rate = max_complaint_rate;
        self
    }

    /// The schedule the warm-up will follow.
    #[must_use]
    pub fn schedule(&self) -> Vec<u32> {
        self.schedule
            .clone()
            .unwrap_or_else(|| DEFAULT_WARMUP_SCHEDULE.to_vec())
    }

    /// Checks field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`WarmupError::InvalidRequest`] naming the first bad field.
    pub fn validate(&self) -> Result<(), WarmupError> {
        let invalid = |field: &'static str, message: &str| {
            Err(WarmupError::InvalidRequest {
                field,
                message: message.to_string(),
            })
        };
        if extract_domain(&format!("warmup@{}", self.domain)).is_none() {
            return invalid("domain", "not a valid sending domain");
        }
        if matches!(&self.schedule, Some(schedule) if schedule.is_empty()) {
            return invalid("schedule", "must contain at least one day");
        }
        if !(0.1..=50.0).contains(&self.max_bounce_rate) {
            return invalid("max_bounce_rate", "must be between 0.1 and 50");
        }
        if !(0.01..=5.0).contains(&self.max_complaint_rate) {
            return invalid("max_complaint_rate", "must be between 0.01 and 5");
        }
        if self.send_window_start > 23 {
            return invalid("send_window_start", "must be an hour between 0 and 23");
        }
        if self.send_window_end > 23 {
            return invalid("send_window_end", "must be an hour between 0 and 23");
        }
        if self.send_window_start == self.send_window_end {
            return invalid("send_window_end", "must differ from send_window_start");
        }
        Ok(())
    }
}

/// Warm-up state as reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupStatusReport {
    pub domain: String,
    pub status: WarmupStatus,
    pub warmup_day: u32,
    /// `-1` once the warm-up has graduated.
    pub daily_limit: i64,
    pub schedule_length: usize,
    pub schedule: Vec<u32>,
    pub send_window_start: u8,
    pub send_window_end: u8,
    pub total_sent: u64,
    pub total_bounced: u64,
    pub total_complaints: u64,
    pub total_delivered: u64,
    pub total_opens: u64,
    pub bounce_rate: f64,
    pub complaint_rate: f64,
    pub open_rate: f64,
    pub low_engagement_warning: bool,
    pub max_bounce_rate: f64,
    pub max_complaint_rate: f64,
    pub pause_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub today: DailyCounter,
}

/// Extracts the lower-cased domain from a sender address.
///
/// Accepts bare addresses and the `Display Name <user@domain>` form.
#[must_use]
pub fn extract_domain(sender: &str) -> Option<String> {
    let sender = sender.trim();
    let address = match (sender.rfind('<'), sender.rfind('>')) {
        (Some(open), Some(close)) if open < close => &sender[open + 1..close],
        _ => sender,
    };
    ADDRESS_PATTERN
        .captures(address.trim())
        .and_then(|captures| captures.get(1))
        .map(|domain| domain.as_str().to_lowercase())
}

/// True when `hour` falls in `[start, end)`, wrapping past midnight when
/// `start > end`.
#[must_use]
pub fn in_send_window(hour: u32, start: u8, end: u8) -> bool {
    let (start, end) = (u32::from(start), u32::from(end));
    if start <= end {
        (start..end).contains(&hour)
    } else {
        hour >= start || hour < end
    }
}

#[must_use]
pub fn window_hours(start: u8, end: u8) -> u32 {
    let (start, end) = (u32::from(start), u32::from(end));
    let hours = if start <= end {
        end - start
    } else {
        24 - start + end
    };
    hours.max(1)
}

/// `numerator / denominator` as a percentage rounded to four places.
#[must_use]
pub fn rate_percent(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let rate = numerator as f64 / denominator as f64 * 100.0;
    (rate * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(schedule: Vec<u32>, start: u8, end: u8) -> WarmupDomain {
        let request = StartWarmup::new(WorkspaceId::new(), "Mail.Example.com")
            .with_schedule(schedule)
            .with_send_window(start, end);
        WarmupDomain::start(&request, Utc::now())
    }

    #[test]
    fn extracts_domain_from_display_name_form() {
        assert_eq!(
            extract_domain("Acme Sales <Sales@Mail.Example.COM>").as_deref(),
            Some("mail.example.com")
        );
        assert_eq!(
            extract_domain("ops@example.org").as_deref(),
            Some("example.org")
        );
        assert_eq!(extract_domain("not an address"), None);
        assert_eq!(extract_domain("user@localhost"), None);
    }

    #[test]
    fn window_wraps_past_midnight() {
        assert!(in_send_window(23, 22, 6));
        assert!(in_send_window(3, 22, 6));
        assert!(!in_send_window(6, 22, 6));
        assert!(!in_send_window(12, 22, 6));
        assert_eq!(window_hours(22, 6), 8);

        let inside: Vec<u32> = (0..24).filter(|h| in_send_window(*h, 22, 6)).collect();
        assert_eq!(inside, vec![0, 1, 2, 3, 4, 5, 22, 23]);
        let outside: Vec<u32> = (0..24).filter(|h| !in_send_window(*h, 22, 6)).collect();
        assert_eq!(outside, (6..22).collect::<Vec<_>>());
    }

    #[test]
    fn plain_window_is_half_open() {
        assert!(in_send_window(9, 9, 19));
        assert!(in_send_window(18, 9, 19));
        assert!(!in_send_window(19, 9, 19));
        assert_eq!(window_hours(9, 19), 10);
    }

    #[test]
    fn hourly_limit_rounds_up() {
        let warmup = record(vec![25], 9, 19);
        assert_eq!(warmup.hourly_limit(), Some(3));
    }

    #[test]
    fn zero_daily_limit_gives_zero_hourly_limit() {
        let warmup = record(vec![0, 10], 9, 19);
        assert_eq!(warmup.daily_limit(), Some(0));
        assert_eq!(warmup.hourly_limit(), Some(0));
    }

    #[test]
    fn graduated_record_has_no_limit() {
        let mut warmup = record(vec![10, 20], 9, 19);
        warmup.warmup_day = 2;
        assert!(warmup.is_graduated());
        assert_eq!(warmup.daily_limit(), None);
        assert_eq!(warmup.report(DailyCounter::default()).daily_limit, -1);
    }

    #[test]
    fn start_lowercases_domain_and_uses_default_schedule() {
        let request = StartWarmup::new(WorkspaceId::new(), "Mail.Example.com");
        let warmup = WarmupDomain::start(&request, Utc::now());
        assert_eq!(warmup.domain, "mail.example.com");
        assert_eq!(warmup.schedule.len(), 42);
        assert_eq!(warmup.daily_limit(), Some(10));
    }

    #[test]
    fn validate_rejects_empty_window() {
        let request =
            StartWarmup::new(WorkspaceId::new(), "example.com").with_send_window(9, 9);
        let err = request.validate().unwrap_err();
        assert!(matches!(
            err,
            WarmupError::InvalidRequest {
                field: "send_window_end",
                ..
            }
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_thresholds() {
        let request =
            StartWarmup::new(WorkspaceId::new(), "example.com").with_thresholds(75.0, 0.1);
        assert!(request.validate().is_err());
        let request = StartWarmup::new(WorkspaceId::new(), "example.com").with_schedule(vec![]);
        assert!(request.validate().is_err());
    }

    #[test]
    fn rates_round_to_four_places() {
        assert!((rate_percent(7, 295) - 2.3729).abs() < 1e-9);
        assert!((rate_percent(1, 3) - 33.3333).abs() < 1e-9);
        assert_eq!(rate_percent(5, 0), 0.0);
    }
}
