//! Send-rate governor for domains in warm-up.
//!
//! [`SendRateGovernor::check_limit`] runs before every outbound email. It
//! admits or defers the send against the domain's send window, hourly cap
//! and daily cap, and never blocks traffic because its own store failed.
//! Bounce and complaint events feed an auto-pause check; a daily tick rolls
//! counters into lifetime totals and advances the schedule.

use crate::domain::{
    StartWarmup, WarmupDomain, WarmupStatus, WarmupStatusReport, extract_domain, rate_percent,
};
use crate::error::{CheckerError, StoreError, WarmupError};
use crate::store::{CounterKind, WarmupStore};
use amber_relay_core::{Clock, SystemClock};
use async_trait::async_trait;
use chrono::{NaiveDate, Timelike};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Sends (lifetime plus today) required before rates can trigger a pause.
pub const AUTO_PAUSE_MIN_SAMPLE: u64 = 10;

/// First schedule day on which low engagement is flagged.
pub const LOW_ENGAGEMENT_MIN_DAY: u32 = 7;

/// Deliveries required before low engagement is flagged.
pub const LOW_ENGAGEMENT_MIN_DELIVERED: u64 = 100;

/// Open rate, percent, below which engagement is low.
pub const LOW_ENGAGEMENT_OPEN_RATE: f64 = 5.0;

const MAX_UPDATE_ATTEMPTS: usize = 3;

/// Outcome of a send-limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupCheck {
    pub allowed: bool,
    /// The caller should queue the email for later instead of dropping it.
    pub should_defer: bool,
    pub domain: Option<String>,
    pub remaining: Option<u32>,
    pub daily_limit: Option<u32>,
}

impl WarmupCheck {
    fn passthrough(domain: Option<String>) -> Self {
        Self {
            allowed: true,
            should_defer: false,
            domain,
            remaining: None,
            daily_limit: None,
        }
    }

    fn defer(domain: String, daily_limit: u32) -> Self {
        Self {
            allowed: false,
            should_defer: true,
            domain: Some(domain),
            remaining: Some(0),
            daily_limit: Some(daily_limit),
        }
    }

    fn admit(domain: String, remaining: u32, daily_limit: u32) -> Self {
        Self {
            allowed: true,
            should_defer: false,
            domain: Some(domain),
            remaining: Some(remaining),
            daily_limit: Some(daily_limit),
        }
    }
}

/// Whether a domain can send authenticated mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainAuthStatus {
    pub verified: bool,
    pub dkim_enabled: bool,
}

impl DomainAuthStatus {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.verified && self.dkim_enabled
    }

    fn problems(&self, domain: &str) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.verified {
            problems.push(format!("domain '{domain}' is not verified"));
        }
        if !self.dkim_enabled {
            problems.push(format!("DKIM is not configured for '{domain}'"));
        }
        problems
    }
}

/// Checks SPF/DKIM readiness before a warm-up starts.
#[async_trait]
pub trait DomainAuthChecker: Send + Sync {
    async fn check_auth(&self, domain: &str) -> Result<DomainAuthStatus, CheckerError>;
}

/// Domains touched by one daily tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvanceSummary {
    pub advanced: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

/// Admission control and lifecycle for warming domains.
pub struct SendRateGovernor {
    store: Arc<dyn WarmupStore>,
    clock: Arc<dyn Clock>,
    auth: Option<Arc<dyn DomainAuthChecker>>,
}

impl fmt::Debug for SendRateGovernor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendRateGovernor")
            .field("auth_checker", &self.auth.is_some())
            .finish_non_exhaustive()
    }
}

impl SendRateGovernor {
    #[must_use]
    pub fn new(store: Arc<dyn WarmupStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            auth: None,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Verifies domain authentication on [`start`](Self::start).
    #[must_use]
    pub fn with_auth_checker(mut self, auth: Arc<dyn DomainAuthChecker>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Decides whether `sender` may send one email now.
    ///
    /// Each admitted call consumes one unit of the hourly and daily caps.
    /// Store failures admit the send.
    #[instrument(skip(self), fields(domain))]
    pub async fn check_limit(&self, sender: &str) -> WarmupCheck {
        let Some(domain) = extract_domain(sender) else {
            return WarmupCheck::passthrough(None);
        };
        tracing::Span::current().record("domain", domain.as_str());

        let warmup = match self.store.get(&domain).await {
            Ok(Some(warmup)) if warmup.status == WarmupStatus::Active => warmup,
            Ok(_) => return WarmupCheck::passthrough(Some(domain)),
            Err(error) => {
                warn!(%domain, %error, "warm-up lookup failed, failing open");
                return WarmupCheck::passthrough(Some(domain));
            }
        };
        let (Some(daily_limit), Some(hourly_limit)) = (warmup.daily_limit(), warmup.hourly_limit())
        else {
            return WarmupCheck::passthrough(Some(domain));
        };

        let now = self.clock.now();
        let hour = now.hour();
        let today = now.date_naive();
        if !warmup.in_send_window(hour) {
            debug!(%domain, hour, "outside send window");
            return WarmupCheck::defer(domain, daily_limit);
        }

        let hourly = match self.store.increment_hourly_send(&domain, today, hour).await {
            Ok(count) => count,
            Err(error) => {
                warn!(%domain, %error, "hourly counter increment failed, failing open");
                return WarmupCheck::passthrough(Some(domain));
            }
        };
        if hourly > u64::from(hourly_limit) {
            debug!(%domain, hourly, hourly_limit, "hourly cap reached");
            return WarmupCheck::defer(domain, daily_limit);
        }

        let daily = match self.store.increment_daily(&domain, today, CounterKind::Send).await {
            Ok(count) => count,
            Err(error) => {
                warn!(%domain, %error, "daily counter increment failed, failing open");
                return WarmupCheck::passthrough(Some(domain));
            }
        };
        match u32::try_from(daily) {
            Ok(daily) if daily <= daily_limit => {
                WarmupCheck::admit(domain, daily_limit - daily, daily_limit)
            }
            _ => {
                debug!(%domain, daily, daily_limit, "daily cap reached");
                WarmupCheck::defer(domain, daily_limit)
            }
        }
    }

    /// Starts a warm-up on day zero.
    ///
    /// A pending record for the domain is replaced. An auth checker that
    /// errors does not block the start.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid, the domain is not ready,
    /// a non-pending warm-up exists, or the store fails.
    #[instrument(skip(self, request), fields(domain = %request.domain))]
    pub async fn start(&self, request: StartWarmup) -> Result<WarmupDomain, Report<WarmupError>> {
        request.validate()?;
        let domain = request.domain.to_lowercase();

        if let Some(auth) = &self.auth {
            match auth.check_auth(&domain).await {
                Ok(status) if !status.is_ready() => {
                    return Err(WarmupError::DomainNotReady {
                        reasons: status.problems(&domain),
                        domain,
                    }
                    .into());
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(%domain, %error, "domain auth check failed, proceeding with warm-up");
                }
            }
        }

        if let Some(existing) = self.store.get(&domain).await.map_err(WarmupError::from)? {
            if existing.status != WarmupStatus::Pending {
                return Err(WarmupError::AlreadyExists { domain }.into());
            }
            self.store.delete(&domain).await.map_err(WarmupError::from)?;
        }

        let warmup = WarmupDomain::start(&request, self.clock.now());
        self.store.create(&warmup).await.map_err(WarmupError::from)?;
        info!(
            %domain,
            workspace_id = %warmup.workspace_id,
            schedule_length = warmup.schedule.len(),
            daily_limit = ?warmup.daily_limit(),
            send_window_start = warmup.send_window_start,
            send_window_end = warmup.send_window_end,
            "warm-up started"
        );
        Ok(warmup)
    }

    /// Pauses an active warm-up.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no warm-up, it is not active, or the
    /// store fails.
    #[instrument(skip(self))]
    pub async fn pause(&self, domain: &str, reason: &str) -> Result<WarmupDomain, Report<WarmupError>> {
        let warmup = self
            .modify(domain, |warmup| {
                expect_status(warmup, WarmupStatus::Active)?;
                warmup.status = WarmupStatus::Paused;
                warmup.pause_reason = Some(reason.to_string());
                Ok(())
            })
            .await?;
        info!(%domain, reason, "warm-up paused");
        Ok(warmup)
    }

    /// Resumes a paused warm-up.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no warm-up, it is not paused, or the
    /// store fails.
    #[instrument(skip(self))]
    pub async fn resume(&self, domain: &str) -> Result<WarmupDomain, Report<WarmupError>> {
        let warmup = self
            .modify(domain, |warmup| {
                expect_status(warmup, WarmupStatus::Paused)?;
                warmup.status = WarmupStatus::Active;
                warmup.pause_reason = None;
                Ok(())
            })
            .await?;
        info!(%domain, "warm-up resumed");
        Ok(warmup)
    }

    /// Deletes a warm-up. Returns false if there was none.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    #[instrument(skip(self))]
    pub async fn cancel(&self, domain: &str) -> Result<bool, Report<WarmupError>> {
        let deleted = self.store.delete(domain).await.map_err(WarmupError::from)?;
        if deleted {
            info!(%domain, "warm-up cancelled");
        }
        Ok(deleted)
    }

    /// Current state plus today's counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn status(&self, domain: &str) -> Result<Option<WarmupStatusReport>, Report<WarmupError>> {
        let Some(warmup) = self.store.get(domain).await.map_err(WarmupError::from)? else {
            return Ok(None);
        };
        let today = self
            .store
            .daily_counter(domain, self.clock.now().date_naive())
            .await
            .map_err(WarmupError::from)?;
        Ok(Some(warmup.report(today)))
    }

    /// Counts a bounce. Returns true if it caused an auto-pause.
    pub async fn record_bounce(&self, domain: &str) -> bool {
        self.record_event(domain, CounterKind::Bounce).await && self.check_thresholds(domain).await
    }

    /// Counts a complaint. Returns true if it caused an auto-pause.
    pub async fn record_complaint(&self, domain: &str) -> bool {
        self.record_event(domain, CounterKind::Complaint).await && self.check_thresholds(domain).await
    }

    pub async fn record_delivery(&self, domain: &str) {
        self.record_event(domain, CounterKind::Delivery).await;
    }

    pub async fn record_open(&self, domain: &str) {
        self.record_event(domain, CounterKind::Open).await;
    }

    pub async fn record_click(&self, domain: &str) {
        self.record_event(domain, CounterKind::Click).await;
    }

    pub async fn record_reply(&self, domain: &str) {
        self.record_event(domain, CounterKind::Reply).await;
    }

    async fn record_event(&self, domain: &str, kind: CounterKind) -> bool {
        let today = self.clock.now().date_naive();
        match self.store.increment_daily(domain, today, kind).await {
            Ok(_) => true,
            Err(error) => {
                warn!(%domain, ?kind, %error, "failed to increment warm-up counter");
                false
            }
        }
    }

    async fn check_thresholds(&self, domain: &str) -> bool {
        let warmup = match self.store.get(domain).await {
            Ok(Some(warmup)) if warmup.status == WarmupStatus::Active => warmup,
            Ok(_) => return false,
            Err(error) => {
                warn!(%domain, %error, "warm-up lookup failed during threshold check");
                return false;
            }
        };
        let today = match self.store.daily_counter(domain, self.clock.now().date_naive()).await {
            Ok(counter) => counter,
            Err(error) => {
                warn!(%domain, %error, "counter read failed during threshold check");
                return false;
            }
        };
        if today.send_count == 0 || warmup.total_sent + today.send_count < AUTO_PAUSE_MIN_SAMPLE {
            return false;
        }

        let bounce_rate = rate_percent(today.bounce_count, today.send_count);
        let complaint_rate = rate_percent(today.complaint_count, today.send_count);
        let mut breaches = Vec::new();
        if bounce_rate > warmup.max_bounce_rate {
            breaches.push(format!("bounce_rate={bounce_rate:.2}% > {}%", warmup.max_bounce_rate));
        }
        if complaint_rate > warmup.max_complaint_rate {
            breaches.push(format!(
                "complaint_rate={complaint_rate:.4}% > {}%",
                warmup.max_complaint_rate
            ));
        }
        if breaches.is_empty() {
            return false;
        }

        warn!(
            %domain,
            bounce_rate,
            complaint_rate,
            send_count = today.send_count,
            "warm-up reputation threshold breached"
        );
        let reason = format!("auto-pause: {}", breaches.join(", "));
        match self.pause(domain, &reason).await {
            Ok(_) => true,
            Err(error) => {
                warn!(%domain, %error, "auto-pause failed");
                false
            }
        }
    }

    /// Rolls `date`'s counters into the lifetime totals and moves to the
    /// next schedule day.
    ///
    /// Returns `None` when there is no active warm-up or `date` was already
    /// rolled.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    #[instrument(skip(self))]
    pub async fn advance_day(
        &self,
        domain: &str,
        date: NaiveDate,
    ) -> Result<Option<WarmupDomain>, Report<WarmupError>> {
        match self.store.get(domain).await.map_err(WarmupError::from)? {
            Some(warmup)
                if warmup.status == WarmupStatus::Active
                    && warmup.last_advanced_on.is_none_or(|last| last < date) => {}
            _ => return Ok(None),
        }
        let counter = self
            .store
            .daily_counter(domain, date)
            .await
            .map_err(WarmupError::from)?;

        let warmup = self
            .modify(domain, |warmup| {
                expect_status(warmup, WarmupStatus::Active)?;
                warmup.total_sent += counter.send_count;
                warmup.total_bounced += counter.bounce_count;
                warmup.total_complaints += counter.complaint_count;
                warmup.total_delivered += counter.delivery_count;
                warmup.total_opens += counter.open_count;
                warmup.total_clicks += counter.click_count;
                warmup.total_replies += counter.reply_count;
                warmup.bounce_rate = rate_percent(warmup.total_bounced, warmup.total_sent);
                warmup.complaint_rate = rate_percent(warmup.total_complaints, warmup.total_sent);
                if warmup.total_delivered > 0 {
                    warmup.open_rate = rate_percent(warmup.total_opens, warmup.total_delivered);
                }
                warmup.low_engagement_warning = warmup.warmup_day >= LOW_ENGAGEMENT_MIN_DAY
                    && warmup.total_delivered >= LOW_ENGAGEMENT_MIN_DELIVERED
                    && warmup.open_rate < LOW_ENGAGEMENT_OPEN_RATE;
                warmup.warmup_day += 1;
                if warmup.is_graduated() {
                    warmup.status = WarmupStatus::Completed;
                }
                warmup.last_advanced_on = Some(date);
                Ok(())
            })
            .await?;

        if warmup.status == WarmupStatus::Completed {
            info!(%domain, total_sent = warmup.total_sent, "warm-up completed");
        } else {
            info!(
                %domain,
                warmup_day = warmup.warmup_day,
                daily_limit = ?warmup.daily_limit(),
                open_rate = warmup.open_rate,
                low_engagement = warmup.low_engagement_warning,
                "warm-up day advanced"
            );
        }
        Ok(Some(warmup))
    }

    /// Advances every active warm-up. One domain's failure does not stop
    /// the others.
    ///
    /// # Errors
    ///
    /// Returns an error only if the active domains cannot be listed.
    #[instrument(skip(self))]
    pub async fn advance_all(&self, date: NaiveDate) -> Result<AdvanceSummary, Report<WarmupError>> {
        let active = self.store.list_active().await.map_err(WarmupError::from)?;
        let mut summary = AdvanceSummary::default();
        for warmup in active {
            match self.advance_day(&warmup.domain, date).await {
                Ok(Some(advanced)) if advanced.status == WarmupStatus::Completed => {
                    summary.completed.push(advanced.domain);
                }
                Ok(Some(advanced)) => summary.advanced.push(advanced.domain),
                Ok(None) => {}
                Err(error) => {
                    warn!(domain = %warmup.domain, %error, "failed to advance warm-up day");
                    summary.failed.push(warmup.domain);
                }
            }
        }
        info!(
            advanced = summary.advanced.len(),
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            "daily warm-up tick finished"
        );
        Ok(summary)
    }

    /// Applies `change` to the stored record with a version check,
    /// re-reading and retrying on conflict.
    async fn modify<F>(&self, domain: &str, mut change: F) -> Result<WarmupDomain, Report<WarmupError>>
    where
        F: FnMut(&mut WarmupDomain) -> Result<(), WarmupError> + Send,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let mut warmup = self
                .store
                .get(domain)
                .await
                .map_err(WarmupError::from)?
                .ok_or_else(|| WarmupError::NotFound {
                    domain: domain.to_string(),
                })?;
            change(&mut warmup)?;
            match self.store.update(&warmup).await {
                Ok(updated) => return Ok(updated),
                Err(StoreError::Conflict { .. }) => {
                    debug!(%domain, attempt, "warm-up record changed concurrently, retrying");
                }
                Err(error) => return Err(WarmupError::from(error).into()),
            }
        }
        Err(WarmupError::Store(StoreError::Conflict {
            domain: domain.to_string(),
        })
        .into())
    }
}

fn expect_status(warmup: &WarmupDomain, expected: WarmupStatus) -> Result<(), WarmupError> {
    if warmup.status == expected {
        Ok(())
    } else {
        Err(WarmupError::InvalidState {
            domain: warmup.domain.clone(),
            status: warmup.status,
            expected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryWarmupStore, StaticAuthChecker};
    use amber_relay_core::{ManualClock, WorkspaceId};
    use chrono::{DateTime, TimeZone, Utc};

    const DOMAIN: &str = "mail.example.com";

    struct Harness {
        store: InMemoryWarmupStore,
        clock: ManualClock,
        governor: SendRateGovernor,
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(at(12));
        let store = InMemoryWarmupStore::new().with_clock(Arc::new(clock.clone()));
        let governor =
            SendRateGovernor::new(Arc::new(store.clone())).with_clock(Arc::new(clock.clone()));
        Harness {
            store,
            clock,
            governor,
        }
    }

    fn request() -> StartWarmup {
        StartWarmup::new(WorkspaceId::new(), DOMAIN)
    }

    impl Harness {
        fn today(&self) -> NaiveDate {
            self.clock.now().date_naive()
        }

        async fn preload(&self, kind: CounterKind, count: u64) {
            for _ in 0..count {
                self.store
                    .increment_daily(DOMAIN, self.today(), kind)
                    .await
                    .unwrap();
            }
        }

        async fn stored(&self) -> WarmupDomain {
            self.store.get(DOMAIN).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn fifth_send_of_day_zero_leaves_five() {
        let h = harness();
        h.governor.start(request()).await.unwrap();
        h.preload(CounterKind::Send, 4).await;

        let check = h.governor.check_limit(&format!("Acme <news@{DOMAIN}>")).await;

        assert!(check.allowed);
        assert!(!check.should_defer);
        assert_eq!(check.domain.as_deref(), Some(DOMAIN));
        assert_eq!(check.remaining, Some(5));
        assert_eq!(check.daily_limit, Some(10));
    }

    #[tokio::test]
    async fn send_past_daily_cap_is_deferred() {
        let h = harness();
        h.governor.start(request()).await.unwrap();
        h.preload(CounterKind::Send, 10).await;

        let check = h.governor.check_limit(&format!("news@{DOMAIN}")).await;

        assert!(!check.allowed);
        assert!(check.should_defer);
        assert_eq!(check.remaining, Some(0));
    }

    #[tokio::test]
    async fn hourly_cap_spreads_daily_limit_over_window() {
        let h = harness();
        // 10 per day over a 10 hour window: one per hour.
        h.governor.start(request()).await.unwrap();

        assert!(h.governor.check_limit(&format!("a@{DOMAIN}")).await.allowed);
        let second = h.governor.check_limit(&format!("b@{DOMAIN}")).await;
        assert!(!second.allowed);
        assert!(second.should_defer);

        h.clock.set(at(13));
        assert!(h.governor.check_limit(&format!("c@{DOMAIN}")).await.allowed);
    }

    #[tokio::test]
    async fn outside_window_defers_without_counting() {
        let h = harness();
        h.governor.start(request()).await.unwrap();
        h.clock.set(at(20));

        let check = h.governor.check_limit(&format!("news@{DOMAIN}")).await;

        assert!(!check.allowed);
        assert!(check.should_defer);
        assert_eq!(h.store.hourly_counter_count(), 0);
        let today = h.store.daily_counter(DOMAIN, h.today()).await.unwrap();
        assert_eq!(today.send_count, 0);
    }

    #[tokio::test]
    async fn window_crossing_midnight_admits_late_sends() {
        let h = harness();
        h.governor
            .start(request().with_send_window(22, 6))
            .await
            .unwrap();

        h.clock.set(at(23));
        assert!(h.governor.check_limit(&format!("news@{DOMAIN}")).await.allowed);
        h.clock.set(at(12));
        assert!(!h.governor.check_limit(&format!("news@{DOMAIN}")).await.allowed);
    }

    #[tokio::test]
    async fn wrapped_window_admits_exactly_its_hours() {
        let h = harness();
        // 800 per day over 8 hours leaves 100 per hour, so only the window decides.
        h.governor
            .start(request().with_schedule(vec![800]).with_send_window(22, 6))
            .await
            .unwrap();

        let mut admitted = Vec::new();
        let mut deferred = Vec::new();
        for hour in 0..24 {
            h.clock.set(at(hour));
            let check = h.governor.check_limit(&format!("news@{DOMAIN}")).await;
            assert_eq!(check.should_defer, !check.allowed, "hour {hour}");
            if check.allowed {
                admitted.push(hour);
            } else {
                deferred.push(hour);
            }
        }

        assert_eq!(admitted, vec![0, 1, 2, 3, 4, 5, 22, 23]);
        assert_eq!(deferred, (6..22).collect::<Vec<_>>());
        let today = h.store.daily_counter(DOMAIN, h.today()).await.unwrap();
        assert_eq!(today.send_count, 8);
    }

    #[tokio::test]
    async fn zero_daily_limit_denies() {
        let h = harness();
        h.governor
            .start(request().with_schedule(vec![0, 10]))
            .await
            .unwrap();

        let check = h.governor.check_limit(&format!("news@{DOMAIN}")).await;

        assert!(!check.allowed);
        assert!(check.should_defer);
        assert_eq!(check.daily_limit, Some(0));
    }

    #[tokio::test]
    async fn unknown_paused_and_graduated_domains_pass_through() {
        let h = harness();
        let check = h.governor.check_limit("news@other.example.org").await;
        assert!(check.allowed);
        assert_eq!(check.daily_limit, None);

        h.governor.start(request().with_schedule(vec![1])).await.unwrap();
        h.governor.pause(DOMAIN, "manual").await.unwrap();
        assert!(h.governor.check_limit(&format!("news@{DOMAIN}")).await.allowed);

        let mut graduated = h.stored().await;
        graduated.status = WarmupStatus::Active;
        graduated.warmup_day = 1;
        h.store.update(&graduated).await.unwrap();
        let check = h.governor.check_limit(&format!("news@{DOMAIN}")).await;
        assert!(check.allowed);
        assert_eq!(check.remaining, None);
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let h = harness();
        h.governor.start(request()).await.unwrap();
        h.preload(CounterKind::Send, 10).await;
        h.store.set_unavailable(true);

        let check = h.governor.check_limit(&format!("news@{DOMAIN}")).await;

        assert!(check.allowed);
        assert!(!check.should_defer);
    }

    #[tokio::test]
    async fn unparseable_sender_passes_through() {
        let h = harness();
        let check = h.governor.check_limit("no-reply").await;
        assert!(check.allowed);
        assert_eq!(check.domain, None);
    }

    #[tokio::test]
    async fn start_rejects_unready_domain() {
        let h = harness();
        let governor = SendRateGovernor::new(Arc::new(h.store.clone()))
            .with_auth_checker(Arc::new(StaticAuthChecker::new(DomainAuthStatus {
                verified: true,
                dkim_enabled: false,
            })));

        let err = governor.start(request()).await.unwrap_err();

        assert!(err.to_string().contains("DKIM is not configured"));
        assert!(h.store.get(DOMAIN).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn start_proceeds_when_auth_check_errors() {
        let h = harness();
        let governor = SendRateGovernor::new(Arc::new(h.store.clone()))
            .with_auth_checker(Arc::new(StaticAuthChecker::failing()));

        let warmup = governor.start(request()).await.unwrap();

        assert_eq!(warmup.status, WarmupStatus::Active);
    }

    #[tokio::test]
    async fn start_replaces_pending_but_not_active() {
        let h = harness();
        let mut pending = WarmupDomain::start(&request(), at(8));
        pending.status = WarmupStatus::Pending;
        h.store.create(&pending).await.unwrap();

        let started = h.governor.start(request()).await.unwrap();
        assert_eq!(started.status, WarmupStatus::Active);

        let err = h.governor.start(request()).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn resume_requires_paused() {
        let h = harness();
        h.governor.start(request()).await.unwrap();

        let err = h.governor.resume(DOMAIN).await.unwrap_err();
        assert!(err.to_string().contains("expected paused"));

        h.governor.pause(DOMAIN, "manual").await.unwrap();
        let resumed = h.governor.resume(DOMAIN).await.unwrap();
        assert_eq!(resumed.status, WarmupStatus::Active);
        assert_eq!(resumed.pause_reason, None);
    }

    #[tokio::test]
    async fn cancel_deletes_the_record() {
        let h = harness();
        h.governor.start(request()).await.unwrap();

        assert!(h.governor.cancel(DOMAIN).await.unwrap());
        assert!(!h.governor.cancel(DOMAIN).await.unwrap());
        assert!(h.governor.status(DOMAIN).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn high_bounce_rate_pauses() {
        let h = harness();
        h.governor.start(request()).await.unwrap();
        h.preload(CounterKind::Send, 100).await;

        let mut paused_at = None;
        for bounce in 1..=10 {
            if h.governor.record_bounce(DOMAIN).await {
                paused_at = Some(bounce);
                break;
            }
        }

        assert_eq!(paused_at, Some(6));
        let warmup = h.stored().await;
        assert_eq!(warmup.status, WarmupStatus::Paused);
        let reason = warmup.pause_reason.unwrap();
        assert!(reason.starts_with("auto-pause: bounce_rate=6.00%"), "{reason}");
    }

    #[tokio::test]
    async fn small_sample_never_pauses() {
        let h = harness();
        h.governor.start(request()).await.unwrap();
        h.preload(CounterKind::Send, 5).await;

        for _ in 0..5 {
            assert!(!h.governor.record_bounce(DOMAIN).await);
        }
        assert_eq!(h.stored().await.status, WarmupStatus::Active);
    }

    #[tokio::test]
    async fn complaints_pause_on_their_own_threshold() {
        let h = harness();
        h.governor.start(request()).await.unwrap();
        h.preload(CounterKind::Send, 200).await;

        assert!(h.governor.record_complaint(DOMAIN).await);
        let reason = h.stored().await.pause_reason.unwrap();
        assert!(reason.contains("complaint_rate=0.5000%"), "{reason}");
    }

    #[tokio::test]
    async fn status_reports_todays_counters() {
        let h = harness();
        h.governor.start(request()).await.unwrap();
        h.preload(CounterKind::Send, 3).await;
        h.governor.record_delivery(DOMAIN).await;
        h.governor.record_open(DOMAIN).await;

        let report = h.governor.status(DOMAIN).await.unwrap().unwrap();

        assert_eq!(report.daily_limit, 10);
        assert_eq!(report.schedule_length, 42);
        assert_eq!(report.today.send_count, 3);
        assert_eq!(report.today.delivery_count, 1);
        assert_eq!(report.today.open_count, 1);
    }

    #[tokio::test]
    async fn advance_day_rolls_counters_once() {
        let h = harness();
        h.governor.start(request()).await.unwrap();
        h.preload(CounterKind::Send, 8).await;
        h.preload(CounterKind::Bounce, 1).await;
        h.preload(CounterKind::Delivery, 7).await;
        h.preload(CounterKind::Open, 2).await;

        let warmup = h
            .governor
            .advance_day(DOMAIN, h.today())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(warmup.warmup_day, 1);
        assert_eq!(warmup.daily_limit(), Some(15));
        assert_eq!(warmup.total_sent, 8);
        assert!((warmup.bounce_rate - 12.5).abs() < 1e-9);
        assert!((warmup.open_rate - 28.5714).abs() < 1e-9);

        assert!(h.governor.advance_day(DOMAIN, h.today()).await.unwrap().is_none());
        assert_eq!(h.stored().await.warmup_day, 1);
    }

    #[tokio::test]
    async fn low_open_rate_after_first_week_warns() {
        let h = harness();
        h.governor.start(request()).await.unwrap();
        let mut warmup = h.stored().await;
        warmup.warmup_day = 7;
        h.store.update(&warmup).await.unwrap();
        h.preload(CounterKind::Send, 300).await;
        h.preload(CounterKind::Delivery, 295).await;
        h.preload(CounterKind::Open, 7).await;

        let warmup = h
            .governor
            .advance_day(DOMAIN, h.today())
            .await
            .unwrap()
            .unwrap();

        assert!((warmup.open_rate - 2.3729).abs() < 1e-9);
        assert!(warmup.low_engagement_warning);
        assert_eq!(warmup.warmup_day, 8);
    }

    #[tokio::test]
    async fn final_day_completes() {
        let h = harness();
        h.governor
            .start(request().with_schedule(vec![10, 20]))
            .await
            .unwrap();

        let day = h.today();
        h.governor.advance_day(DOMAIN, day).await.unwrap();
        let warmup = h
            .governor
            .advance_day(DOMAIN, day.succ_opt().unwrap())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(warmup.status, WarmupStatus::Completed);
        assert!(h.governor.check_limit(&format!("news@{DOMAIN}")).await.allowed);
    }

    #[tokio::test]
    async fn advance_all_skips_paused_domains() {
        let h = harness();
        h.governor.start(request()).await.unwrap();
        h.governor
            .start(StartWarmup::new(WorkspaceId::new(), "paused.example.com"))
            .await
            .unwrap();
        h.governor
            .start(StartWarmup::new(WorkspaceId::new(), "short.example.com").with_schedule(vec![5]))
            .await
            .unwrap();
        h.governor.pause("paused.example.com", "manual").await.unwrap();

        let summary = h.governor.advance_all(h.today()).await.unwrap();

        assert_eq!(summary.advanced, vec![DOMAIN.to_string()]);
        assert_eq!(summary.completed, vec!["short.example.com".to_string()]);
        assert!(summary.failed.is_empty());
        let paused = h.store.get("paused.example.com").await.unwrap().unwrap();
        assert_eq!(paused.warmup_day, 0);
    }
}
