//! Domain health scoring.
//!
//! A 0–100 score combines DNS authentication, blacklist listings and the
//! warm-up's engagement rates. DNS lookups are slow, so results are cached
//! on the warm-up record.

use crate::domain::WarmupStatus;
use crate::error::{CheckerError, HealthError, StoreError};
use crate::store::WarmupStore;
use amber_relay_core::{Clock, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// How long a cached health result is served.
pub const HEALTH_CACHE_TTL: Duration = Duration::minutes(5);

/// Signals that feed the health score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthInputs {
    pub spf_valid: bool,
    pub dkim_enabled: bool,
    pub dmarc_valid: bool,
    pub dmarc_policy: Option<String>,
    pub blacklist_count: u32,
    /// Percent.
    pub bounce_rate: f64,
    /// Percent.
    pub complaint_rate: f64,
    /// Percent.
    pub open_rate: f64,
}

/// Scores a domain, returning the total and its per-signal breakdown.
#[must_use]
pub fn compute_health_score(inputs: &HealthInputs) -> (u8, BTreeMap<String, u8>) {
    let enforcing = matches!(inputs.dmarc_policy.as_deref(), Some("quarantine" | "reject"));
    let blacklist = 20u32.saturating_sub(inputs.blacklist_count.saturating_mul(10));

    let bounce = if inputs.bounce_rate < 2.0 {
        15
    } else if inputs.bounce_rate < 5.0 {
        10
    } else {
        0
    };
    let complaint = if inputs.complaint_rate < 0.05 {
        10
    } else if inputs.complaint_rate < 0.1 {
        5
    } else {
        0
    };
    let open_rate = if inputs.open_rate > 20.0 {
        10
    } else if inputs.open_rate > 10.0 {
        5
    } else {
        0
    };

    let breakdown: BTreeMap<String, u8> = [
        ("spf", if inputs.spf_valid { 15 } else { 0 }),
        ("dkim", if inputs.dkim_enabled { 15 } else { 0 }),
        ("dmarc", if inputs.dmarc_valid { 10 } else { 0 }),
        ("dmarc_enforce", if enforcing { 5 } else { 0 }),
        ("blacklist", u8::try_from(blacklist).unwrap_or(0)),
        ("bounce", bounce),
        ("complaint", complaint),
        ("open_rate", open_rate),
    ]
    .into_iter()
    .map(|(name, points)| (name.to_string(), points))
    .collect();
    let total = breakdown.values().sum();
    (total, breakdown)
}

/// Coarse health bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Good,
    Warning,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Good => "good",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

#[must_use]
pub fn score_to_status(score: u8) -> HealthStatus {
    match score {
        80.. => HealthStatus::Good,
        50..=79 => HealthStatus::Warning,
        _ => HealthStatus::Critical,
    }
}

/// What DNS and blacklist lookups found for a domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsHealth {
    pub spf_valid: bool,
    pub spf_record: Option<String>,
    pub dkim_enabled: bool,
    pub dmarc_valid: bool,
    pub dmarc_record: Option<String>,
    pub dmarc_policy: Option<String>,
    pub mx_valid: bool,
    pub mx_hosts: Vec<String>,
    pub blacklist_listings: Vec<String>,
    /// Sub-checks that failed; the result is partial when non-empty.
    pub errors: Vec<String>,
}

/// Looks up DNS authentication and blacklist state.
#[async_trait]
pub trait DnsHealthChecker: Send + Sync {
    async fn check(&self, domain: &str) -> Result<DnsHealth, CheckerError>;
}

/// A health result stored on the warm-up record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedHealth {
    pub score: u8,
    pub status: HealthStatus,
    pub breakdown: BTreeMap<String, u8>,
    pub dns: DnsHealth,
    pub checked_at: DateTime<Utc>,
}

/// Health of one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainHealthReport {
    pub domain: String,
    pub score: u8,
    pub status: HealthStatus,
    pub breakdown: BTreeMap<String, u8>,
    pub dns: DnsHealth,
    pub bounce_rate: f64,
    pub complaint_rate: f64,
    pub open_rate: f64,
    pub checked_at: DateTime<Utc>,
    /// Served from the record's cache.
    pub cached: bool,
}

/// Computes domain health, caching results on warm-up records.
pub struct HealthService {
    store: Arc<dyn WarmupStore>,
    checker: Arc<dyn DnsHealthChecker>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for HealthService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthService").finish_non_exhaustive()
    }
}

impl HealthService {
    #[must_use]
    pub fn new(store: Arc<dyn WarmupStore>, checker: Arc<dyn DnsHealthChecker>) -> Self {
        Self {
            store,
            checker,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Scores `domain`.
    ///
    /// Engagement rates come from the warm-up record when there is one. A
    /// failed DNS lookup scores the authentication signals as absent and is
    /// listed in `dns.errors`.
    ///
    /// # Errors
    ///
    /// Returns an error if the warm-up record cannot be read.
    #[instrument(skip(self))]
    pub async fn check(&self, domain: &str) -> Result<DomainHealthReport, Report<HealthError>> {
        let now = self.clock.now();
        let warmup = self.store.get(domain).await.map_err(HealthError::from)?;

        if let Some(cached) = warmup.as_ref().and_then(|w| w.health.as_ref().map(|h| (w, h))) {
            let (warmup, health) = cached;
            if now - health.checked_at < HEALTH_CACHE_TTL {
                debug!(%domain, "serving cached health");
                return Ok(DomainHealthReport {
                    domain: domain.to_string(),
                    score: health.score,
                    status: health.status,
                    breakdown: health.breakdown.clone(),
                    dns: health.dns.clone(),
                    bounce_rate: warmup.bounce_rate,
                    complaint_rate: warmup.complaint_rate,
                    open_rate: warmup.open_rate,
                    checked_at: health.checked_at,
                    cached: true,
                });
            }
        }

        let dns = match self.checker.check(domain).await {
            Ok(dns) => dns,
            Err(error) => {
                warn!(%domain, %error, "DNS health check failed");
                DnsHealth {
                    errors: vec![error.to_string()],
                    ..DnsHealth::default()
                }
            }
        };
        let (bounce_rate, complaint_rate, open_rate) = warmup
            .as_ref()
            .map_or((0.0, 0.0, 0.0), |w| (w.bounce_rate, w.complaint_rate, w.open_rate));
        let (score, breakdown) = compute_health_score(&HealthInputs {
            spf_valid: dns.spf_valid,
            dkim_enabled: dns.dkim_enabled,
            dmarc_valid: dns.dmarc_valid,
            dmarc_policy: dns.dmarc_policy.clone(),
            blacklist_count: u32::try_from(dns.blacklist_listings.len()).unwrap_or(u32::MAX),
            bounce_rate,
            complaint_rate,
            open_rate,
        });
        let status = score_to_status(score);

        if let Some(mut warmup) = warmup.filter(|w| w.status != WarmupStatus::Cancelled) {
            warmup.health = Some(CachedHealth {
                score,
                status,
                breakdown: breakdown.clone(),
                dns: dns.clone(),
                checked_at: now,
            });
            match self.store.update(&warmup).await {
                Ok(_) | Err(StoreError::Conflict { .. }) => {}
                Err(error) => warn!(%domain, %error, "failed to cache health result"),
            }
        }

        Ok(DomainHealthReport {
            domain: domain.to_string(),
            score,
            status,
            breakdown,
            dns,
            bounce_rate,
            complaint_rate,
            open_rate,
            checked_at: now,
            cached: false,
        })
    }
}

impl HealthService {
    /// Scores every active warm-up. A domain that cannot be scored is
    /// logged and left out.
    ///
    /// # Errors
    ///
    /// Returns an error if the active warm-ups cannot be listed.
    #[instrument(skip(self))]
    pub async fn check_active(&self) -> Result<Vec<DomainHealthReport>, Report<HealthError>> {
        let active = self.store.list_active().await.map_err(HealthError::from)?;
        let mut reports = Vec::with_capacity(active.len());
        for warmup in active {
            match self.check(&warmup.domain).await {
                Ok(report) => reports.push(report),
                Err(error) => warn!(domain = %warmup.domain, %error, "health check skipped"),
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{StartWarmup, WarmupDomain};
    use crate::memory::{InMemoryWarmupStore, StaticDnsChecker};
    use amber_relay_core::{ManualClock, WorkspaceId};
    use chrono::TimeZone;

    fn healthy_dns() -> DnsHealth {
        DnsHealth {
            spf_valid: true,
            spf_record: Some("v=spf1 include:amazonses.com ~all".to_string()),
            dkim_enabled: true,
            dmarc_valid: true,
            dmarc_record: Some("v=DMARC1; p=reject".to_string()),
            dmarc_policy: Some("reject".to_string()),
            mx_valid: true,
            mx_hosts: vec!["mx1.example.com".to_string()],
            ..DnsHealth::default()
        }
    }

    #[test]
    fn perfect_domain_scores_one_hundred() {
        let (score, breakdown) = compute_health_score(&HealthInputs {
            spf_valid: true,
            dkim_enabled: true,
            dmarc_valid: true,
            dmarc_policy: Some("quarantine".to_string()),
            blacklist_count: 0,
            bounce_rate: 0.5,
            complaint_rate: 0.01,
            open_rate: 25.0,
        });
        assert_eq!(score, 100);
        assert_eq!(breakdown["dmarc_enforce"], 5);
    }

    #[test]
    fn listings_and_poor_rates_lower_the_score() {
        let (score, breakdown) = compute_health_score(&HealthInputs {
            spf_valid: true,
            dkim_enabled: true,
            dmarc_valid: true,
            dmarc_policy: Some("none".to_string()),
            blacklist_count: 3,
            bounce_rate: 3.0,
            complaint_rate: 0.07,
            open_rate: 12.0,
        });
        assert_eq!(breakdown["blacklist"], 0);
        assert_eq!(breakdown["dmarc_enforce"], 0);
        assert_eq!(breakdown["bounce"], 10);
        assert_eq!(breakdown["complaint"], 5);
        assert_eq!(breakdown["open_rate"], 5);
        assert_eq!(score, 60);
        assert_eq!(score_to_status(score), HealthStatus::Warning);
    }

    #[test]
    fn status_thresholds() {
        assert_eq!(score_to_status(80), HealthStatus::Good);
        assert_eq!(score_to_status(50), HealthStatus::Warning);
        assert_eq!(score_to_status(49), HealthStatus::Critical);
    }

    #[tokio::test]
    async fn results_are_cached_for_five_minutes() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let store = InMemoryWarmupStore::new().with_clock(Arc::new(clock.clone()));
        let warmup = WarmupDomain::start(&StartWarmup::new(WorkspaceId::new(), "example.com"), clock.now());
        store.create(&warmup).await.unwrap();
        let checker = StaticDnsChecker::new(healthy_dns());
        let service = HealthService::new(Arc::new(store.clone()), Arc::new(checker.clone()))
            .with_clock(Arc::new(clock.clone()));

        let first = service.check("example.com").await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.status, HealthStatus::Good);

        clock.advance(Duration::minutes(4));
        let second = service.check("example.com").await.unwrap();
        assert!(second.cached);
        assert_eq!(second.score, first.score);
        assert_eq!(checker.lookups(), 1);

        clock.advance(Duration::minutes(2));
        let third = service.check("example.com").await.unwrap();
        assert!(!third.cached);
        assert_eq!(checker.lookups(), 2);
    }

    #[tokio::test]
    async fn sweep_scores_only_active_warmups() {
        let store = InMemoryWarmupStore::new();
        let active = WarmupDomain::start(&StartWarmup::new(WorkspaceId::new(), "live.example.com"), Utc::now());
        let mut paused = WarmupDomain::start(&StartWarmup::new(WorkspaceId::new(), "held.example.com"), Utc::now());
        paused.status = WarmupStatus::Paused;
        store.create(&active).await.unwrap();
        store.create(&paused).await.unwrap();
        let checker = StaticDnsChecker::new(healthy_dns());
        let service = HealthService::new(Arc::new(store), Arc::new(checker.clone()));

        let reports = service.check_active().await.unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].domain, "live.example.com");
        assert_eq!(checker.lookups(), 1);
    }

    #[tokio::test]
    async fn domains_without_warmup_are_scored_uncached() {
        let store = InMemoryWarmupStore::new();
        let checker = StaticDnsChecker::new(healthy_dns());
        let service = HealthService::new(Arc::new(store), Arc::new(checker.clone()));

        service.check("cold.example.com").await.unwrap();
        let again = service.check("cold.example.com").await.unwrap();

        assert!(!again.cached);
        assert_eq!(checker.lookups(), 2);
    }
}
