//! Centralized worker configuration.
//!
//! Loaded via the `config` crate from environment variables, with `__`
//! separating nested keys (`NATS__URL`, `DLQ__FIX_DELAY_SECONDS`).
//! Top-level keys map directly (`DATABASE_URL`).
//! Feature flags additionally honor `FLAG_<NAME>_PERCENTAGE` and
//! `FLAG_<NAME>_ENABLED`.

use amber_relay_core::FeatureFlags;
use amber_relay_remediation::DlqConfig;
use amber_relay_workflow::nats::NatsConfig;
use serde::Deserialize;
use std::time::Duration;

/// Worker configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// Postgres connection string for runs, wake-ups and warm-ups.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Connections in the Postgres pool.
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// NATS connection and consumer settings.
    #[serde(default)]
    pub nats: NatsSettings,

    /// Dead-letter remediation settings.
    #[serde(default)]
    pub dlq: DlqSettings,

    /// Email warm-up settings.
    #[serde(default)]
    pub warmup: WarmupSettings,

    /// Feature flag defaults.
    #[serde(default)]
    pub flags: FlagSettings,

    /// Seeds retry and requeue jitter. Random when unset.
    #[serde(default)]
    pub retry_seed: Option<u64>,

    /// Directory of workflow graph JSON files loaded at startup.
    #[serde(default)]
    pub workflows_dir: Option<String>,

    /// Interval between wake scheduler passes, in seconds.
    #[serde(default = "default_scheduler_tick_seconds")]
    pub scheduler_tick_seconds: u64,
}

fn default_scheduler_tick_seconds() -> u64 {
    5
}

fn default_database_url() -> String {
    "postgres://relay@localhost/relay".to_string()
}

fn default_database_max_connections() -> u32 {
    5
}

/// NATS settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsSettings {
    #[serde(default = "default_nats_url")]
    pub url: String,

    #[serde(default)]
    pub work_stream: Option<String>,

    #[serde(default)]
    pub events_stream: Option<String>,

    /// Durable consumer name shared by all workers.
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    /// Deliveries of a work message before it is dead-lettered.
    #[serde(default = "default_work_max_deliver")]
    pub work_max_deliver: i64,

    /// Redelivery delay after a failed work message, in seconds.
    #[serde(default = "default_work_retry_seconds")]
    pub work_retry_seconds: u64,
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_consumer_name() -> String {
    "relay-worker".to_string()
}

fn default_work_max_deliver() -> i64 {
    3
}

fn default_work_retry_seconds() -> u64 {
    30
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            work_stream: None,
            events_stream: None,
            consumer_name: default_consumer_name(),
            work_max_deliver: default_work_max_deliver(),
            work_retry_seconds: default_work_retry_seconds(),
        }
    }
}

impl NatsSettings {
    /// Connection config for the workflow transport.
    #[must_use]
    pub fn nats_config(&self) -> NatsConfig {
        NatsConfig {
            url: self.url.clone(),
            work_stream_name: self.work_stream.clone(),
            events_stream_name: self.events_stream.clone(),
        }
    }
}

/// Dead-letter remediation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DlqSettings {
    #[serde(default = "default_max_delay_seconds")]
    pub max_delay_seconds: u64,

    #[serde(default = "default_fix_delay_seconds")]
    pub fix_delay_seconds: u64,

    #[serde(default = "default_refresh_delay_seconds")]
    pub refresh_delay_seconds: u64,

    #[serde(default = "default_failure_retention_days")]
    pub failure_retention_days: i64,
}

fn default_max_delay_seconds() -> u64 {
    900
}

fn default_fix_delay_seconds() -> u64 {
    10
}

fn default_refresh_delay_seconds() -> u64 {
    30
}

fn default_failure_retention_days() -> i64 {
    30
}

impl Default for DlqSettings {
    fn default() -> Self {
        Self {
            max_delay_seconds: default_max_delay_seconds(),
            fix_delay_seconds: default_fix_delay_seconds(),
            refresh_delay_seconds: default_refresh_delay_seconds(),
            failure_retention_days: default_failure_retention_days(),
        }
    }
}

impl DlqSettings {
    #[must_use]
    pub fn dlq_config(&self) -> DlqConfig {
        DlqConfig {
            max_delay: Duration::from_secs(self.max_delay_seconds),
            fix_delay: Duration::from_secs(self.fix_delay_seconds),
            refresh_delay: Duration::from_secs(self.refresh_delay_seconds),
            failure_retention_days: self.failure_retention_days,
            ..DlqConfig::default()
        }
    }
}

/// Email warm-up settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WarmupSettings {
    /// How long a deferred email waits before it is retried, in seconds.
    #[serde(default = "default_deferred_retry_seconds")]
    pub deferred_retry_seconds: u64,

    /// Offset past UTC midnight at which the daily tick runs, in seconds.
    #[serde(default = "default_advance_offset_seconds")]
    pub advance_offset_seconds: u64,

    /// Interval between health sweeps of active warm-ups, in seconds.
    #[serde(default = "default_health_interval_seconds")]
    pub health_interval_seconds: u64,

    /// NATS subject answering DNS health lookups.
    #[serde(default = "default_dns_check_subject")]
    pub dns_check_subject: String,

    /// How long to wait for a DNS health reply, in seconds.
    #[serde(default = "default_dns_check_timeout_seconds")]
    pub dns_check_timeout_seconds: u64,
}

fn default_deferred_retry_seconds() -> u64 {
    3_600
}

fn default_advance_offset_seconds() -> u64 {
    300
}

fn default_health_interval_seconds() -> u64 {
    3_600
}

fn default_dns_check_subject() -> String {
    "relay.dns.check".to_string()
}

fn default_dns_check_timeout_seconds() -> u64 {
    10
}

impl Default for WarmupSettings {
    fn default() -> Self {
        Self {
            deferred_retry_seconds: default_deferred_retry_seconds(),
            advance_offset_seconds: default_advance_offset_seconds(),
            health_interval_seconds: default_health_interval_seconds(),
            dns_check_subject: default_dns_check_subject(),
            dns_check_timeout_seconds: default_dns_check_timeout_seconds(),
        }
    }
}

/// Feature flag defaults, before `FLAG_*` overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct FlagSettings {
    #[serde(default = "default_flags_enabled")]
    pub enabled_by_default: bool,
}

fn default_flags_enabled() -> bool {
    true
}

impl Default for FlagSettings {
    fn default() -> Self {
        Self {
            enabled_by_default: default_flags_enabled(),
        }
    }
}

impl FlagSettings {
    /// Builds flags from the defaults plus `FLAG_*` variables in `vars`.
    pub fn feature_flags<I>(&self, vars: I) -> FeatureFlags
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let base = if self.enabled_by_default {
            FeatureFlags::all_enabled()
        } else {
            FeatureFlags::all_disabled()
        };
        base.with_env_overrides(vars)
    }
}

impl WorkerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed into its field.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amber_relay_core::{Flag, WorkspaceId};

    #[test]
    fn nats_settings_have_correct_defaults() {
        let settings = NatsSettings::default();
        assert_eq!(settings.url, "nats://127.0.0.1:4222");
        assert_eq!(settings.work_max_deliver, 3);
        assert_eq!(settings.nats_config().work_stream(), "RELAY_WORK");
    }

    #[test]
    fn dlq_settings_map_onto_pipeline_config() {
        let settings = DlqSettings {
            fix_delay_seconds: 20,
            ..DlqSettings::default()
        };
        let config = settings.dlq_config();
        assert_eq!(config.fix_delay, Duration::from_secs(20));
        assert_eq!(config.max_delay, Duration::from_secs(900));
        assert_eq!(config.jitter, DlqConfig::default().jitter);
    }

    #[test]
    fn flag_overrides_apply_over_defaults() {
        let flags = FlagSettings::default().feature_flags([(
            "FLAG_ENABLE_AUTO_RETRY_ENABLED".to_string(),
            "false".to_string(),
        )]);
        let workspace = WorkspaceId::new();
        assert!(flags.is_enabled(Flag::EnableDlqRemediation, workspace));
        assert!(!flags.is_enabled(Flag::EnableAutoRetry, workspace));
    }

    #[test]
    fn nested_keys_deserialize_from_a_map() {
        let config: WorkerConfig = config::Config::builder()
            .set_override("nats.url", "nats://queue:4222")
            .unwrap()
            .set_override("warmup.deferred_retry_seconds", 600)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.nats.url, "nats://queue:4222");
        assert_eq!(config.warmup.deferred_retry_seconds, 600);
        assert_eq!(config.warmup.health_interval_seconds, 3_600);
        assert_eq!(config.scheduler_tick_seconds, 5);
        assert_eq!(config.database_url, "postgres://relay@localhost/relay");
        assert_eq!(config.database_max_connections, 5);
    }

    #[test]
    fn database_url_is_a_top_level_key() {
        let config: WorkerConfig = config::Config::builder()
            .set_override("database_url", "postgres://worker@db/relay")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.database_url, "postgres://worker@db/relay");
    }
}
