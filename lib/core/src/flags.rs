//! Per-workspace feature flags with percentage rollout.
//!
//! Evaluation order for a workspace:
//! 1. Deny list wins.
//! 2. Allow list.
//! 3. Rollout of 100 or more is on; 0 or less falls back to `enabled_by_default`.
//! 4. Otherwise a stable hash of flag and workspace picks a bucket in `0..100`.

use crate::id::WorkspaceId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Known feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    /// Route node execution through the dispatcher's protection layer.
    UseNodeDispatcher,
    /// Consult circuit breakers for protected node categories.
    UseCircuitBreaker,
    /// Let the DLQ pipeline act on failed executions automatically.
    EnableDlqRemediation,
    /// Allow automatic retries of failed executions.
    EnableAutoRetry,
}

impl Flag {
    /// All known flags.
    pub const ALL: [Flag; 4] = [
        Flag::UseNodeDispatcher,
        Flag::UseCircuitBreaker,
        Flag::EnableDlqRemediation,
        Flag::EnableAutoRetry,
    ];

    /// Snake-case flag name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UseNodeDispatcher => "use_node_dispatcher",
            Self::UseCircuitBreaker => "use_circuit_breaker",
            Self::EnableDlqRemediation => "enable_dlq_remediation",
            Self::EnableAutoRetry => "enable_auto_retry",
        }
    }

    fn env_stem(&self) -> String {
        format!("FLAG_{}", self.as_str().to_ascii_uppercase())
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rollout configuration for one flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagConfig {
    /// Percentage of workspaces (0-100) that see the flag on.
    #[serde(default)]
    pub rollout_percentage: u8,
    /// Workspaces that always see the flag on.
    #[serde(default)]
    pub enabled_workspaces: HashSet<WorkspaceId>,
    /// Workspaces that always see the flag off.
    #[serde(default)]
    pub disabled_workspaces: HashSet<WorkspaceId>,
    /// Value used when the rollout percentage is 0.
    #[serde(default)]
    pub enabled_by_default: bool,
}

impl FlagConfig {
    /// A flag that is on for everyone.
    #[must_use]
    pub fn on() -> Self {
        Self::with_rollout(100)
    }

    /// A flag that is off for everyone.
    #[must_use]
    pub fn off() -> Self {
        Self::with_rollout(0)
    }

    /// A flag rolled out to the given percentage of workspaces.
    #[must_use]
    pub fn with_rollout(percentage: u8) -> Self {
        Self {
            rollout_percentage: percentage.min(100),
            enabled_workspaces: HashSet::new(),
            disabled_workspaces: HashSet::new(),
            enabled_by_default: false,
        }
    }
}

/// Feature flag evaluator.
#[derive(Debug, Clone)]
pub struct FeatureFlags {
    configs: HashMap<Flag, FlagConfig>,
}

impl FeatureFlags {
    /// Creates an evaluator from explicit configs. Missing flags are off.
    #[must_use]
    pub fn new(configs: HashMap<Flag, FlagConfig>) -> Self {
        Self { configs }
    }

    /// Every flag on for every workspace.
    #[must_use]
    pub fn all_enabled() -> Self {
        Self::new(Flag::ALL.iter().map(|f| (*f, FlagConfig::on())).collect())
    }

    /// Every flag off for every workspace.
    #[must_use]
    pub fn all_disabled() -> Self {
        Self::new(Flag::ALL.iter().map(|f| (*f, FlagConfig::off())).collect())
    }

    /// Replaces the config for one flag.
    #[must_use]
    pub fn with(mut self, flag: Flag, config: FlagConfig) -> Self {
        self.configs.insert(flag, config);
        self
    }

    /// Applies `FLAG_<NAME>_PERCENTAGE` and `FLAG_<NAME>_ENABLED` overrides.
    ///
    /// `_ENABLED` is applied after `_PERCENTAGE` and wins. Unparseable
    /// percentages are ignored.
    #[must_use]
    pub fn with_env_overrides<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
            .collect();

        for flag in Flag::ALL {
            let stem = flag.env_stem();
            let config = self.configs.entry(flag).or_insert_with(FlagConfig::off);

            if let Some(raw) = vars.get(&format!("{stem}_PERCENTAGE")) {
                if let Ok(pct) = raw.trim().parse::<i64>() {
                    config.rollout_percentage = pct.clamp(0, 100) as u8;
                }
            }
            if let Some(raw) = vars.get(&format!("{stem}_ENABLED")) {
                let enabled = matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes");
                config.rollout_percentage = if enabled { 100 } else { 0 };
            }
        }
        self
    }

    /// Returns the config for a flag, if any.
    #[must_use]
    pub fn config(&self, flag: Flag) -> Option<&FlagConfig> {
        self.configs.get(&flag)
    }

    /// Evaluates a flag for a workspace.
    #[must_use]
    pub fn is_enabled(&self, flag: Flag, workspace: WorkspaceId) -> bool {
        let Some(config) = self.configs.get(&flag) else {
            return false;
        };

        if config.disabled_workspaces.contains(&workspace) {
            return false;
        }
        if config.enabled_workspaces.contains(&workspace) {
            return true;
        }
        if config.rollout_percentage >= 100 {
            return true;
        }
        if config.rollout_percentage == 0 {
            return config.enabled_by_default;
        }

        rollout_bucket(flag, workspace) < u32::from(config.rollout_percentage)
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::all_enabled()
    }
}

/// Stable bucket in `0..100` for a flag/workspace pair (FNV-1a).
fn rollout_bucket(flag: Flag, workspace: WorkspaceId) -> u32 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let key = format!("{}:{}", flag.as_str(), workspace);
    let hash = key
        .bytes()
        .fold(OFFSET, |acc, b| (acc ^ u64::from(b)).wrapping_mul(PRIME));
    (hash % 100) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_flag_is_off() {
        let flags = FeatureFlags::new(HashMap::new());
        assert!(!flags.is_enabled(Flag::UseCircuitBreaker, WorkspaceId::new()));
    }

    #[test]
    fn deny_list_beats_allow_list_and_full_rollout() {
        let ws = WorkspaceId::new();
        let mut config = FlagConfig::on();
        config.enabled_workspaces.insert(ws);
        config.disabled_workspaces.insert(ws);
        let flags = FeatureFlags::new(HashMap::new()).with(Flag::EnableDlqRemediation, config);

        assert!(!flags.is_enabled(Flag::EnableDlqRemediation, ws));
        assert!(flags.is_enabled(Flag::EnableDlqRemediation, WorkspaceId::new()));
    }

    #[test]
    fn allow_list_beats_zero_rollout() {
        let ws = WorkspaceId::new();
        let mut config = FlagConfig::off();
        config.enabled_workspaces.insert(ws);
        let flags = FeatureFlags::all_disabled().with(Flag::UseNodeDispatcher, config);

        assert!(flags.is_enabled(Flag::UseNodeDispatcher, ws));
        assert!(!flags.is_enabled(Flag::UseNodeDispatcher, WorkspaceId::new()));
    }

    #[test]
    fn zero_rollout_uses_default() {
        let mut config = FlagConfig::off();
        config.enabled_by_default = true;
        let flags = FeatureFlags::all_disabled().with(Flag::EnableAutoRetry, config);
        assert!(flags.is_enabled(Flag::EnableAutoRetry, WorkspaceId::new()));
    }

    #[test]
    fn partial_rollout_is_stable_and_roughly_proportional() {
        let flags = FeatureFlags::all_disabled().with(Flag::UseCircuitBreaker, FlagConfig::with_rollout(30));
        let workspaces: Vec<_> = (0..2000).map(|_| WorkspaceId::new()).collect();

        let first: Vec<bool> = workspaces
            .iter()
            .map(|ws| flags.is_enabled(Flag::UseCircuitBreaker, *ws))
            .collect();
        let second: Vec<bool> = workspaces
            .iter()
            .map(|ws| flags.is_enabled(Flag::UseCircuitBreaker, *ws))
            .collect();
        assert_eq!(first, second);

        let on = first.iter().filter(|b| **b).count();
        assert!((400..800).contains(&on), "expected ~600 enabled, got {on}");
    }

    #[test]
    fn env_overrides() {
        let flags = FeatureFlags::all_disabled().with_env_overrides([
            ("FLAG_USE_CIRCUIT_BREAKER_PERCENTAGE", "250"),
            ("FLAG_ENABLE_DLQ_REMEDIATION_PERCENTAGE", "40"),
            ("FLAG_ENABLE_DLQ_REMEDIATION_ENABLED", "yes"),
            ("FLAG_USE_NODE_DISPATCHER_PERCENTAGE", "not-a-number"),
        ]);

        assert_eq!(
            flags.config(Flag::UseCircuitBreaker).map(|c| c.rollout_percentage),
            Some(100)
        );
        assert_eq!(
            flags.config(Flag::EnableDlqRemediation).map(|c| c.rollout_percentage),
            Some(100)
        );
        assert_eq!(
            flags.config(Flag::UseNodeDispatcher).map(|c| c.rollout_percentage),
            Some(0)
        );
    }
}
