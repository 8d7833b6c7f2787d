//! Engine configuration

use rbac_resolver::{ResolverConfig, DEFAULT_MAX_GROUP_DEPTH};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Approval engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Include roles inherited through group membership when resolving approvers
    #[serde(default = "default_true")]
    pub group_roles_enabled: bool,

    /// Bound on group ancestry walks
    #[serde(default = "default_max_group_depth")]
    pub max_group_depth: usize,

    /// Re-read and re-validate attempts after losing a compare-and-swap
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,

    /// Backoff for transient storage failures
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            group_roles_enabled: true,
            max_group_depth: DEFAULT_MAX_GROUP_DEPTH,
            conflict_retries: default_conflict_retries(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            group_roles_enabled: self.group_roles_enabled,
            max_group_depth: self.max_group_depth,
        }
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// No retries, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling each time
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_max_group_depth() -> usize {
    DEFAULT_MAX_GROUP_DEPTH
}

fn default_conflict_retries() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    50
}

fn default_max_backoff() -> u64 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"conflict_retries": 7}"#).unwrap();
        assert_eq!(config.conflict_retries, 7);
        assert!(config.group_roles_enabled);
        assert_eq!(config.max_group_depth, 32);
        assert_eq!(config.retry.max_attempts, 3);
    }
}
