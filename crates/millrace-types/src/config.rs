//! Engine configuration types.
//!
//! `EngineConfig` is the `config.toml` that controls step timeouts, the
//! suspension sweeper, and resource limits. All fields have defaults.

use serde::{Deserialize, Serialize};

use crate::flow::TimeoutPolicy;

/// Top-level configuration for the engine.
///
/// Loaded from `~/.millrace/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-attempt timeout for tool invocations without their own.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// How often the sweeper polls for due timers and expired deadlines.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Applied to await_event steps that do not set `on_timeout`.
    #[serde(default)]
    pub suspension_timeout_policy: TimeoutPolicy,

    /// Engine-wide cap on concurrent adapter invocations (None = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_steps: Option<usize>,

    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Step outputs larger than this are replaced by a truncation marker.
    #[serde(default = "default_max_step_output_bytes")]
    pub max_step_output_bytes: usize,

    /// Lifetime of a run coordinator lease. Renewed at a third of this while
    /// the run is driven; a crashed coordinator's runs are free after it.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// How often a continuation retries a lease held by another engine.
    #[serde(default = "default_lease_poll_ms")]
    pub lease_poll_ms: u64,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_event_bus_capacity() -> usize {
    1024
}

fn default_max_step_output_bytes() -> usize {
    1_048_576
}

fn default_lease_ttl_ms() -> u64 {
    30_000
}

fn default_lease_poll_ms() -> u64 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            suspension_timeout_policy: TimeoutPolicy::default(),
            max_concurrent_steps: None,
            event_bus_capacity: default_event_bus_capacity(),
            max_step_output_bytes: default_max_step_output_bytes(),
            lease_ttl_ms: default_lease_ttl_ms(),
            lease_poll_ms: default_lease_poll_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.default_step_timeout_secs, 300);
        assert_eq!(config.sweep_interval_ms, 1_000);
        assert_eq!(config.suspension_timeout_policy, TimeoutPolicy::Fail);
        assert!(config.max_concurrent_steps.is_none());
        assert_eq!(config.lease_ttl_ms, 30_000);
        assert_eq!(config.lease_poll_ms, 50);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
default_step_timeout_secs = 30
sweep_interval_ms = 250
suspension_timeout_policy = "timed_out"
max_concurrent_steps = 8
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.default_step_timeout_secs, 30);
        assert_eq!(config.sweep_interval_ms, 250);
        assert_eq!(config.suspension_timeout_policy, TimeoutPolicy::TimedOut);
        assert_eq!(config.max_concurrent_steps, Some(8));
        assert_eq!(config.event_bus_capacity, 1024);
    }
}
