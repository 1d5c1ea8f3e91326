//! Orchestrator configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the assignment orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Enable/disable the orchestrator.
    /// When disabled, the server runs without consuming any queue.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Failed attempts per item before a requeued delivery is rejected
    /// instead (0 = requeue forever).
    #[serde(default)]
    pub max_attempts: u32,

    /// Pause before a delivery is requeued (milliseconds).
    #[serde(default)]
    pub requeue_delay_ms: u64,

    /// How long stop waits for in-flight deliveries (milliseconds).
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,

    /// Consumer tags are `{prefix}-{worker_id}`.
    #[serde(default = "default_consumer_tag_prefix")]
    pub consumer_tag_prefix: String,
}

fn default_enabled() -> bool {
    true
}

fn default_shutdown_timeout() -> u64 {
    5000 // 5 seconds
}

fn default_consumer_tag_prefix() -> String {
    "assignrelay".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_attempts: 0,
            requeue_delay_ms: 0,
            shutdown_timeout_ms: default_shutdown_timeout(),
            consumer_tag_prefix: default_consumer_tag_prefix(),
        }
    }
}

impl OrchestratorConfig {
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_attempts, 0);
        assert_eq!(config.requeue_delay_ms, 0);
        assert_eq!(config.shutdown_timeout_ms, 5000);
        assert_eq!(config.consumer_tag_prefix, "assignrelay");
    }

    #[test]
    fn test_deserialize_minimal() {
        let toml = r#"
            enabled = false
        "#;
        let config: OrchestratorConfig = toml::from_str(toml).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.shutdown_timeout_ms, 5000);
    }

    #[test]
    fn test_deserialize_full() {
        let toml = r#"
            enabled = true
            max_attempts = 5
            requeue_delay_ms = 250
            shutdown_timeout_ms = 1000
            consumer_tag_prefix = "relay-a"
        "#;
        let config: OrchestratorConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.requeue_delay(), Duration::from_millis(250));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(1));
        assert_eq!(config.consumer_tag_prefix, "relay-a");
    }
}
