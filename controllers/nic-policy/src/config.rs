//! Controller configuration loaded from environment variables.

use crate::error::ControllerError;
use crate::labels::DEFAULT_NIC_DISCOVERY_LABEL;
use std::time::Duration;

/// Runtime settings, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Namespace owned DaemonSets and ServiceAccounts live in
    pub namespace: String,
    /// Node label carrying the hardware discovery fact
    pub nic_discovery_label: String,
    pub debounce: Duration,
    pub backoff_min_seconds: u64,
    pub backoff_max_seconds: u64,
    /// Consecutive transient failures before the policy reports `Error`
    pub max_transient_retries: u32,
    /// Requeue interval while sub-resources are rolling out
    pub not_ready_requeue: Duration,
    /// Attempts per node label patch when the node keeps changing underneath
    pub node_patch_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "nicops-system".to_string(),
            nic_discovery_label: DEFAULT_NIC_DISCOVERY_LABEL.to_string(),
            debounce: Duration::from_secs(1),
            backoff_min_seconds: 1,
            backoff_max_seconds: 60,
            max_transient_retries: 8,
            not_ready_requeue: Duration::from_secs(5),
            node_patch_attempts: 5,
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            namespace: lookup("OPERATOR_NAMESPACE").unwrap_or(defaults.namespace),
            nic_discovery_label: lookup("NIC_DISCOVERY_LABEL").unwrap_or(defaults.nic_discovery_label),
            debounce: Duration::from_secs(parse_or(&lookup, "RECONCILE_DEBOUNCE_SECONDS", 1)?),
            backoff_min_seconds: parse_or(&lookup, "BACKOFF_MIN_SECONDS", defaults.backoff_min_seconds)?,
            backoff_max_seconds: parse_or(&lookup, "BACKOFF_MAX_SECONDS", defaults.backoff_max_seconds)?,
            max_transient_retries: parse_or(&lookup, "MAX_TRANSIENT_RETRIES", defaults.max_transient_retries)?,
            not_ready_requeue: Duration::from_secs(parse_or(&lookup, "NOT_READY_REQUEUE_SECONDS", 5)?),
            node_patch_attempts: parse_or(&lookup, "NODE_PATCH_ATTEMPTS", defaults.node_patch_attempts)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ControllerError> {
        if self.namespace.trim().is_empty() {
            return Err(ControllerError::InvalidConfig(
                "OPERATOR_NAMESPACE must not be empty".to_string(),
            ));
        }
        if self.nic_discovery_label.trim().is_empty() {
            return Err(ControllerError::InvalidConfig(
                "NIC_DISCOVERY_LABEL must not be empty".to_string(),
            ));
        }
        if self.backoff_min_seconds == 0 || self.backoff_min_seconds > self.backoff_max_seconds {
            return Err(ControllerError::InvalidConfig(format!(
                "backoff bounds must satisfy 0 < min <= max, got {}..{}",
                self.backoff_min_seconds, self.backoff_max_seconds
            )));
        }
        if self.node_patch_attempts == 0 {
            return Err(ControllerError::InvalidConfig(
                "NODE_PATCH_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            ControllerError::InvalidConfig(format!("{key} must be a non-negative integer, got {raw:?}"))
        }),
    }
}
