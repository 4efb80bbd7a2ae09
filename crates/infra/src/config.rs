//! Orchestrator configuration.

use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::jobs::ReconcilePolicy;
use crate::poll::PollPolicy;

pub const DEFAULT_ENDPOINT: &str = "http://0.0.0.0:6002";
pub const DEFAULT_ADDRESS_NAME: &str = "_default";
pub const DEFAULT_JOBS_DB: &str = "jobs";

pub const ENV_ENDPOINT: &str = "SNAPVAULT_ENDPOINT";
pub const ENV_ADDRESS_NAME: &str = "SNAPVAULT_ADDRESS_NAME";
pub const ENV_BALANCE_DEADLINE_SECS: &str = "SNAPVAULT_BALANCE_DEADLINE_SECS";
pub const ENV_CONVERGENCE_DEADLINE_SECS: &str = "SNAPVAULT_CONVERGENCE_DEADLINE_SECS";
pub const ENV_STOP_ON_TERMINAL: &str = "SNAPVAULT_STOP_ON_TERMINAL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: invalid endpoint '{value}': {reason}")]
    InvalidEndpoint {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var}: invalid value '{value}': {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Storage backend control endpoint
    pub endpoint: Url,
    /// Name of the funding address provisioned at startup
    pub default_address_name: String,
    /// Balance the funding address must strictly exceed
    pub balance_threshold: u64,
    pub balance_poll: PollPolicy,
    pub reconcile: ReconcilePolicy,
    /// How long a capture waits for replication to converge
    pub convergence_deadline: Option<Duration>,
    pub reconstruct_timeout: Duration,
    /// Name of the job registry document store
    pub jobs_db_name: String,
}

fn default_endpoint() -> Url {
    Url::parse(DEFAULT_ENDPOINT).unwrap_or_else(|_| unreachable!("default endpoint parses"))
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            default_address_name: DEFAULT_ADDRESS_NAME.to_string(),
            balance_threshold: 0,
            balance_poll: PollPolicy::default(),
            reconcile: ReconcilePolicy::default(),
            convergence_deadline: None,
            reconstruct_timeout: Duration::from_secs(1),
            jobs_db_name: DEFAULT_JOBS_DB.to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_address_name(mut self, name: impl Into<String>) -> Self {
        self.default_address_name = name.into();
        self
    }

    pub fn with_balance_threshold(mut self, threshold: u64) -> Self {
        self.balance_threshold = threshold;
        self
    }

    pub fn with_balance_poll(mut self, policy: PollPolicy) -> Self {
        self.balance_poll = policy;
        self
    }

    pub fn with_reconcile(mut self, policy: ReconcilePolicy) -> Self {
        self.reconcile = policy;
        self
    }

    pub fn with_convergence_deadline(mut self, deadline: Duration) -> Self {
        self.convergence_deadline = Some(deadline);
        self
    }

    pub fn with_reconstruct_timeout(mut self, timeout: Duration) -> Self {
        self.reconstruct_timeout = timeout;
        self
    }

    pub fn with_jobs_db_name(mut self, name: impl Into<String>) -> Self {
        self.jobs_db_name = name.into();
        self
    }

    /// Defaults overridden by `SNAPVAULT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_ENDPOINT) {
            config.endpoint = Url::parse(&value).map_err(|e| ConfigError::InvalidEndpoint {
                var: ENV_ENDPOINT,
                value: value.clone(),
                reason: e.to_string(),
            })?;
        }

        if let Some(value) = lookup(ENV_ADDRESS_NAME) {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    var: ENV_ADDRESS_NAME,
                    value,
                    reason: "must not be blank".to_string(),
                });
            }
            config.default_address_name = value;
        }

        if let Some(value) = lookup(ENV_BALANCE_DEADLINE_SECS) {
            config.balance_poll.deadline = Some(parse_secs(ENV_BALANCE_DEADLINE_SECS, value)?);
        }

        if let Some(value) = lookup(ENV_CONVERGENCE_DEADLINE_SECS) {
            config.convergence_deadline = Some(parse_secs(ENV_CONVERGENCE_DEADLINE_SECS, value)?);
        }

        if let Some(value) = lookup(ENV_STOP_ON_TERMINAL) {
            config.reconcile.stop_on_terminal = parse_flag(ENV_STOP_ON_TERMINAL, value)?;
        }

        Ok(config)
    }
}

fn parse_secs(var: &'static str, value: String) -> Result<Duration, ConfigError> {
    let parsed = value.trim().parse::<u64>();
    parsed.map(Duration::from_secs).map_err(|e| ConfigError::InvalidValue {
        var,
        reason: e.to_string(),
        value,
    })
}

fn parse_flag(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value,
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| vars.get(k).cloned()
    }

    #[test]
    fn defaults_match_local_node() {
        let config = OrchestratorConfig::default();

        assert_eq!(config.endpoint.as_str(), "http://0.0.0.0:6002/");
        assert_eq!(config.default_address_name, "_default");
        assert_eq!(config.balance_threshold, 0);
        assert_eq!(config.balance_poll.interval, Duration::from_secs(1));
        assert_eq!(config.balance_poll.deadline, None);
        assert!(!config.reconcile.stop_on_terminal);
        assert_eq!(config.convergence_deadline, None);
        assert_eq!(config.reconstruct_timeout, Duration::from_secs(1));
        assert_eq!(config.jobs_db_name, "jobs");
    }

    #[test]
    fn env_overrides_defaults() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            (ENV_ENDPOINT, "https://powergate.example.com"),
            (ENV_ADDRESS_NAME, "archive"),
            (ENV_BALANCE_DEADLINE_SECS, "30"),
            (ENV_STOP_ON_TERMINAL, "true"),
        ]))
        .unwrap();

        assert_eq!(config.endpoint.host_str(), Some("powergate.example.com"));
        assert_eq!(config.default_address_name, "archive");
        assert_eq!(config.balance_poll.deadline, Some(Duration::from_secs(30)));
        assert!(config.reconcile.stop_on_terminal);
    }

    #[test]
    fn malformed_values_are_errors() {
        let err = OrchestratorConfig::from_lookup(lookup(&[(ENV_BALANCE_DEADLINE_SECS, "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: ENV_BALANCE_DEADLINE_SECS, .. }
        ));

        let err = OrchestratorConfig::from_lookup(lookup(&[(ENV_ENDPOINT, "not a url")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEndpoint { .. }));

        let err = OrchestratorConfig::from_lookup(lookup(&[(ENV_STOP_ON_TERMINAL, "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
