//! Configuration for the microservice host.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use stratum_reconcile::{MonitorConfig, ReadinessPolicy, UpdatePolicy};

use crate::monitors::Identity;
use crate::tenant::ManagerConfig;

/// Microservice host configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance this process belongs to.
    pub instance_id: String,

    /// Namespace holding the instance's resources.
    pub namespace: String,

    /// Functional area served by this process.
    pub functional_area: String,

    /// Full resync interval for resource monitors, in seconds.
    pub resync_interval_secs: u64,

    /// Maximum concurrent tenant engine operations.
    pub tenant_concurrency: usize,

    /// Sleep between conflicting update attempts, in milliseconds.
    pub update_backoff_ms: u64,

    /// Readiness poll interval in seconds.
    pub readiness_interval_secs: u64,

    /// Readiness deadline in seconds; `None` waits until shutdown.
    pub readiness_deadline_secs: Option<u64>,

    pub topic_partitions: u32,
    pub topic_replication: u16,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: "stratum".to_string(),
            namespace: "default".to_string(),
            functional_area: "event-sources".to_string(),
            resync_interval_secs: 600,
            tenant_concurrency: 5,
            update_backoff_ms: 500,
            readiness_interval_secs: 5,
            readiness_deadline_secs: None,
            topic_partitions: 8,
            topic_replication: 3,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let parse = |key: &str| -> Result<Option<u64>> {
            lookup(key)
                .map(|v| v.parse::<u64>().with_context(|| format!("{key}={v} is not a number")))
                .transpose()
        };

        let config = Self {
            instance_id: lookup("STRATUM_INSTANCE_ID").unwrap_or(defaults.instance_id),
            namespace: lookup("STRATUM_NAMESPACE").unwrap_or(defaults.namespace),
            functional_area: lookup("STRATUM_FUNCTIONAL_AREA").unwrap_or(defaults.functional_area),
            resync_interval_secs: parse("STRATUM_RESYNC_INTERVAL_SECS")?
                .unwrap_or(defaults.resync_interval_secs),
            tenant_concurrency: parse("STRATUM_TENANT_CONCURRENCY")?
                .map(usize::try_from)
                .transpose()
                .context("STRATUM_TENANT_CONCURRENCY is out of range")?
                .unwrap_or(defaults.tenant_concurrency),
            update_backoff_ms: parse("STRATUM_UPDATE_BACKOFF_MS")?
                .unwrap_or(defaults.update_backoff_ms),
            readiness_interval_secs: parse("STRATUM_READINESS_INTERVAL_SECS")?
                .unwrap_or(defaults.readiness_interval_secs),
            readiness_deadline_secs: parse("STRATUM_READINESS_DEADLINE_SECS")?,
            topic_partitions: parse("STRATUM_TOPIC_PARTITIONS")?
                .map(u32::try_from)
                .transpose()
                .context("STRATUM_TOPIC_PARTITIONS does not fit in 32 bits")?
                .unwrap_or(defaults.topic_partitions),
            topic_replication: parse("STRATUM_TOPIC_REPLICATION")?
                .map(u16::try_from)
                .transpose()
                .context("STRATUM_TOPIC_REPLICATION does not fit in 16 bits")?
                .unwrap_or(defaults.topic_replication),
            log_level: lookup("STRATUM_LOG_LEVEL").unwrap_or(defaults.log_level),
        };

        if config.tenant_concurrency == 0 {
            bail!("STRATUM_TENANT_CONCURRENCY must be at least 1");
        }
        if config.resync_interval_secs == 0 {
            bail!("STRATUM_RESYNC_INTERVAL_SECS must be at least 1");
        }
        if config.readiness_interval_secs == 0 {
            bail!("STRATUM_READINESS_INTERVAL_SECS must be at least 1");
        }
        if config.topic_partitions == 0 || config.topic_replication == 0 {
            bail!("STRATUM_TOPIC_PARTITIONS and STRATUM_TOPIC_REPLICATION must be at least 1");
        }

        Ok(config)
    }

    pub fn identity(&self) -> Identity {
        Identity::new(&self.instance_id, &self.functional_area)
    }

    pub fn update_policy(&self) -> UpdatePolicy {
        UpdatePolicy {
            backoff: Duration::from_millis(self.update_backoff_ms),
        }
    }

    pub fn readiness_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            interval: Duration::from_secs(self.readiness_interval_secs),
            deadline: self.readiness_deadline_secs.map(Duration::from_secs),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig::new(&self.namespace)
            .with_resync_interval(Duration::from_secs(self.resync_interval_secs))
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            concurrency: self.tenant_concurrency,
            update_policy: self.update_policy(),
            ..ManagerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.resync_interval_secs, 600);
        assert_eq!(config.tenant_concurrency, 5);
        assert_eq!(config.update_policy().backoff, Duration::from_millis(500));
        assert_eq!(config.readiness_policy().deadline, None);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("STRATUM_INSTANCE_ID", "prod-eu"),
            ("STRATUM_TENANT_CONCURRENCY", "12"),
            ("STRATUM_READINESS_DEADLINE_SECS", "90"),
        ]))
        .unwrap();
        assert_eq!(config.identity().instance_id, "prod-eu");
        assert_eq!(config.manager_config().concurrency, 12);
        assert_eq!(config.readiness_policy().deadline, Some(Duration::from_secs(90)));
    }

    #[rstest]
    #[case("STRATUM_UPDATE_BACKOFF_MS", "soon")]
    #[case("STRATUM_TENANT_CONCURRENCY", "0")]
    #[case("STRATUM_RESYNC_INTERVAL_SECS", "0")]
    #[case("STRATUM_READINESS_INTERVAL_SECS", "0")]
    #[case("STRATUM_TOPIC_PARTITIONS", "0")]
    #[case("STRATUM_TOPIC_PARTITIONS", "4294967296")]
    #[case("STRATUM_TOPIC_REPLICATION", "0")]
    #[case("STRATUM_TOPIC_REPLICATION", "65537")]
    fn test_rejects_invalid(#[case] key: &str, #[case] value: &str) {
        assert!(Config::from_lookup(lookup(&[(key, value)])).is_err());
    }

    #[test]
    fn test_accepts_largest_replication() {
        let config = Config::from_lookup(lookup(&[("STRATUM_TOPIC_REPLICATION", "65535")])).unwrap();
        assert_eq!(config.topic_replication, u16::MAX);
    }
}
