// Kernel Configuration
//
// Operational parameters loaded from JSON. Every field has a default so an
// empty object is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many replicas of a partition must acknowledge publish before the
/// partition counts as published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Every replica in the manifest.
    #[default]
    All,
    /// Strictly more than half of the replicas in the manifest.
    Majority,
}

impl QuorumPolicy {
    pub fn required(&self, replicas: usize) -> usize {
        match self {
            Self::All => replicas,
            Self::Majority => replicas / 2 + 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub publish_quorum: QuorumPolicy,
    pub replica_rpc_timeout_ms: u64,
    pub publish_backoff_initial_ms: u64,
    pub publish_backoff_max_ms: u64,
    /// CREATED transactions older than this are aborted by the cleanup daemon.
    pub txn_timeout_secs: u64,
    /// How long VISIBLE/ABORTED transactions and FINISHED/CANCELLED jobs are
    /// kept for label deduplication and audit before being retired.
    pub terminal_retention_secs: u64,
    pub quota_reconcile_interval_secs: u64,
    pub publish_retry_interval_ms: u64,
    pub txn_cleanup_interval_secs: u64,
    pub schema_job_interval_ms: u64,
    pub compaction_interval_secs: u64,
    /// Compaction is skipped until at least this many records follow the
    /// last checkpoint.
    pub compaction_min_records: u64,
    /// Quota for databases the catalog registers without an explicit limit.
    pub default_db_quota_bytes: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            publish_quorum: QuorumPolicy::All,
            replica_rpc_timeout_ms: 5_000,
            publish_backoff_initial_ms: 100,
            publish_backoff_max_ms: 30_000,
            txn_timeout_secs: 3_600,
            terminal_retention_secs: 3 * 24 * 3_600,
            quota_reconcile_interval_secs: 300,
            publish_retry_interval_ms: 1_000,
            txn_cleanup_interval_secs: 30,
            schema_job_interval_ms: 1_000,
            compaction_interval_secs: 600,
            compaction_min_records: 10_000,
            default_db_quota_bytes: u64::MAX,
        }
    }
}

impl KernelConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("replica_rpc_timeout_ms", self.replica_rpc_timeout_ms),
            ("publish_backoff_initial_ms", self.publish_backoff_initial_ms),
            ("publish_backoff_max_ms", self.publish_backoff_max_ms),
            ("txn_timeout_secs", self.txn_timeout_secs),
            ("quota_reconcile_interval_secs", self.quota_reconcile_interval_secs),
            ("publish_retry_interval_ms", self.publish_retry_interval_ms),
            ("txn_cleanup_interval_secs", self.txn_cleanup_interval_secs),
            ("schema_job_interval_ms", self.schema_job_interval_ms),
            ("compaction_interval_secs", self.compaction_interval_secs),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.publish_backoff_initial_ms > self.publish_backoff_max_ms {
            return Err(ConfigError::Invalid(
                "publish_backoff_initial_ms exceeds publish_backoff_max_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn replica_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.replica_rpc_timeout_ms)
    }

    pub fn publish_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.publish_backoff_initial_ms),
            Duration::from_millis(self.publish_backoff_max_ms),
        )
    }

    pub fn txn_timeout(&self) -> Duration {
        Duration::from_secs(self.txn_timeout_secs)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = KernelConfig::from_json_str("{}").unwrap();
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.publish_quorum, QuorumPolicy::All);
    }

    #[test]
    fn quorum_policy_parses_from_snake_case() {
        let config =
            KernelConfig::from_json_str(r#"{ "publish_quorum": "majority" }"#).unwrap();
        assert_eq!(config.publish_quorum, QuorumPolicy::Majority);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = KernelConfig::from_json_str(r#"{ "publish_retry_interval_ms": 0 }"#)
            .unwrap_err();
        assert!(err.to_string().contains("publish_retry_interval_ms"));
    }

    #[test]
    fn inverted_backoff_is_rejected() {
        let err = KernelConfig::from_json_str(
            r#"{ "publish_backoff_initial_ms": 500, "publish_backoff_max_ms": 100 }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn quorum_sizes() {
        assert_eq!(QuorumPolicy::All.required(3), 3);
        assert_eq!(QuorumPolicy::Majority.required(3), 2);
        assert_eq!(QuorumPolicy::Majority.required(4), 3);
        assert_eq!(QuorumPolicy::Majority.required(1), 1);
    }
}
