//! Balancer configuration
//!
//! Options for a single balancing pass, plus the service settings around it.
//! Loaded from defaults, an optional TOML file, then environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardline_core::ReplicaType;
use thiserror::Error;

use crate::executor::ExecutorConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(String, String),

    #[error("Failed to parse config file: {0}")]
    Parse(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Options for one balancing pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerOptions {
    /// Maximum AddReplica tasks in flight cluster-wide
    pub max_concurrent_adds: usize,
    /// Maximum RemoveReplica tasks in flight cluster-wide
    pub max_concurrent_removals: usize,
    /// Maximum StepDownLeader tasks in flight cluster-wide
    pub max_concurrent_leader_moves: usize,
    /// When false, tables that have not reached their expected tablet count are left alone
    pub allow_limit_starting_tablets: bool,
    /// When false, no replicas are added to a table that still has over-replicated tablets
    pub allow_limit_over_replicated_tablets: bool,
    /// Replicas balanced by this pass
    pub replica_type: ReplicaType,
    /// Placement the pass is scoped to; empty selects the default live placement
    pub placement_uuid: String,
    /// Passes after which an unconfirmed pending task is dropped
    pub max_pending_passes: u64,
}

impl Default for BalancerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_adds: 1,
            max_concurrent_removals: 1,
            max_concurrent_leader_moves: 2,
            allow_limit_starting_tablets: true,
            allow_limit_over_replicated_tablets: true,
            replica_type: ReplicaType::Live,
            placement_uuid: String::new(),
            max_pending_passes: 10,
        }
    }
}

impl BalancerOptions {
    /// Options for balancing the read replicas of one placement
    pub fn read_only(placement_uuid: impl Into<String>) -> Self {
        Self {
            replica_type: ReplicaType::ReadOnly,
            placement_uuid: placement_uuid.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_adds == 0
            && self.max_concurrent_removals == 0
            && self.max_concurrent_leader_moves == 0
        {
            return Err(ConfigError::InvalidValue(
                "max_concurrent_*".to_string(),
                "all concurrency limits are zero".to_string(),
            ));
        }
        if self.replica_type == ReplicaType::ReadOnly && self.placement_uuid.is_empty() {
            return Err(ConfigError::InvalidValue(
                "placement_uuid".to_string(),
                "READ_ONLY passes need a read replica placement".to_string(),
            ));
        }
        if self.max_pending_passes == 0 {
            return Err(ConfigError::InvalidValue(
                "max_pending_passes".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Balancer service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Interval between periodic passes in seconds
    pub pass_interval_secs: u64,

    /// Plan only, never dispatch actions
    pub dry_run: bool,

    /// One entry per placement to balance; each runs its own pass
    pub passes: Vec<BalancerOptions>,

    /// Action dispatch settings
    pub executor: ExecutorConfig,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            pass_interval_secs: 1,
            dry_run: false,
            passes: vec![BalancerOptions::default()],
            executor: ExecutorConfig::default(),
        }
    }
}

impl BalancerConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `SHARDLINE_*` environment overrides
    ///
    /// Concurrency overrides apply to every configured pass.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_parse::<u64>("SHARDLINE_PASS_INTERVAL")? {
            self.pass_interval_secs = v;
        }
        if let Ok(v) = std::env::var("SHARDLINE_DRY_RUN") {
            self.dry_run = v == "true" || v == "1";
        }
        let adds = env_parse::<usize>("SHARDLINE_MAX_CONCURRENT_ADDS")?;
        let removals = env_parse::<usize>("SHARDLINE_MAX_CONCURRENT_REMOVALS")?;
        let leader_moves = env_parse::<usize>("SHARDLINE_MAX_CONCURRENT_LEADER_MOVES")?;
        for options in &mut self.passes {
            if let Some(v) = adds {
                options.max_concurrent_adds = v;
            }
            if let Some(v) = removals {
                options.max_concurrent_removals = v;
            }
            if let Some(v) = leader_moves {
                options.max_concurrent_leader_moves = v;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.passes.is_empty() {
            return Err(ConfigError::InvalidValue(
                "passes".to_string(),
                "at least one pass must be configured".to_string(),
            ));
        }
        for options in &self.passes {
            options.validate()?;
        }
        Ok(())
    }

    /// Get pass interval as Duration
    pub fn pass_interval(&self) -> Duration {
        Duration::from_secs(self.pass_interval_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), v)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BalancerConfig::default();
        assert_eq!(config.pass_interval_secs, 1);
        assert_eq!(config.passes.len(), 1);
        assert!(!config.dry_run);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pass_interval_duration() {
        let config = BalancerConfig {
            pass_interval_secs: 30,
            ..Default::default()
        };
        assert_eq!(config.pass_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_options_validate() {
        let mut options = BalancerOptions::default();
        assert!(options.validate().is_ok());

        options.max_concurrent_adds = 0;
        options.max_concurrent_removals = 0;
        options.max_concurrent_leader_moves = 0;
        assert!(options.validate().is_err());

        let read_only = BalancerOptions {
            placement_uuid: String::new(),
            ..BalancerOptions::read_only("rr")
        };
        assert!(read_only.validate().is_err());
        assert!(BalancerOptions::read_only("rr").validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = BalancerConfig::from_toml_str(
            r#"
            pass_interval_secs = 15
            dry_run = true

            [[passes]]
            max_concurrent_adds = 4
            max_concurrent_removals = 2

            [[passes]]
            replica_type = "READ_ONLY"
            placement_uuid = "rr-1"
            "#,
        )
        .unwrap();

        assert_eq!(config.pass_interval_secs, 15);
        assert!(config.dry_run);
        assert_eq!(config.passes.len(), 2);
        assert_eq!(config.passes[0].max_concurrent_adds, 4);
        assert_eq!(config.passes[0].max_concurrent_leader_moves, 2);
        assert_eq!(config.passes[1].replica_type, ReplicaType::ReadOnly);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("balancer.toml");
        std::fs::write(&path, "pass_interval_secs = 5\n").unwrap();

        let config = BalancerConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.pass_interval_secs, 5);
        assert_eq!(config.passes, vec![BalancerOptions::default()]);

        assert!(matches!(
            BalancerConfig::from_toml_file(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_, _))
        ));
    }
}
