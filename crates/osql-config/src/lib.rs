//! Configuration management for the offload-SQL session protocol
//!
//! Tunables are loaded hierarchically from multiple sources:
//! 1. Environment variables (OSQL_* prefix, highest precedence)
//! 2. osql.local.toml (gitignored, local overrides)
//! 3. osql.toml (node config)
//! 4. ~/.config/osql/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! The loaded [`OsqlConfig`] is injected into every session at construction;
//! nothing in the protocol reads ambient globals.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main osql configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OsqlConfig {
    pub limits: LimitsConfig,
    pub failover: FailoverConfig,
    pub commit: CommitConfig,
    pub features: FeatureConfig,
}

/// Transaction size and throttling limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Process-wide default for the maximum operations per transaction (0 = unlimited).
    pub max_transaction_ops: u64,
    /// Ceiling for throttling offload requests, in seconds.
    pub max_throttle_seconds: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_transaction_ops: 50_000,
            max_throttle_seconds: 600,
        }
    }
}

/// Master discovery, masterswing survival and deadlock recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Restart attempts made while surviving master swings.
    pub survive_master_swings: u32,
    /// Delay before each commit retry after a master swing.
    pub master_retry_poll_ms: u64,
    /// Attempts to discover a master (or reach it) on session start.
    pub master_discovery_retries: u32,
    /// Delay between master discovery attempts.
    pub master_discovery_poll_ms: u64,
    /// Deadlock recoveries allowed before giving up with busy.
    pub deadlock_recovery_limit: u32,
    /// Backoff added per deadlock recovery already performed.
    pub deadlock_backoff_step_ms: u64,
    /// Upper bound for the deadlock recovery backoff.
    pub deadlock_backoff_cap_ms: u64,
    /// Pause after a keep-identifier replay and before a commit retry.
    pub restart_sleep_secs: u64,
    /// Force a restart on roughly one send in a hundred.
    pub random_restart: bool,
    /// Force a no-master commit outcome on roughly one commit in fifty.
    pub random_commit_replays: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            survive_master_swings: 600,
            master_retry_poll_ms: 100,
            master_discovery_retries: 100,
            master_discovery_poll_ms: 500,
            deadlock_recovery_limit: 100,
            deadlock_backoff_step_ms: 100,
            deadlock_backoff_cap_ms: 1000,
            restart_sleep_secs: 0,
            random_restart: false,
            random_commit_replays: false,
        }
    }
}

impl FailoverConfig {
    pub fn master_retry_poll(&self) -> Duration {
        Duration::from_millis(self.master_retry_poll_ms)
    }

    pub fn master_discovery_poll(&self) -> Duration {
        Duration::from_millis(self.master_discovery_poll_ms)
    }

    /// Backoff for the next deadlock recovery, given how many already ran.
    pub fn deadlock_backoff(&self, recovered: u32) -> Duration {
        let ms = self
            .deadlock_backoff_step_ms
            .saturating_mul(u64::from(recovered))
            .min(self.deadlock_backoff_cap_ms);
        Duration::from_millis(ms)
    }
}

/// Commit wait and continuation behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Wait for the master's outcome of an ordinary transaction.
    pub max_commit_wait_secs: u64,
    /// Wait for the master's outcome of a schema-change transaction.
    pub ddl_max_commit_wait_secs: u64,
    /// Attach the continuation token even without high availability.
    pub always_send_cnonce: bool,
    /// Schema changes outside client transactions are resumed by a new master.
    pub schema_change_resume_autocommit: bool,
    /// Verify retries after which the master is asked to check for self-locks.
    pub verify_self_lock_threshold: u32,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_commit_wait_secs: 600,
            ddl_max_commit_wait_secs: 3600,
            always_send_cnonce: false,
            schema_change_resume_autocommit: true,
            verify_self_lock_threshold: 1000,
        }
    }
}

impl CommitConfig {
    /// Outcome wait bound for a transaction, longer when it carries DDL.
    pub fn commit_wait(&self, running_ddl: bool) -> Duration {
        if running_ddl {
            Duration::from_secs(self.ddl_max_commit_wait_secs)
        } else {
            Duration::from_secs(self.max_commit_wait_secs)
        }
    }
}

/// Protocol feature switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Identify sessions by UUID instead of a 64-bit request id.
    pub random_identifiers: bool,
    /// Filter index operations by the caller's changed-key bitmask.
    pub partial_indexes: bool,
    /// Ship index keys for tables with expression indexes.
    pub expression_indexes: bool,
    /// Send a "not used" token for blobs an update does not touch.
    pub blob_optimization: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            random_identifiers: true,
            partial_indexes: true,
            expression_indexes: true,
            blob_optimization: true,
        }
    }
}

impl OsqlConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from a specific node directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML file, without layering.
    pub fn from_toml_file(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for deterministic tests: no polling delays, no fault injection.
    pub fn testing() -> Self {
        Self {
            failover: FailoverConfig {
                master_retry_poll_ms: 0,
                master_discovery_poll_ms: 0,
                deadlock_backoff_step_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Rejects settings the session state machine cannot honor.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.failover.master_discovery_retries == 0 {
            return Err(ConfigError::Unsupported {
                setting: "failover.master_discovery_retries",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.failover.deadlock_backoff_cap_ms < self.failover.deadlock_backoff_step_ms {
            return Err(ConfigError::Unsupported {
                setting: "failover.deadlock_backoff_cap_ms",
                reason: format!(
                    "{} is below the step of {}",
                    self.failover.deadlock_backoff_cap_ms, self.failover.deadlock_backoff_step_ms
                ),
            });
        }
        if self.commit.max_commit_wait_secs == 0 {
            return Err(ConfigError::Unsupported {
                setting: "commit.max_commit_wait_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.commit.ddl_max_commit_wait_secs == 0 {
            return Err(ConfigError::Unsupported {
                setting: "commit.ddl_max_commit_wait_secs",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}
