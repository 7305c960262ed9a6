//! Configuration loader with multi-source merging

use crate::{ConfigError, OsqlConfig, Paths};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    include_user_config: bool,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "OSQL".to_string(),
            include_user_config: true,
        }
    }

    /// Set the node directory holding osql.toml
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "OSQL")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip ~/.config/osql/config.toml
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<OsqlConfig> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = OsqlConfig::default();
        builder = builder.add_source(
            config::Config::try_from(&defaults).map_err(ConfigError::from)?,
        );

        // 2. User config (~/.config/osql/config.toml)
        if self.include_user_config {
            let paths = Paths::new();
            if let Ok(user_config_file) = paths.user_config_file() {
                if user_config_file.exists() {
                    builder = builder.add_source(
                        config::File::from(user_config_file)
                            .required(false)
                            .format(config::FileFormat::Toml),
                    );
                }
            }
        }

        // 3. Node config (osql.toml)
        let project_config_file = Paths::project_config_file(&self.project_dir);
        if project_config_file.exists() {
            builder = builder.add_source(
                config::File::from(project_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 4. Local config (osql.local.toml, gitignored)
        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(
                config::File::from(local_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 5. Environment variables (OSQL_LIMITS__MAX_TRANSACTION_OPS=...)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(ConfigError::from)
            .context("Failed to build configuration")?;

        let osql_config: OsqlConfig = config
            .try_deserialize()
            .map_err(ConfigError::from)
            .context("Failed to deserialize configuration")?;

        osql_config
            .validate()
            .context("Configuration failed validation")?;

        Ok(osql_config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(self) -> OsqlConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = ConfigLoader::new()
            .with_project_dir(temp_dir.path())
            .without_user_config()
            .load()
            .expect("Failed to load config");

        assert_eq!(config, OsqlConfig::default());
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[limits]
max_transaction_ops = 1000

[failover]
survive_master_swings = 10
random_restart = true

[features]
random_identifiers = false
"#;
        fs::write(project_dir.join("osql.toml"), config_content).expect("Failed to write config");

        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .without_user_config()
            .load()
            .expect("Failed to load config");

        assert_eq!(config.limits.max_transaction_ops, 1000);
        assert_eq!(config.failover.survive_master_swings, 10);
        assert!(config.failover.random_restart);
        assert!(!config.features.random_identifiers);
        // Untouched sections keep their defaults
        assert_eq!(config.commit.max_commit_wait_secs, 600);
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("osql.toml"),
            r#"
[commit]
max_commit_wait_secs = 30
"#,
        )
        .expect("Failed to write project config");

        fs::write(
            project_dir.join("osql.local.toml"),
            r#"
[commit]
max_commit_wait_secs = 5
"#,
        )
        .expect("Failed to write local config");

        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .without_user_config()
            .load()
            .expect("Failed to load config");

        assert_eq!(config.commit.max_commit_wait_secs, 5);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("osql.toml"),
            "[failover]\nmaster_discovery_retries = 0\n",
        )
        .expect("Failed to write project config");

        let err = ConfigLoader::new()
            .with_project_dir(project_dir)
            .without_user_config()
            .load()
            .expect_err("zero discovery retries must be rejected");
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::Unsupported {
                setting: "failover.master_discovery_retries",
                ..
            })
        ));
    }

    #[test]
    fn test_malformed_layer_is_a_merge_error() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("osql.toml"),
            "[limits]\nmax_transaction_ops = \"many\"\n",
        )
        .expect("Failed to write project config");

        let err = ConfigLoader::new()
            .with_project_dir(project_dir)
            .without_user_config()
            .load()
            .expect_err("non-numeric limit must be rejected");
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::Layered { .. })
        ));
    }
}
