//! Errors raised while reading and checking osql configuration

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A single config file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A single config file is not valid TOML for the settings tree.
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Merging defaults, files and `OSQL_*` variables failed.
    #[error("cannot merge configuration layers: {source}")]
    Layered {
        #[from]
        source: config::ConfigError,
    },

    /// A setting the session state machine cannot honor.
    #[error("{setting}: {reason}")]
    Unsupported {
        setting: &'static str,
        reason: String,
    },

    /// The platform has no user configuration directory.
    #[error("no user config directory for osql on this platform")]
    NoUserConfigDir,
}
