//! Configuration system for expkit.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/expkit/config.toml` and/or `expkit.toml`
//! in the workspace directory.

use crate::error::{ExpError, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Base directory used when an experiment does not name one, relative to the cwd.
pub const DEFAULT_EXPERIMENTS_DIR: &str = "expkit_experiments";
/// Experiment name used when none is given.
pub const DEFAULT_EXPERIMENT_NAME: &str = "default";
pub const DEFAULT_CHECKPOINT_DIR_NAME: &str = "checkpoints";

/// Top-level expkit configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpkitConfig {
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Descriptor of one experiment run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Experiment name; empty means [`DEFAULT_EXPERIMENT_NAME`].
    #[serde(default)]
    pub name: String,
    /// Base directory; `<cwd>/expkit_experiments` when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Pins the exact log directory and skips name/version derivation.
    #[serde(default)]
    pub explicit_log_dir: Option<PathBuf>,
    #[serde(default)]
    pub version: Option<String>,
    /// Global rank zero replaces the version with a fresh timestamp.
    #[serde(default = "default_true")]
    pub use_datetime_version: bool,
    #[serde(default)]
    pub log_local_rank_0_only: bool,
    #[serde(default)]
    pub log_global_rank_0_only: bool,
    #[serde(default)]
    pub files_to_copy: Vec<PathBuf>,
    /// Point an attached logger at this run's directory and name.
    #[serde(default = "default_true")]
    pub update_logger_directory: bool,
    /// Subdirectory of the log directory that checkpoints are written to.
    #[serde(default = "default_checkpoint_dir_name")]
    pub checkpoint_dir_name: String,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            dir: None,
            explicit_log_dir: None,
            version: None,
            use_datetime_version: true,
            log_local_rank_0_only: false,
            log_global_rank_0_only: false,
            files_to_copy: Vec::new(),
            update_logger_directory: true,
            checkpoint_dir_name: default_checkpoint_dir_name(),
        }
    }
}

impl ExperimentConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Reject option combinations that cannot both hold.
    pub fn validate(&self) -> Result<()> {
        if self.log_local_rank_0_only && self.log_global_rank_0_only {
            return Err(ExpError::config(
                "Cannot set both log_local_rank_0_only and log_global_rank_0_only to true. \
                 Please set either one or neither.",
            ));
        }
        if self.checkpoint_dir_name.trim().is_empty() {
            return Err(ExpError::config("checkpoint_dir_name must not be empty"));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log targets of the distributed runtime enabled at info once a run is set up.
    #[serde(default = "default_runtime_targets")]
    pub runtime_targets: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            runtime_targets: default_runtime_targets(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_dir_name() -> String {
    DEFAULT_CHECKPOINT_DIR_NAME.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_runtime_targets() -> Vec<String> {
    vec!["distributed_runtime".to_string()]
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `EXPKIT_`, nested with `__`)
/// 3. An explicit config file, if given
/// 4. Workspace-local config (`expkit.toml`)
/// 5. User config (`~/.config/expkit/config.toml`)
/// 6. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
    overrides: Option<&ExpkitConfig>,
) -> Result<ExpkitConfig> {
    let mut figment = Figment::from(Serialized::defaults(ExpkitConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "expkit", "expkit") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join("expkit.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(ExpError::not_found(format!("config file {}", path.display())));
        }
        figment = figment.merge(Toml::file(path));
    }

    // EXPKIT_EXPERIMENT__NAME, EXPKIT_LOGGING__LEVEL, ...
    figment = figment.merge(Env::prefixed("EXPKIT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: ExpkitConfig = figment.extract().map_err(Box::new)?;
    config.experiment.validate()?;
    Ok(config)
}
