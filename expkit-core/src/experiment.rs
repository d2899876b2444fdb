//! Experiment lifecycle manager.
//!
//! [`Experiment::setup`] turns an [`ExperimentConfig`] into a concrete run
//! directory `<dir>/<name>/<version>`, agrees on the version across ranks,
//! attaches this rank's log file and derives the checkpoint output settings.
//! It runs once per process at startup; any error aborts the run.

use crate::config::{DEFAULT_EXPERIMENT_NAME, DEFAULT_EXPERIMENTS_DIR, ExperimentConfig};
use crate::env::{RunEnv, TESTING_VAR, VERSION_VAR, env_bool};
use crate::error::{ExpError, Result};
use crate::logging::LogSinks;
use crate::rank::RankContext;
use crate::state::RunState;
use crate::trainer::{CheckpointBinding, LoggerOverride, Trainer, TrainerKind};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// `strftime` pattern of datetime versions, e.g. `2024-05-01_13-45-09`.
pub const VERSION_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// A fresh datetime version in local time.
pub fn datetime_version() -> String {
    chrono::Local::now().format(VERSION_FORMAT).to_string()
}

/// Per-rank log file name.
pub fn log_file_name(rank: &RankContext) -> String {
    format!(
        "expkit_log_globalrank-{}_localrank-{}.txt",
        rank.global_rank, rank.local_rank
    )
}

/// Whether this rank writes a log file. Testing mode suppresses every file.
pub fn should_attach_log_file(config: &ExperimentConfig, rank: &RankContext, testing: bool) -> bool {
    if testing {
        return false;
    }
    if config.log_local_rank_0_only {
        return rank.is_local_rank_zero();
    }
    if config.log_global_rank_0_only {
        return rank.is_global_rank_zero();
    }
    true
}

/// Manages the directory, version and log sinks of one experiment run.
pub struct Experiment {
    config: ExperimentConfig,
    env: Arc<dyn RunEnv>,
    sinks: Arc<dyn LogSinks>,
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Experiment {
    /// Fails with a configuration error if both rank-zero logging filters are set.
    pub fn new(
        config: ExperimentConfig,
        env: Arc<dyn RunEnv>,
        sinks: Arc<dyn LogSinks>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, env, sinks })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Resolve and create the run directory for this process.
    ///
    /// With `resume_if_exists` the run is written into the unversioned
    /// `<dir>/<name>` so a later process finds the same directory.
    pub fn setup(&mut self, trainer: &dyn Trainer, resume_if_exists: bool) -> Result<RunState> {
        self.config.validate()?;

        let rank = RankContext::detect(self.env.as_ref(), trainer.node_rank(), trainer.world_size())?;
        self.sinks.set_rank(rank.global_rank);

        if trainer.kind() == TrainerKind::Trainer {
            if let Some(explicit) = self.config.explicit_log_dir.clone() {
                return self.resolve_explicit_log_dir(&explicit, &rank, trainer.has_logger());
            }
        }

        let exp_dir = match &self.config.dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?.join(DEFAULT_EXPERIMENTS_DIR),
        };

        if self.config.name.is_empty() {
            self.config.name = DEFAULT_EXPERIMENT_NAME.to_string();
        }
        let name = self.config.name.clone();

        let logger_override = if trainer.kind() == TrainerKind::Trainer
            && trainer.has_logger()
            && self.config.update_logger_directory
        {
            warn!(
                save_dir = %exp_dir.display(),
                name = %name,
                "update_logger_directory is set; overriding logger save_dir and name"
            );
            Some(LoggerOverride {
                root_dir: exp_dir.clone(),
                name: name.clone(),
            })
        } else {
            None
        };

        let version = self.resolve_version(&rank, resume_if_exists);
        if let Some(v) = &version {
            if rank.is_global_rank_zero() {
                self.env.set_var(VERSION_VAR, v);
            }
        }

        let log_dir = match &version {
            Some(v) => exp_dir.join(&name).join(v),
            None => exp_dir.join(&name),
        };

        let mut state = RunState::new(log_dir.clone(), exp_dir, &name, version);
        state.global_rank = rank.global_rank;
        state.local_rank = rank.local_rank;
        state.logger_override = logger_override;

        // Every rank creates it: each one writes its own log file here.
        create_run_dir(&log_dir)?;
        info!(log_dir = %log_dir.display(), "Experiments will be logged at {}", log_dir.display());

        if trainer.kind() == TrainerKind::Trainer {
            state.checkpoint_bindings = trainer
                .checkpoint_callbacks()
                .iter()
                .enumerate()
                .map(|(i, callback)| {
                    CheckpointBinding::derive(i, callback, &name, &log_dir, &self.config.checkpoint_dir_name)
                })
                .collect();
            state.last_checkpoint_name = state.checkpoint_bindings.last().map(|b| b.last_name.clone());
        }

        let testing = env_bool(self.env.as_ref(), TESTING_VAR, false);
        if should_attach_log_file(&self.config, &rank, testing) {
            let log_file = log_dir.join(log_file_name(&rank));
            self.sinks.add_file_handler(&log_file)?;
            state.log_file = Some(log_file);
        }

        self.sinks.add_runtime_handlers()?;

        state.files_to_copy = self.config.files_to_copy.clone();
        state.cmd_args = self.env.args();

        Ok(state)
    }

    /// Counterpart of [`setup`](Self::setup); nothing is held between the two yet.
    pub fn teardown(&mut self) {
        debug!(name = %self.config.name, "Experiment teardown");
    }

    /// Explicit version or the one published by rank zero; rank zero may replace
    /// it with a datetime version. Resuming always drops the version.
    fn resolve_version(&self, rank: &RankContext, resume_if_exists: bool) -> Option<String> {
        let mut version = self
            .config
            .version
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| self.env.var(VERSION_VAR).filter(|v| !v.is_empty()));

        if rank.is_global_rank_zero() && self.config.use_datetime_version {
            version = Some(datetime_version());
        }

        if resume_if_exists {
            warn!("No version folders will be created under the log folder because resume_if_exists is enabled");
            version = None;
        }
        version
    }

    /// The explicit log directory is used verbatim; name, dir and version are ignored.
    /// Rejected when the trainer already has its own logger.
    fn resolve_explicit_log_dir(&self, explicit: &Path, rank: &RankContext, has_logger: bool) -> Result<RunState> {
        if has_logger {
            return Err(ExpError::config(format!(
                "explicit_log_dir {} was set but the trainer already has a logger; remove one of them",
                explicit.display()
            )));
        }
        if self.config.dir.is_some() || self.config.version.is_some() {
            error!(
                explicit_log_dir = %explicit.display(),
                "Received explicit_log_dir together with dir or version; dir, name and version will be ignored"
            );
        }
        if rank.is_global_rank_zero() && explicit.exists() {
            warn!(
                explicit_log_dir = %explicit.display(),
                "Logging to explicit_log_dir, but it already exists"
            );
        }

        let mut state = RunState::new(explicit.to_path_buf(), explicit.to_path_buf(), "", None);
        state.global_rank = rank.global_rank;
        state.local_rank = rank.local_rank;
        state.files_to_copy = self.config.files_to_copy.clone();
        state.cmd_args = self.env.args();
        Ok(state)
    }
}

/// `create_dir_all` that treats a directory created concurrently by another rank as success.
fn create_run_dir(path: &Path) -> io::Result<()> {
    match std::fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Default base directory for `cwd`.
pub fn default_experiments_dir(cwd: &Path) -> PathBuf {
    cwd.join(DEFAULT_EXPERIMENTS_DIR)
}
