//! Trainer collaborator interface and the typed bindings applied to it.
//!
//! The experiment manager reads rank and callback information through
//! [`Trainer`] but never mutates the trainer's logger or callbacks. It returns
//! a [`LoggerOverride`] and [`CheckpointBinding`]s inside the run state, and
//! the integration applies them with [`Trainer::apply_run_state`].

use crate::error::Result;
use crate::state::RunState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Full trainer or the lightweight fabric launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerKind {
    Trainer,
    Fabric,
}

/// Parallelism strategy the trainer was configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Tensor/pipeline model-parallel strategy; the only one the tasks accept.
    ModelParallel,
    DataParallel,
    SingleDevice,
}

/// Current settings of a checkpoint callback attached to the trainer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointCallbackSpec {
    pub dirpath: Option<PathBuf>,
    pub filename: Option<String>,
    pub prefix: Option<String>,
    /// Metric the callback monitors, e.g. `val_loss`.
    pub monitor: Option<String>,
}

/// Directory and name an attached logger should adopt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerOverride {
    pub root_dir: PathBuf,
    pub name: String,
}

/// Output settings for one checkpoint callback, by position in the trainer's callback list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointBinding {
    pub index: usize,
    pub dirpath: PathBuf,
    pub filename: String,
    pub prefix: String,
    /// Name of the rolling "last" checkpoint: `<filename>-last`.
    pub last_name: String,
}

impl CheckpointBinding {
    /// Fill the unset fields of `callback` for a run named `name` logging into `log_dir`.
    pub fn derive(
        index: usize,
        callback: &CheckpointCallbackSpec,
        name: &str,
        log_dir: &Path,
        checkpoint_dir_name: &str,
    ) -> Self {
        let filename = callback
            .filename
            .clone()
            .unwrap_or_else(|| default_checkpoint_filename(name, callback.monitor.as_deref()));
        let prefix = callback.prefix.clone().unwrap_or_else(|| name.to_string());
        Self {
            index,
            dirpath: log_dir.join(checkpoint_dir_name),
            last_name: format!("{filename}-last"),
            filename,
            prefix,
        }
    }
}

/// `<name>--{<monitor>:.4f}-{epoch}`; callbacks without a monitor get `{epoch}` only.
pub fn default_checkpoint_filename(name: &str, monitor: Option<&str>) -> String {
    match monitor {
        Some(metric) => format!("{name}--{{{metric}:.4f}}-{{epoch}}"),
        None => format!("{name}--{{epoch}}"),
    }
}

/// Tokenizer shared between a model and its data module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokenizer {
    pub name: String,
    pub vocab_path: Option<PathBuf>,
}

/// The model being trained.
pub trait Model {
    fn tokenizer(&self) -> Option<Tokenizer>;

    fn set_tokenizer(&mut self, tokenizer: Tokenizer);
}

/// Supplies training and validation batches.
pub trait DataModule {
    fn tokenizer(&self) -> Option<Tokenizer>;

    fn set_tokenizer(&mut self, tokenizer: Tokenizer);
}

/// The deep-learning trainer an experiment runs against.
pub trait Trainer {
    fn kind(&self) -> TrainerKind;

    fn node_rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn strategy(&self) -> Strategy;

    fn has_logger(&self) -> bool;

    /// Directory the attached logger currently writes to.
    fn log_dir(&self) -> Option<PathBuf>;

    fn checkpoint_callbacks(&self) -> Vec<CheckpointCallbackSpec>;

    /// Adopt the logger override and checkpoint bindings of a freshly set up run.
    fn apply_run_state(&mut self, state: &RunState);

    fn fit(&mut self, model: &mut dyn Model, data: &mut dyn DataModule) -> Result<()>;

    /// Run validation, optionally restoring weights from `ckpt_path` first.
    fn validate(
        &mut self,
        model: &mut dyn Model,
        data: &mut dyn DataModule,
        ckpt_path: Option<&Path>,
    ) -> Result<()>;

    fn save_checkpoint(&mut self, path: &Path) -> Result<()>;

    /// Release distributed resources before an out-of-process export.
    fn teardown(&mut self) -> Result<()>;
}
