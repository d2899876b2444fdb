//! Task entry points: train, pretrain, validate, checkpoint import/export.

use crate::error::{ExpError, Result};
use crate::experiment::Experiment;
use crate::snapshot::snapshot_artifacts;
use crate::trainer::{DataModule, Model, Strategy, Trainer};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Which side owns the tokenizer that both model and data should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerSource {
    /// The model adopts the data module's tokenizer.
    Data,
    /// The data module adopts the model's tokenizer.
    Model,
}

/// Restores trainer state from an earlier run before training starts.
pub trait ResumePolicy {
    fn setup(&mut self, model: &mut dyn Model, trainer: &mut dyn Trainer) -> Result<()>;

    /// Whether the run should reuse the unversioned experiment directory.
    fn resume_if_exists(&self) -> bool;
}

/// Stores a rendering of the task configuration next to the run.
pub trait ConfigSnapshot {
    fn save(&self, exp_dir: &Path) -> Result<()>;
}

/// Converts checkpoints between the trainer format and external formats.
pub trait CheckpointIo {
    fn import_ckpt(
        &self,
        model: &dyn Model,
        source: &str,
        output_path: Option<&Path>,
        overwrite: bool,
    ) -> Result<PathBuf>;

    fn export_ckpt(
        &self,
        path: &Path,
        target: &str,
        output_path: Option<&Path>,
        overwrite: bool,
    ) -> Result<PathBuf>;

    /// True if `source` already is a distributed trainer checkpoint.
    fn is_distributed_ckpt(&self, source: &str) -> bool;
}

#[derive(Default)]
pub struct TrainOptions<'a> {
    pub resume: Option<&'a mut dyn ResumePolicy>,
    pub tokenizer: Option<TokenizerSource>,
    pub config_snapshot: Option<&'a dyn ConfigSnapshot>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ValidateOptions<'a> {
    pub tokenizer: Option<TokenizerSource>,
    /// Checkpoint to validate: a distributed checkpoint or an importable source.
    pub source: Option<&'a str>,
    /// Export target to convert the validated checkpoint into.
    pub export: Option<&'a str>,
}

fn require_model_parallel(trainer: &dyn Trainer) -> Result<()> {
    match trainer.strategy() {
        Strategy::ModelParallel => Ok(()),
        other => Err(ExpError::task(format!(
            "Only the model-parallel strategy is supported, got {other:?}"
        ))),
    }
}

fn share_tokenizer(model: &mut dyn Model, data: &mut dyn DataModule, source: TokenizerSource) -> Result<()> {
    match source {
        TokenizerSource::Data => {
            let tokenizer = data
                .tokenizer()
                .ok_or_else(|| ExpError::task("data module has no tokenizer to share"))?;
            model.set_tokenizer(tokenizer);
        }
        TokenizerSource::Model => {
            let tokenizer = model
                .tokenizer()
                .ok_or_else(|| ExpError::task("model has no tokenizer to share"))?;
            data.set_tokenizer(tokenizer);
        }
    }
    Ok(())
}

/// Train `model` on `data`; returns the experiment's base directory.
pub fn train(
    model: &mut dyn Model,
    data: &mut dyn DataModule,
    trainer: &mut dyn Trainer,
    exp: &mut Experiment,
    options: TrainOptions<'_>,
) -> Result<PathBuf> {
    require_model_parallel(trainer)?;

    if let Some(source) = options.tokenizer {
        share_tokenizer(model, data, source)?;
    }

    let mut resume_if_exists = false;
    if let Some(resume) = options.resume {
        resume.setup(model, trainer)?;
        resume_if_exists = resume.resume_if_exists();
    }

    let state = exp.setup(trainer, resume_if_exists)?;
    trainer.apply_run_state(&state);

    if state.global_rank == 0 {
        state.save()?;
        snapshot_artifacts(&state)?;
    }
    if let Some(snapshot) = options.config_snapshot {
        snapshot.save(&state.exp_dir)?;
    }

    info!(log_dir = %state.log_dir.display(), run_id = %state.run_id, "Starting training");
    trainer.fit(model, data)?;

    exp.teardown();
    Ok(state.exp_dir)
}

/// [`train`] with the model adopting the data module's tokenizer.
pub fn pretrain(
    model: &mut dyn Model,
    data: &mut dyn DataModule,
    trainer: &mut dyn Trainer,
    exp: &mut Experiment,
) -> Result<PathBuf> {
    train(
        model,
        data,
        trainer,
        exp,
        TrainOptions {
            tokenizer: Some(TokenizerSource::Data),
            ..TrainOptions::default()
        },
    )
}

/// Validate a model and save the result under `<run_dir>/export`; returns the run directory.
pub fn validate(
    model: &mut dyn Model,
    data: &mut dyn DataModule,
    trainer: &mut dyn Trainer,
    io: &dyn CheckpointIo,
    options: ValidateOptions<'_>,
) -> Result<PathBuf> {
    require_model_parallel(trainer)?;

    let run_dir = trainer
        .log_dir()
        .ok_or_else(|| ExpError::task("validate requires a trainer with a logger"))?;
    let export_dir = run_dir.join("export");

    if let Some(source) = options.tokenizer {
        share_tokenizer(model, data, source)?;
    }

    let ckpt_path = match options.source {
        Some(source) if io.is_distributed_ckpt(source) => Some(PathBuf::from(source)),
        Some(source) => Some(io.import_ckpt(model, source, None, false)?),
        None => None,
    };

    trainer.validate(model, data, ckpt_path.as_deref())?;
    trainer.save_checkpoint(&export_dir)?;

    if let Some(target) = options.export {
        trainer.teardown()?;
        let exported = io.export_ckpt(&export_dir, target, None, false)?;
        info!(path = %exported.display(), target, "Exported validated checkpoint");
    }

    Ok(run_dir)
}

/// Import an external checkpoint into the trainer format.
pub fn import_ckpt(
    io: &dyn CheckpointIo,
    model: &dyn Model,
    source: &str,
    output_path: Option<&Path>,
    overwrite: bool,
) -> Result<PathBuf> {
    io.import_ckpt(model, source, output_path, overwrite)
}

/// Export a trainer checkpoint to `target`.
pub fn export_ckpt(
    io: &dyn CheckpointIo,
    path: &Path,
    target: &str,
    output_path: Option<&Path>,
    overwrite: bool,
) -> Result<PathBuf> {
    io.export_ckpt(path, target, output_path, overwrite)
}
