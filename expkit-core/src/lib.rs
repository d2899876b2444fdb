//! # expkit-core: experiment run orchestration for distributed training
//!
//! Resolves where a training run lives on disk and keeps every rank of a
//! distributed job in agreement about it:
//!
//! - [`experiment`]: the lifecycle manager (run directory, version, log files,
//!   checkpoint output settings).
//! - [`state`]: the resolved [`RunState`] handed to everything downstream.
//! - [`tasks`]: train / validate / import / export entry points over the
//!   [`trainer::Trainer`] collaborator.
//! - [`export`]: multimodal checkpoint export into inference-engine layout.

pub mod config;
pub mod env;
pub mod error;
pub mod experiment;
pub mod export;
pub mod logging;
pub mod rank;
pub mod snapshot;
pub mod state;
pub mod tasks;
pub mod trainer;

pub use config::{ExperimentConfig, ExpkitConfig, LoggingConfig, load_config};
pub use env::{MemoryEnv, ProcessEnv, RunEnv};
pub use error::{ExpError, Result};
pub use experiment::Experiment;
pub use logging::{LogSinks, LoggingHandle, RecordingSinks, init_logging};
pub use rank::RankContext;
pub use state::RunState;
pub use trainer::{CheckpointBinding, LoggerOverride, Trainer, TrainerKind};
