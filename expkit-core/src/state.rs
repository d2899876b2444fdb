//! Resolved state of a run, produced by `Experiment::setup`.
//!
//! The value is built from scratch on every setup and handed to whoever needs
//! it (trainer integration, artifact snapshot, checkpoint path resolution).
//! It can be persisted next to the run so later processes can recover it.

use crate::error::Result;
use crate::trainer::{CheckpointBinding, LoggerOverride};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

pub const RUN_STATE_FILE: &str = "run_state.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    /// Directory this run logs and checkpoints into.
    pub log_dir: PathBuf,
    /// Base directory the run lives under.
    pub exp_dir: PathBuf,
    pub name: String,
    pub version: Option<String>,
    pub global_rank: usize,
    pub local_rank: usize,
    /// Log file attached for this rank, if any.
    pub log_file: Option<PathBuf>,
    pub files_to_copy: Vec<PathBuf>,
    pub cmd_args: Vec<String>,
    pub logger_override: Option<LoggerOverride>,
    pub checkpoint_bindings: Vec<CheckpointBinding>,
    /// Shared by every checkpoint callback in the process; the last binding wins.
    pub last_checkpoint_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(log_dir: PathBuf, exp_dir: PathBuf, name: &str, version: Option<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            log_dir,
            exp_dir,
            name: name.to_string(),
            version,
            global_rank: 0,
            local_rank: 0,
            log_file: None,
            files_to_copy: Vec::new(),
            cmd_args: Vec::new(),
            logger_override: None,
            checkpoint_bindings: Vec::new(),
            last_checkpoint_name: None,
            created_at: Utc::now(),
        }
    }

    /// Directory of the first checkpoint binding, if the trainer has one.
    pub fn checkpoint_dir(&self) -> Option<&Path> {
        self.checkpoint_bindings.first().map(|b| b.dirpath.as_path())
    }

    /// Write `run_state.json` into the log directory (write to `.tmp`, then rename).
    pub fn save(&self) -> Result<PathBuf> {
        let path = self.log_dir.join(RUN_STATE_FILE);
        atomic_write_json(&path, self)?;
        Ok(path)
    }

    /// Load the state persisted in `log_dir`; `Ok(None)` if there is none.
    pub fn load(log_dir: &Path) -> Result<Option<Self>> {
        let path = log_dir.join(RUN_STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

/// Serialize to pretty JSON and atomically replace `path`, creating parent directories.
pub(crate) fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}
