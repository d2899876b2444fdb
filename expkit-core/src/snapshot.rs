//! Artifact snapshot: copies the run's `files_to_copy` and its command line
//! into the log directory so the run can be reproduced later.

use crate::error::{ExpError, Result};
use crate::state::{RunState, atomic_write_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

pub const CMD_ARGS_FILE: &str = "cmd-args.log";
pub const MANIFEST_FILE: &str = "artifacts.json";

/// One copied file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub run_id: String,
    pub cmd_args: Vec<String>,
    pub artifacts: Vec<ArtifactEntry>,
    pub created_at: DateTime<Utc>,
}

/// Snapshot the run's artifacts. Only global rank zero writes; other ranks get `Ok(None)`.
pub fn snapshot_artifacts(state: &RunState) -> Result<Option<ArtifactManifest>> {
    if state.global_rank != 0 {
        return Ok(None);
    }
    std::fs::create_dir_all(&state.log_dir)?;

    // Resolve every destination first so a bad list copies nothing.
    let mut planned: Vec<(&PathBuf, PathBuf)> = Vec::with_capacity(state.files_to_copy.len());
    for source in &state.files_to_copy {
        if !source.is_file() {
            return Err(ExpError::not_found(format!("file to copy {}", source.display())));
        }
        let file_name = source
            .file_name()
            .ok_or_else(|| ExpError::invalid_input(format!("not a file path: {}", source.display())))?;
        let destination = state.log_dir.join(file_name);
        if let Some((other, _)) = planned.iter().find(|(_, dest)| *dest == destination) {
            return Err(ExpError::invalid_input(format!(
                "files to copy {} and {} share the name {}",
                other.display(),
                source.display(),
                file_name.to_string_lossy()
            )));
        }
        planned.push((source, destination));
    }

    let mut artifacts = Vec::with_capacity(planned.len());
    for (source, destination) in planned {
        let already_in_place = destination.exists() && source.canonicalize()? == destination.canonicalize()?;
        let size_bytes = if already_in_place {
            std::fs::metadata(&destination)?.len()
        } else {
            std::fs::copy(source, &destination)?
        };
        artifacts.push(ArtifactEntry {
            source: source.clone(),
            sha256: file_sha256(&destination)?,
            destination,
            size_bytes,
        });
    }

    std::fs::write(state.log_dir.join(CMD_ARGS_FILE), state.cmd_args.join(" "))?;

    let manifest = ArtifactManifest {
        run_id: state.run_id.clone(),
        cmd_args: state.cmd_args.clone(),
        artifacts,
        created_at: Utc::now(),
    };
    atomic_write_json(&state.log_dir.join(MANIFEST_FILE), &manifest)?;
    tracing::info!(
        count = manifest.artifacts.len(),
        log_dir = %state.log_dir.display(),
        "Snapshot run artifacts"
    );
    Ok(Some(manifest))
}

/// Hex SHA-256 of a file, read in a streaming fashion.
fn file_sha256(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state_in(dir: &TempDir) -> RunState {
        let mut state = RunState::new(dir.path().join("run"), dir.path().to_path_buf(), "gpt", None);
        state.cmd_args = vec!["expkit".into(), "train".into(), "--steps=5".into()];
        state
    }

    #[test]
    fn test_snapshot_copies_files_and_args() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("model.yaml");
        std::fs::write(&src, "hidden: 128\n").unwrap();
        let mut state = state_in(&dir);
        state.files_to_copy = vec![src.clone()];

        let manifest = snapshot_artifacts(&state).unwrap().unwrap();

        assert_eq!(manifest.artifacts.len(), 1);
        let entry = &manifest.artifacts[0];
        assert_eq!(entry.destination, state.log_dir.join("model.yaml"));
        assert_eq!(entry.size_bytes, 12);
        assert_eq!(entry.sha256.len(), 64);
        assert_eq!(std::fs::read_to_string(&entry.destination).unwrap(), "hidden: 128\n");
        assert_eq!(
            std::fs::read_to_string(state.log_dir.join(CMD_ARGS_FILE)).unwrap(),
            "expkit train --steps=5"
        );
        assert!(state.log_dir.join(MANIFEST_FILE).exists());
    }

    #[test]
    fn test_snapshot_skips_non_zero_rank() {
        let dir = TempDir::new().unwrap();
        let mut state = state_in(&dir);
        state.global_rank = 3;
        assert!(snapshot_artifacts(&state).unwrap().is_none());
        assert!(!state.log_dir.exists());
    }

    #[test]
    fn test_snapshot_missing_file() {
        let dir = TempDir::new().unwrap();
        let mut state = state_in(&dir);
        state.files_to_copy = vec![dir.path().join("absent.yaml")];
        assert!(matches!(snapshot_artifacts(&state), Err(ExpError::NotFound(_))));
    }

    #[test]
    fn test_snapshot_rejects_duplicate_file_names() {
        let dir = TempDir::new().unwrap();
        for sub in ["a", "b"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
            std::fs::write(dir.path().join(sub).join("cfg.yaml"), sub).unwrap();
        }
        let mut state = state_in(&dir);
        state.files_to_copy = vec![dir.path().join("a/cfg.yaml"), dir.path().join("b/cfg.yaml")];

        assert!(matches!(snapshot_artifacts(&state), Err(ExpError::InvalidInput(_))));
        assert!(!state.log_dir.join("cfg.yaml").exists());
        assert!(!state.log_dir.join(MANIFEST_FILE).exists());
    }

    #[test]
    fn test_file_digest_matches_known_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, "abc").unwrap();
        assert_eq!(
            file_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
