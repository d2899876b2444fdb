//! Multimodal checkpoint export.
//!
//! Builds inference engines for a vision-language model: one engine for the
//! visual encoder and one for the language model, written under
//! `<model_dir>/visual_engine` and `<model_dir>/llm_engine`. Engine building
//! itself is delegated to an [`EngineBuilder`]; [`CommandEngineBuilder`] shells
//! out to an external converter.

use crate::error::{ExpError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

pub const VISUAL_ENGINE_DIR: &str = "visual_engine";
pub const LLM_ENGINE_DIR: &str = "llm_engine";
pub const MANIFEST_FILE: &str = "export_manifest.json";

/// Engine precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    #[serde(alias = "bf16")]
    Bfloat16,
    #[serde(alias = "fp16", alias = "16")]
    Float16,
    #[serde(alias = "fp32", alias = "32")]
    Float32,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bfloat16 => "bfloat16",
            Self::Float16 => "float16",
            Self::Float32 => "float32",
        }
    }
}

/// Export configuration file: `[infer]`, `[infer.llm]`, `[model]` and an optional `[builder]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfigFile {
    pub infer: InferSection,
    pub model: ModelSection,
    #[serde(default)]
    pub builder: Option<CommandBuilderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferSection {
    /// Directory the engines are written to.
    pub output_dir: PathBuf,
    #[serde(default)]
    pub llm: LlmInferSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmInferSection {
    #[serde(default = "default_tensor_parallelism")]
    pub tensor_parallelism: usize,
    #[serde(default = "default_max_input_len")]
    pub max_input_len: usize,
    #[serde(default = "default_max_output_len")]
    pub max_output_len: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_multimodal_len")]
    pub max_multimodal_len: usize,
}

impl Default for LlmInferSection {
    fn default() -> Self {
        Self {
            tensor_parallelism: default_tensor_parallelism(),
            max_input_len: default_max_input_len(),
            max_output_len: default_max_output_len(),
            max_batch_size: default_max_batch_size(),
            max_multimodal_len: default_max_multimodal_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    pub visual_model_path: PathBuf,
    pub llm_model_path: PathBuf,
    /// Multimodal architecture, e.g. `neva` or `vila`.
    #[serde(rename = "type")]
    pub model_type: String,
    /// Language model family, e.g. `llama`.
    pub llm_model_type: String,
    #[serde(default)]
    pub precision: Precision,
}

/// External converter invoked once per engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBuilderConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_builder_timeout")]
    pub timeout_secs: u64,
}

fn default_tensor_parallelism() -> usize {
    1
}

fn default_max_input_len() -> usize {
    4096
}

fn default_max_output_len() -> usize {
    256
}

fn default_max_batch_size() -> usize {
    1
}

fn default_max_multimodal_len() -> usize {
    3072
}

fn default_builder_timeout() -> u64 {
    3600
}

impl ExportConfigFile {
    /// Load from a TOML file; `EXPKIT_EXPORT_` variables (nested with `__`) override it.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ExpError::not_found(format!("export config {}", path.display())));
        }
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("EXPKIT_EXPORT_").split("__"))
            .extract()
            .map_err(|e| ExpError::from(Box::new(e)))
    }

    pub fn request(&self) -> ExportRequest {
        ExportRequest {
            visual_checkpoint_path: self.model.visual_model_path.clone(),
            llm_checkpoint_path: self.model.llm_model_path.clone(),
            model_type: self.model.model_type.clone(),
            llm_model_type: self.model.llm_model_type.clone(),
            tensor_parallel_size: self.infer.llm.tensor_parallelism,
            max_input_len: self.infer.llm.max_input_len,
            max_output_len: self.infer.llm.max_output_len,
            max_batch_size: self.infer.llm.max_batch_size,
            max_multimodal_len: self.infer.llm.max_multimodal_len,
            dtype: self.model.precision,
        }
    }
}

/// What to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub visual_checkpoint_path: PathBuf,
    pub llm_checkpoint_path: PathBuf,
    pub model_type: String,
    pub llm_model_type: String,
    pub tensor_parallel_size: usize,
    pub max_input_len: usize,
    pub max_output_len: usize,
    pub max_batch_size: usize,
    pub max_multimodal_len: usize,
    pub dtype: Precision,
}

impl ExportRequest {
    pub fn validate(&self) -> Result<()> {
        if self.model_type.trim().is_empty() {
            return Err(ExpError::invalid_input("model_type must not be empty"));
        }
        if self.llm_model_type.trim().is_empty() {
            return Err(ExpError::invalid_input("llm_model_type must not be empty"));
        }
        let sizes = [
            ("tensor_parallel_size", self.tensor_parallel_size),
            ("max_input_len", self.max_input_len),
            ("max_output_len", self.max_output_len),
            ("max_batch_size", self.max_batch_size),
            ("max_multimodal_len", self.max_multimodal_len),
        ];
        for (field, value) in sizes {
            if value == 0 {
                return Err(ExpError::invalid_input(format!("{field} must be positive")));
            }
        }
        for path in [&self.visual_checkpoint_path, &self.llm_checkpoint_path] {
            if !path.exists() {
                return Err(ExpError::not_found(format!("checkpoint {}", path.display())));
            }
        }
        Ok(())
    }
}

/// Which engine a build call produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStage {
    Visual,
    Llm,
}

impl EngineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visual => "visual",
            Self::Llm => "llm",
        }
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Visual => VISUAL_ENGINE_DIR,
            Self::Llm => LLM_ENGINE_DIR,
        }
    }
}

/// Builds inference engines.
#[async_trait]
pub trait EngineBuilder: Send + Sync {
    async fn build(&self, stage: EngineStage, request: &ExportRequest, output_dir: &Path) -> Result<()>;

    /// Load the built engines from `model_dir` to check they are usable.
    async fn load(&self, model_dir: &Path) -> Result<()>;
}

/// Record of a finished export, written to `<model_dir>/export_manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub request: ExportRequest,
    pub visual_engine_dir: PathBuf,
    pub llm_engine_dir: PathBuf,
    pub loaded: bool,
    pub created_at: DateTime<Utc>,
}

/// Exports a multimodal checkpoint pair into `model_dir`.
pub struct MultimodalExporter {
    model_dir: PathBuf,
    load_model: bool,
}

impl MultimodalExporter {
    pub fn new(model_dir: PathBuf, load_model: bool) -> Self {
        Self {
            model_dir,
            load_model,
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub async fn export(&self, request: &ExportRequest, builder: &dyn EngineBuilder) -> Result<ExportManifest> {
        request.validate()?;

        let mut engine_dirs = Vec::with_capacity(2);
        for stage in [EngineStage::Visual, EngineStage::Llm] {
            let dir = self.model_dir.join(stage.dir_name());
            tokio::fs::create_dir_all(&dir).await?;
            info!(stage = stage.as_str(), output = %dir.display(), "Building engine");
            builder.build(stage, request, &dir).await?;
            engine_dirs.push(dir);
        }

        if self.load_model {
            builder.load(&self.model_dir).await?;
        }

        let llm_engine_dir = engine_dirs.pop().unwrap_or_else(|| self.model_dir.join(LLM_ENGINE_DIR));
        let visual_engine_dir = engine_dirs.pop().unwrap_or_else(|| self.model_dir.join(VISUAL_ENGINE_DIR));
        let manifest = ExportManifest {
            request: request.clone(),
            visual_engine_dir,
            llm_engine_dir,
            loaded: self.load_model,
            created_at: Utc::now(),
        };
        write_manifest(&self.model_dir.join(MANIFEST_FILE), &manifest).await?;
        info!(model_dir = %self.model_dir.display(), "Multimodal export complete");
        Ok(manifest)
    }
}

/// Write-to-temp-then-rename so a reader never sees a half-written manifest.
async fn write_manifest(path: &Path, manifest: &ExportManifest) -> Result<()> {
    let json = serde_json::to_vec_pretty(manifest)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Runs an external converter once per engine stage.
pub struct CommandEngineBuilder {
    config: CommandBuilderConfig,
}

impl CommandEngineBuilder {
    pub fn new(config: CommandBuilderConfig) -> Self {
        Self { config }
    }

    /// Arguments passed to the converter for one stage.
    pub fn stage_args(&self, stage: EngineStage, request: &ExportRequest, output_dir: &Path) -> Vec<String> {
        let checkpoint = match stage {
            EngineStage::Visual => &request.visual_checkpoint_path,
            EngineStage::Llm => &request.llm_checkpoint_path,
        };
        let mut args = self.config.args.clone();
        args.extend([
            "--stage".to_string(),
            stage.as_str().to_string(),
            "--checkpoint".to_string(),
            checkpoint.display().to_string(),
            "--output-dir".to_string(),
            output_dir.display().to_string(),
            "--model-type".to_string(),
            request.model_type.clone(),
            "--llm-model-type".to_string(),
            request.llm_model_type.clone(),
            "--dtype".to_string(),
            request.dtype.as_str().to_string(),
            "--tensor-parallel-size".to_string(),
            request.tensor_parallel_size.to_string(),
            "--max-input-len".to_string(),
            request.max_input_len.to_string(),
            "--max-output-len".to_string(),
            request.max_output_len.to_string(),
            "--max-batch-size".to_string(),
            request.max_batch_size.to_string(),
            "--max-multimodal-len".to_string(),
            request.max_multimodal_len.to_string(),
        ]);
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<()> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        debug!(program = %self.config.program.display(), ?args, "Running engine converter");

        let result = tokio::time::timeout(timeout, async {
            let output = Command::new(&self.config.program)
                .args(&args)
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| ExpError::export(format!("Failed to spawn converter: {e}")))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(ExpError::export(format!(
                    "Converter failed (exit {}): {}",
                    output.status, stderr
                )));
            }
            Ok(())
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ExpError::Timeout(format!(
                "Converter timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl EngineBuilder for CommandEngineBuilder {
    async fn build(&self, stage: EngineStage, request: &ExportRequest, output_dir: &Path) -> Result<()> {
        self.run(self.stage_args(stage, request, output_dir)).await
    }

    async fn load(&self, model_dir: &Path) -> Result<()> {
        for stage in [EngineStage::Visual, EngineStage::Llm] {
            let dir = model_dir.join(stage.dir_name());
            let built = tokio::fs::read_dir(&dir).await?.next_entry().await?.is_some();
            if !built {
                return Err(ExpError::export(format!(
                    "{} engine directory is empty: {}",
                    stage.as_str(),
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}
