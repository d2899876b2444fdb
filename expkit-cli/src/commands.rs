//! Command handlers for the expkit CLI.

use crate::Commands;
use crate::ConfigAction;
use crate::launch::{self, LaunchPlan};
use expkit_core::config::DEFAULT_EXPERIMENTS_DIR;
use expkit_core::env::{NODE_RANK_VAR, VERSION_VAR, WORLD_SIZE_VAR};
use expkit_core::experiment::datetime_version;
use expkit_core::export::{CommandEngineBuilder, ExportConfigFile, MultimodalExporter};
use expkit_core::snapshot::snapshot_artifacts;
use expkit_core::trainer::{CheckpointCallbackSpec, DataModule, Model, Strategy};
use expkit_core::{
    ExpError, Experiment, ExpkitConfig, LogSinks, ProcessEnv, RunEnv, RunState, Trainer,
    TrainerKind,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config: ExpkitConfig,
    sinks: Arc<dyn LogSinks>,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace, &config),
        Commands::Setup {
            resume,
            node_rank,
            world_size,
            fabric,
            monitor,
        } => {
            let env: Arc<dyn RunEnv> = Arc::new(ProcessEnv);
            let options = SetupOptions {
                resume,
                node_rank,
                world_size,
                fabric,
                monitor,
            };
            let state = handle_setup(&options, workspace, config, env, sinks)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Commands::Version => {
            println!("{}", datetime_version());
            Ok(())
        }
        Commands::Launch {
            nproc,
            node_rank,
            nnodes,
            run_version,
            command,
        } => handle_launch(nproc, node_rank, nnodes, run_version, &command).await,
        Commands::ExportMultimodal {
            export_config,
            load_model,
        } => handle_export(&export_config, load_model).await,
    }
}

fn handle_config(action: ConfigAction, workspace: &Path, config: &ExpkitConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace.join("expkit.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&ExpkitConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!("Created default configuration at: {}", config_path.display());
            Ok(())
        }
        ConfigAction::Show => {
            println!("{}", toml::to_string_pretty(config)?);
            Ok(())
        }
    }
}

/// Flags of the `setup` subcommand. Rank layout falls back to the launcher's
/// environment when a flag is absent.
#[derive(Debug, Default)]
struct SetupOptions {
    resume: bool,
    node_rank: Option<usize>,
    world_size: Option<usize>,
    fabric: bool,
    monitor: Option<String>,
}

/// Trainer stand-in for processes that only need the run directory resolved,
/// such as shell-driven jobs that read the printed run state.
struct StandaloneTrainer {
    kind: TrainerKind,
    node_rank: usize,
    world_size: usize,
    monitor: Option<String>,
}

impl Trainer for StandaloneTrainer {
    fn kind(&self) -> TrainerKind {
        self.kind
    }

    fn node_rank(&self) -> usize {
        self.node_rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn strategy(&self) -> Strategy {
        Strategy::SingleDevice
    }

    fn has_logger(&self) -> bool {
        false
    }

    fn log_dir(&self) -> Option<std::path::PathBuf> {
        None
    }

    fn checkpoint_callbacks(&self) -> Vec<CheckpointCallbackSpec> {
        if self.kind == TrainerKind::Fabric {
            return Vec::new();
        }
        vec![CheckpointCallbackSpec {
            monitor: self.monitor.clone(),
            ..CheckpointCallbackSpec::default()
        }]
    }

    fn apply_run_state(&mut self, _state: &RunState) {}

    fn fit(&mut self, _model: &mut dyn Model, _data: &mut dyn DataModule) -> expkit_core::Result<()> {
        Err(ExpError::task("the standalone trainer only resolves run directories"))
    }

    fn validate(
        &mut self,
        _model: &mut dyn Model,
        _data: &mut dyn DataModule,
        _ckpt_path: Option<&Path>,
    ) -> expkit_core::Result<()> {
        Err(ExpError::task("the standalone trainer only resolves run directories"))
    }

    fn save_checkpoint(&mut self, _path: &Path) -> expkit_core::Result<()> {
        Err(ExpError::task("the standalone trainer holds no weights"))
    }

    fn teardown(&mut self) -> expkit_core::Result<()> {
        Ok(())
    }
}

fn rank_layout_value(flag: Option<usize>, env: &dyn RunEnv, key: &str, default: usize) -> anyhow::Result<usize> {
    if let Some(value) = flag {
        return Ok(value);
    }
    match env.var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{key} must be a non-negative integer, got '{raw}'")),
        None => Ok(default),
    }
}

fn handle_setup(
    options: &SetupOptions,
    workspace: &Path,
    mut config: ExpkitConfig,
    env: Arc<dyn RunEnv>,
    sinks: Arc<dyn LogSinks>,
) -> anyhow::Result<RunState> {
    if config.experiment.dir.is_none() {
        config.experiment.dir = Some(workspace.join(DEFAULT_EXPERIMENTS_DIR));
    }

    let trainer = StandaloneTrainer {
        kind: if options.fabric {
            TrainerKind::Fabric
        } else {
            TrainerKind::Trainer
        },
        node_rank: rank_layout_value(options.node_rank, env.as_ref(), NODE_RANK_VAR, 0)?,
        world_size: rank_layout_value(options.world_size, env.as_ref(), WORLD_SIZE_VAR, 1)?,
        monitor: options.monitor.clone(),
    };

    let mut experiment = Experiment::new(config.experiment, env, sinks)?;
    let state = experiment.setup(&trainer, options.resume)?;

    if state.global_rank == 0 {
        let path = state.save()?;
        info!(path = %path.display(), "Run state saved");
        snapshot_artifacts(&state)?;
    }
    Ok(state)
}

async fn handle_launch(
    nproc: usize,
    node_rank: usize,
    nnodes: usize,
    run_version: Option<String>,
    command: &[String],
) -> anyhow::Result<()> {
    let version = run_version
        .filter(|v| !v.is_empty())
        .or_else(|| std::env::var(VERSION_VAR).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(datetime_version);
    let plan = LaunchPlan::new(nproc, node_rank, nnodes, version)?;

    info!(
        nproc = plan.nproc,
        node_rank = plan.node_rank,
        nnodes = plan.nnodes,
        version = %plan.version,
        "Launching ranks"
    );
    let failed = launch::run(&plan, command).await?;
    if failed > 0 {
        anyhow::bail!("{failed} of {} rank(s) failed", plan.nproc);
    }
    Ok(())
}

async fn handle_export(config_path: &Path, load_model: bool) -> anyhow::Result<()> {
    let file = ExportConfigFile::load(config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load export config: {e}"))?;
    let builder_config = file
        .builder
        .clone()
        .ok_or_else(|| anyhow::anyhow!("export config has no [builder] section"))?;

    let builder = CommandEngineBuilder::new(builder_config);
    let exporter = MultimodalExporter::new(file.infer.output_dir.clone(), load_model);
    let manifest = exporter.export(&file.request(), &builder).await?;

    println!("Visual engine: {}", manifest.visual_engine_dir.display());
    println!("LLM engine:    {}", manifest.llm_engine_dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use expkit_core::env::LOCAL_RANK_VAR;
    use expkit_core::state::RUN_STATE_FILE;
    use expkit_core::{MemoryEnv, RecordingSinks};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sinks() -> Arc<dyn LogSinks> {
        Arc::new(RecordingSinks::new())
    }

    #[tokio::test]
    async fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, dir.path(), ExpkitConfig::default(), sinks())
            .await
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("expkit.toml")).unwrap();
        let parsed: ExpkitConfig = toml::from_str(&content).unwrap();
        assert_eq!(parsed.experiment.checkpoint_dir_name, "checkpoints");
        assert_eq!(parsed.logging.level, "info");
    }

    #[tokio::test]
    async fn test_config_init_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("expkit.toml");
        std::fs::write(&path, "[experiment]\nname = \"kept\"\n").unwrap();

        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, dir.path(), ExpkitConfig::default(), sinks())
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "[experiment]\nname = \"kept\"\n"
        );
    }

    #[test]
    fn test_setup_defaults_to_workspace_experiments_dir() {
        let dir = TempDir::new().unwrap();
        let mut config = ExpkitConfig::default();
        config.experiment.name = "bert".into();
        config.experiment.version = Some("v3".into());
        config.experiment.use_datetime_version = false;
        let env: Arc<dyn RunEnv> = Arc::new(MemoryEnv::new());

        let state = handle_setup(&SetupOptions::default(), dir.path(), config, env, sinks()).unwrap();

        let expected = dir.path().join(DEFAULT_EXPERIMENTS_DIR).join("bert").join("v3");
        assert_eq!(state.log_dir, expected);
        assert!(expected.join(RUN_STATE_FILE).is_file());
        assert_eq!(state.checkpoint_bindings.len(), 1);
    }

    #[test]
    fn test_setup_reads_rank_layout_from_env() {
        let dir = TempDir::new().unwrap();
        let mut config = ExpkitConfig::default();
        config.experiment.dir = Some(dir.path().to_path_buf());
        let env: Arc<dyn RunEnv> = Arc::new(
            MemoryEnv::new()
                .with_var(LOCAL_RANK_VAR, "1")
                .with_var(NODE_RANK_VAR, "1")
                .with_var(WORLD_SIZE_VAR, "4")
                .with_var(VERSION_VAR, "shared"),
        );

        let state = handle_setup(&SetupOptions::default(), dir.path(), config, env, sinks()).unwrap();

        assert_eq!(state.global_rank, 5);
        assert_eq!(state.version.as_deref(), Some("shared"));
        // Only global rank zero persists the run state.
        assert!(!state.log_dir.join(RUN_STATE_FILE).exists());
    }

    #[test]
    fn test_setup_fabric_has_no_checkpoint_bindings() {
        let dir = TempDir::new().unwrap();
        let mut config = ExpkitConfig::default();
        config.experiment.dir = Some(dir.path().to_path_buf());
        let options = SetupOptions {
            fabric: true,
            resume: true,
            ..SetupOptions::default()
        };

        let state =
            handle_setup(&options, dir.path(), config, Arc::new(MemoryEnv::new()), sinks()).unwrap();

        assert!(state.checkpoint_bindings.is_empty());
        assert_eq!(state.version, None);
        assert_eq!(state.log_dir, dir.path().join("default"));
    }

    #[test]
    fn test_setup_rejects_overflowing_rank_layout() {
        let dir = TempDir::new().unwrap();
        let options = SetupOptions {
            node_rank: Some(usize::MAX / 2),
            world_size: Some(4),
            ..SetupOptions::default()
        };
        let env: Arc<dyn RunEnv> = Arc::new(MemoryEnv::new());

        let err = handle_setup(&options, dir.path(), ExpkitConfig::default(), env, sinks()).unwrap_err();
        assert!(err.to_string().contains("rank layout overflows"));
        assert!(!dir.path().join(DEFAULT_EXPERIMENTS_DIR).exists());
    }

    #[test]
    fn test_rank_layout_rejects_garbage() {
        let env = MemoryEnv::new().with_var(WORLD_SIZE_VAR, "many");
        assert!(rank_layout_value(None, &env, WORLD_SIZE_VAR, 1).is_err());
        assert_eq!(rank_layout_value(Some(3), &env, WORLD_SIZE_VAR, 1).unwrap(), 3);
        assert_eq!(rank_layout_value(None, &env, NODE_RANK_VAR, 0).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_export_requires_builder_section() {
        let dir = TempDir::new().unwrap();
        let visual = dir.path().join("visual.ckpt");
        let llm = dir.path().join("llm.ckpt");
        std::fs::write(&visual, b"v").unwrap();
        std::fs::write(&llm, b"l").unwrap();
        let config_path = dir.path().join("export.toml");
        std::fs::write(
            &config_path,
            format!(
                "[infer]\noutput_dir = \"{}\"\n\n[model]\nvisual_model_path = \"{}\"\nllm_model_path = \"{}\"\ntype = \"neva\"\nllm_model_type = \"llama\"\n",
                dir.path().join("out").display(),
                visual.display(),
                llm.display()
            ),
        )
        .unwrap();

        let err = handle_export(&config_path, false).await.unwrap_err();
        assert!(err.to_string().contains("[builder]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_export_runs_converter_per_stage() {
        let dir = TempDir::new().unwrap();
        let visual = dir.path().join("visual.ckpt");
        let llm = dir.path().join("llm.ckpt");
        std::fs::write(&visual, b"v").unwrap();
        std::fs::write(&llm, b"l").unwrap();
        let out = dir.path().join("out");
        let config_path = dir.path().join("export.toml");
        // sh -c <script> conv --stage S --checkpoint C --output-dir D ...
        std::fs::write(
            &config_path,
            format!(
                "[infer]\noutput_dir = \"{}\"\n\n[model]\nvisual_model_path = \"{}\"\nllm_model_path = \"{}\"\ntype = \"neva\"\nllm_model_type = \"llama\"\n\n[builder]\nprogram = \"sh\"\nargs = [\"-c\", \"touch \\\"$6/$2.engine\\\"\", \"conv\"]\n",
                out.display(),
                visual.display(),
                llm.display()
            ),
        )
        .unwrap();

        handle_export(&config_path, true).await.unwrap();

        assert!(out.join("visual_engine").join("visual.engine").is_file());
        assert!(out.join("llm_engine").join("llm.engine").is_file());
        assert!(out.join("export_manifest.json").is_file());
    }
}
