//! Process logging: rank-attributed stderr output and per-rank log files.
//!
//! [`init_logging`] installs a global `tracing` subscriber made of a reloadable
//! `EnvFilter`, a reloadable set of file layers and a stderr layer. The returned
//! [`LoggingHandle`] implements [`LogSinks`], the seam the experiment manager
//! uses to attribute log lines to a rank and to attach its log file.

use crate::config::LoggingConfig;
use crate::error::{ExpError, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{self, Format, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, reload};

const UNSET_RANK: usize = usize::MAX;

/// Where the experiment manager sends its logging side effects.
pub trait LogSinks: Send + Sync {
    /// Tag every subsequent log line with this global rank.
    fn set_rank(&self, global_rank: usize);

    /// Start mirroring log output into `path`.
    fn add_file_handler(&self, path: &Path) -> Result<()>;

    /// Route the distributed runtime's own log targets through the same sinks.
    fn add_runtime_handlers(&self) -> Result<()>;
}

type FilteredRegistry = Layered<reload::Layer<EnvFilter, Registry>, Registry>;
type FileLayers = Vec<Box<dyn Layer<FilteredRegistry> + Send + Sync>>;

/// Prefixes each event with `[rank N]` once a rank has been assigned.
#[derive(Clone)]
struct RankedFormat {
    rank: Arc<AtomicUsize>,
    inner: Format,
}

impl RankedFormat {
    fn new(rank: Arc<AtomicUsize>) -> Self {
        Self {
            rank,
            inner: Format::default().with_target(true),
        }
    }
}

impl<S, N> FormatEvent<S, N> for RankedFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let rank = self.rank.load(Ordering::Relaxed);
        if rank != UNSET_RANK {
            write!(writer, "[rank {rank}] ")?;
        }
        self.inner.format_event(ctx, writer, event)
    }
}

/// Handle to the installed subscriber.
pub struct LoggingHandle {
    rank: Arc<AtomicUsize>,
    base_filter: String,
    runtime_targets: Vec<String>,
    filter: reload::Handle<EnvFilter, Registry>,
    files: reload::Handle<FileLayers, FilteredRegistry>,
    attached: Mutex<Vec<PathBuf>>,
    guards: Mutex<Vec<WorkerGuard>>,
    runtime_attached: AtomicBool,
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingHandle> {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone());
    let env_filter = EnvFilter::try_new(&base_filter)
        .map_err(|e| ExpError::Logging(format!("invalid filter '{base_filter}': {e}")))?;

    let rank = Arc::new(AtomicUsize::new(UNSET_RANK));
    let (filter_layer, filter) = reload::Layer::new(env_filter);
    let (files_layer, files) = reload::Layer::new(FileLayers::new());

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .event_format(RankedFormat::new(rank.clone()));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(files_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| ExpError::Logging(e.to_string()))?;

    Ok(LoggingHandle {
        rank,
        base_filter,
        runtime_targets: config.runtime_targets.clone(),
        filter,
        files,
        attached: Mutex::new(Vec::new()),
        guards: Mutex::new(Vec::new()),
        runtime_attached: AtomicBool::new(false),
    })
}

impl LoggingHandle {
    /// Log files attached so far, in attachment order.
    pub fn attached_files(&self) -> Vec<PathBuf> {
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LogSinks for LoggingHandle {
    fn set_rank(&self, global_rank: usize) {
        self.rank.store(global_rank, Ordering::Relaxed);
    }

    fn add_file_handler(&self, path: &Path) -> Result<()> {
        let mut attached = self.attached.lock().unwrap_or_else(PoisonError::into_inner);
        if attached.iter().any(|p| p == path) {
            return Ok(());
        }

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| ExpError::invalid_input(format!("log file path has no file name: {}", path.display())))?;
        std::fs::create_dir_all(dir)?;

        let appender = tracing_appender::rolling::never(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .event_format(RankedFormat::new(self.rank.clone()))
            .boxed();

        self.files
            .modify(|layers| layers.push(layer))
            .map_err(|e| ExpError::Logging(e.to_string()))?;
        self.guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(guard);
        attached.push(path.to_path_buf());
        Ok(())
    }

    fn add_runtime_handlers(&self) -> Result<()> {
        if self.runtime_attached.load(Ordering::SeqCst) || self.runtime_targets.is_empty() {
            return Ok(());
        }
        let directives = runtime_directives(&self.base_filter, &self.runtime_targets);
        let filter = EnvFilter::try_new(&directives)
            .map_err(|e| ExpError::Logging(format!("invalid filter '{directives}': {e}")))?;
        self.filter
            .reload(filter)
            .map_err(|e| ExpError::Logging(e.to_string()))?;
        // Only mark attached once the reload took effect, so a failure can be retried.
        self.runtime_attached.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn runtime_directives(base: &str, targets: &[String]) -> String {
    let mut directives = base.to_string();
    for target in targets {
        if !directives.is_empty() {
            directives.push(',');
        }
        directives.push_str(target);
        directives.push_str("=info");
    }
    directives
}

/// Records sink calls without touching the global subscriber.
#[derive(Debug, Default)]
pub struct RecordingSinks {
    rank: Mutex<Option<usize>>,
    files: Mutex<Vec<PathBuf>>,
    runtime_calls: AtomicUsize,
}

impl RecordingSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rank(&self) -> Option<usize> {
        *self.rank.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn runtime_calls(&self) -> usize {
        self.runtime_calls.load(Ordering::SeqCst)
    }
}

impl LogSinks for RecordingSinks {
    fn set_rank(&self, global_rank: usize) {
        *self.rank.lock().unwrap_or_else(PoisonError::into_inner) = Some(global_rank);
    }

    fn add_file_handler(&self, path: &Path) -> Result<()> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.to_path_buf());
        Ok(())
    }

    fn add_runtime_handlers(&self) -> Result<()> {
        self.runtime_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
