//! The real subscriber: per-rank log file, rank prefix and runtime targets.
//! Lives in its own test binary because the global subscriber installs once.

use expkit_core::{LogSinks, LoggingConfig, init_logging};
use tempfile::TempDir;

#[test]
fn rank_log_file_receives_prefixed_lines_and_runtime_targets() {
    // SAFETY: single test in this binary, no other threads read the environment yet.
    unsafe { std::env::remove_var("RUST_LOG") };

    let dir = TempDir::new().unwrap();
    let handle = init_logging(&LoggingConfig {
        level: "warn".into(),
        runtime_targets: vec!["distributed_runtime".into()],
    })
    .unwrap();
    handle.set_rank(3);

    let path = dir.path().join("expkit_log_globalrank-3_localrank-1.txt");
    handle.add_file_handler(&path).unwrap();
    // Attaching the same file again must not duplicate lines.
    handle.add_file_handler(&path).unwrap();
    assert_eq!(handle.attached_files(), vec![path.clone()]);

    tracing::warn!("run directory ready");
    tracing::info!(target: "distributed_runtime", "runtime line before attach");

    handle.add_runtime_handlers().unwrap();
    handle.add_runtime_handlers().unwrap();
    tracing::info!(target: "distributed_runtime", "runtime line after attach");
    tracing::info!("plain info stays filtered");

    // Dropping the handle flushes the non-blocking writers.
    drop(handle);

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(!contents.is_empty());
    for line in contents.lines() {
        assert!(line.starts_with("[rank 3] "), "unprefixed line: {line}");
    }
    assert_eq!(contents.matches("run directory ready").count(), 1);
    assert!(contents.contains("distributed_runtime: runtime line after attach"));
    assert!(!contents.contains("runtime line before attach"));
    assert!(!contents.contains("plain info stays filtered"));
}
