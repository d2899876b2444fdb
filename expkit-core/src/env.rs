//! Process environment access.
//!
//! Every environment read or write made while setting up a run goes through
//! [`RunEnv`], so tests and launchers can substitute an in-memory environment
//! for the real one.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Carries the run version chosen by global rank zero to its sibling ranks.
pub const VERSION_VAR: &str = "EXPKIT_EXPM_VERSION";
/// When true, per-rank log files are never attached.
pub const TESTING_VAR: &str = "EXPKIT_TESTING";
pub const LOCAL_RANK_VAR: &str = "LOCAL_RANK";
pub const NODE_RANK_VAR: &str = "NODE_RANK";
pub const WORLD_SIZE_VAR: &str = "WORLD_SIZE";

/// Read/write view of the environment a rank runs in.
pub trait RunEnv: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;

    fn set_var(&self, key: &str, value: &str);

    /// Full command line of the process, program name first.
    fn args(&self) -> Vec<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl RunEnv for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn set_var(&self, key: &str, value: &str) {
        // SAFETY: run setup happens once at process start, before any worker
        // threads that read the environment are spawned.
        unsafe { std::env::set_var(key, value) }
    }

    fn args(&self) -> Vec<String> {
        std::env::args().collect()
    }
}

/// In-memory environment, used by tests and by callers that pin the
/// environment a run should observe.
#[derive(Debug, Default)]
pub struct MemoryEnv {
    vars: Mutex<HashMap<String, String>>,
    args: Vec<String>,
}

impl MemoryEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl RunEnv for MemoryEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set_var(&self, key: &str, value: &str) {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    fn args(&self) -> Vec<String> {
        self.args.clone()
    }
}

/// Parse a boolean environment value (`1/0`, `true/false`, `yes/no`, `on/off`, `t/f`, `y/n`).
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Read a boolean variable, falling back to `default` when unset or unparseable.
pub fn env_bool(env: &dyn RunEnv, key: &str, default: bool) -> bool {
    match env.var(key) {
        None => default,
        Some(raw) => parse_bool(&raw).unwrap_or_else(|| {
            tracing::warn!(var = key, value = %raw, "Unrecognized boolean value, using default");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_accepts_common_spellings() {
        for v in ["1", "true", "TRUE", "yes", " on ", "t", "Y"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["0", "false", "No", "off", "f", "n"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_env_bool_defaults() {
        let env = MemoryEnv::new().with_var(TESTING_VAR, "garbage");
        assert!(env_bool(&env, TESTING_VAR, true));
        assert!(!env_bool(&env, "UNSET", false));

        env.set_var(TESTING_VAR, "1");
        assert!(env_bool(&env, TESTING_VAR, false));
    }

    #[test]
    fn test_memory_env_args() {
        let env = MemoryEnv::new().with_args(["train", "--steps", "10"]);
        assert_eq!(env.args(), vec!["train", "--steps", "10"]);
    }
}
