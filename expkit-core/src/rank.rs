//! Distributed rank derivation.

use crate::env::{LOCAL_RANK_VAR, RunEnv};
use crate::error::{ExpError, Result};
use serde::{Deserialize, Serialize};

/// Rank of the current process within a distributed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankContext {
    pub local_rank: usize,
    pub node_rank: usize,
    pub world_size: usize,
    pub global_rank: usize,
}

impl RankContext {
    /// Fails with a configuration error if the global rank does not fit in `usize`.
    pub fn new(local_rank: usize, node_rank: usize, world_size: usize) -> Result<Self> {
        let global_rank = node_rank
            .checked_mul(world_size)
            .and_then(|base| base.checked_add(local_rank))
            .ok_or_else(|| {
                ExpError::config(format!(
                    "rank layout overflows: node_rank={node_rank} world_size={world_size} local_rank={local_rank}"
                ))
            })?;
        Ok(Self {
            local_rank,
            node_rank,
            world_size,
            global_rank,
        })
    }

    /// Build the context for this process; the local rank comes from
    /// `LOCAL_RANK` and defaults to 0.
    pub fn detect(env: &dyn RunEnv, node_rank: usize, world_size: usize) -> Result<Self> {
        let local_rank = match env.var(LOCAL_RANK_VAR) {
            None => 0,
            Some(raw) => raw.trim().parse::<usize>().map_err(|_| {
                ExpError::config(format!("{LOCAL_RANK_VAR} must be a non-negative integer, got '{raw}'"))
            })?,
        };
        Self::new(local_rank, node_rank, world_size)
    }

    /// Global rank zero decides the run version and timestamp.
    pub fn is_global_rank_zero(&self) -> bool {
        self.global_rank == 0
    }

    pub fn is_local_rank_zero(&self) -> bool {
        self.local_rank == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MemoryEnv;

    #[test]
    fn test_global_rank_formula() {
        let ctx = RankContext::new(3, 2, 8).unwrap();
        assert_eq!(ctx.global_rank, 19);
        assert!(!ctx.is_global_rank_zero());
        assert!(!ctx.is_local_rank_zero());
    }

    #[test]
    fn test_detect_defaults_local_rank_to_zero() {
        let ctx = RankContext::detect(&MemoryEnv::new(), 0, 4).unwrap();
        assert_eq!(ctx.local_rank, 0);
        assert!(ctx.is_global_rank_zero());
    }

    #[test]
    fn test_detect_reads_local_rank() {
        let env = MemoryEnv::new().with_var(LOCAL_RANK_VAR, "2");
        let ctx = RankContext::detect(&env, 1, 4).unwrap();
        assert_eq!(ctx.global_rank, 6);
    }

    #[test]
    fn test_detect_rejects_garbage() {
        let env = MemoryEnv::new().with_var(LOCAL_RANK_VAR, "-1");
        assert!(matches!(
            RankContext::detect(&env, 0, 1),
            Err(ExpError::Config(_))
        ));
    }

    #[test]
    fn test_rank_layout_overflow_is_config_error() {
        assert!(matches!(
            RankContext::detect(&MemoryEnv::new(), usize::MAX / 2, 4),
            Err(ExpError::Config(_))
        ));
        let env = MemoryEnv::new().with_var(LOCAL_RANK_VAR, &usize::MAX.to_string());
        assert!(matches!(
            RankContext::detect(&env, 1, 1),
            Err(ExpError::Config(_))
        ));
        assert!(RankContext::new(usize::MAX, 0, 0).is_ok());
    }
}
