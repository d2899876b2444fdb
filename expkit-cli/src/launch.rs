//! Per-node process launcher. Every local rank gets the same run version up
//! front so no rank has to wait for rank zero to publish one.

use expkit_core::env::{LOCAL_RANK_VAR, NODE_RANK_VAR, VERSION_VAR, WORLD_SIZE_VAR};
use std::process::ExitStatus;
use tokio::process::Command;
use tracing::{error, info, warn};

/// Layout of the job being launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub nproc: usize,
    pub node_rank: usize,
    pub nnodes: usize,
    pub version: String,
}

impl LaunchPlan {
    pub fn new(nproc: usize, node_rank: usize, nnodes: usize, version: String) -> anyhow::Result<Self> {
        if nproc == 0 {
            anyhow::bail!("--nproc must be at least 1");
        }
        if nnodes == 0 || node_rank >= nnodes {
            anyhow::bail!("--node-rank {node_rank} is outside a job of {nnodes} node(s)");
        }
        if nnodes.checked_mul(nproc).is_none() {
            anyhow::bail!("{nnodes} node(s) x {nproc} process(es) overflows the rank space");
        }
        if version.is_empty() {
            anyhow::bail!("run version must not be empty");
        }
        Ok(Self {
            nproc,
            node_rank,
            nnodes,
            version,
        })
    }

    /// Environment for one local rank. `WORLD_SIZE` carries the per-node
    /// process count, which is what global rank derivation multiplies by.
    pub fn rank_env(&self, local_rank: usize) -> Vec<(&'static str, String)> {
        vec![
            (LOCAL_RANK_VAR, local_rank.to_string()),
            (NODE_RANK_VAR, self.node_rank.to_string()),
            (WORLD_SIZE_VAR, self.nproc.to_string()),
            (VERSION_VAR, self.version.clone()),
        ]
    }

    /// Cannot overflow: `new` bounds `nnodes * nproc`.
    pub fn global_rank(&self, local_rank: usize) -> usize {
        self.node_rank * self.nproc + local_rank
    }
}

/// Spawn every local rank and wait for all of them. Returns the number of
/// ranks that exited unsuccessfully. Ctrl-C kills the remaining children.
pub async fn run(plan: &LaunchPlan, command: &[String]) -> anyhow::Result<usize> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("no command given to launch"))?;

    let mut children = Vec::with_capacity(plan.nproc);
    for local_rank in 0..plan.nproc {
        let child = Command::new(program)
            .args(args)
            .envs(plan.rank_env(local_rank))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn rank {local_rank} ({program}): {e}"))?;
        info!(
            local_rank,
            global_rank = plan.global_rank(local_rank),
            version = %plan.version,
            "Rank started"
        );
        children.push(child);
    }

    let wait_all = async move {
        let mut failed = 0;
        for (local_rank, mut child) in children.into_iter().enumerate() {
            let status: ExitStatus = child.wait().await?;
            if status.success() {
                info!(local_rank, "Rank finished");
            } else {
                error!(local_rank, %status, "Rank exited with failure");
                failed += 1;
            }
        }
        Ok::<usize, std::io::Error>(failed)
    };

    tokio::select! {
        result = wait_all => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; stopping all ranks");
            anyhow::bail!("launch interrupted")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rank_env_shares_version() {
        let plan = LaunchPlan::new(4, 1, 2, "2026-01-01_00-00-00".into()).unwrap();
        let env = plan.rank_env(3);
        assert_eq!(
            env,
            vec![
                (LOCAL_RANK_VAR, "3".to_string()),
                (NODE_RANK_VAR, "1".to_string()),
                (WORLD_SIZE_VAR, "4".to_string()),
                (VERSION_VAR, "2026-01-01_00-00-00".to_string()),
            ]
        );
        assert_eq!(plan.global_rank(3), 7);
    }

    #[test]
    fn test_plan_rejects_bad_layout() {
        assert!(LaunchPlan::new(0, 0, 1, "v".into()).is_err());
        assert!(LaunchPlan::new(2, 2, 2, "v".into()).is_err());
        assert!(LaunchPlan::new(2, 0, 0, "v".into()).is_err());
        assert!(LaunchPlan::new(2, 0, 1, String::new()).is_err());
        assert!(LaunchPlan::new(4, 0, usize::MAX / 2, "v".into()).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_counts_failed_ranks() {
        let plan = LaunchPlan::new(3, 0, 1, "v1".into()).unwrap();
        // Rank 1 fails, the others succeed.
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "test \"$LOCAL_RANK\" != 1 && test \"$EXPKIT_EXPM_VERSION\" = v1".to_string(),
        ];
        let failed = run(&plan, &command).await.unwrap();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_run_requires_command() {
        let plan = LaunchPlan::new(1, 0, 1, "v1".into()).unwrap();
        assert!(run(&plan, &[]).await.is_err());
    }
}
