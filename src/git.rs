//! Git backend contract and the `git` CLI implementation.
//!
//! The lifecycle managers never touch git internals; they go through
//! [`GitBackend`], which tests replace with an in-process fake.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

use crate::error::{FleetError, Result};

#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Clone `url` into `dest` with `branch` checked out.
    async fn clone_repo(&self, url: &str, branch: &str, dest: &Path) -> Result<()>;

    /// Update the remote-tracking refs of `repo` from its origin.
    async fn fetch(&self, repo: &Path) -> Result<()>;

    /// Whether `branch` exists on the origin of `repo`, as of the last fetch.
    async fn verify_branch_exists(&self, repo: &Path, branch: &str) -> Result<bool>;

    /// Point the working tree of `repo` at the fetched state of `branch`.
    async fn checkout(&self, repo: &Path, branch: &str) -> Result<()>;

    /// Merge `refspec` from `source` (origin when `None`) into the current
    /// branch of `repo`. Returns the root-relative paths that changed.
    async fn pull(&self, repo: &Path, source: Option<&Path>, refspec: &str)
        -> Result<Vec<String>>;

    async fn head_commit(&self, repo: &Path) -> Result<String>;
}

/// [`GitBackend`] that shells out to the `git` executable.
#[derive(Debug, Clone, Default)]
pub struct CliGit;

impl CliGit {
    async fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<std::process::Output> {
        let mut cmd = Command::new("git");
        cmd.args(args);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        debug!(?args, dir = ?dir, "git");

        cmd.output().await.map_err(|e| {
            FleetError::backend_with_code(
                format!("failed to execute 'git {}': {}. Is git installed?", args[0], e),
                "git",
            )
        })
    }

    async fn run_ok(&self, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let output = self.run(dir, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FleetError::backend_with_code(
                format!("git {} failed: {}", args[0], stderr.trim()),
                format!("git_{}", args[0]),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl GitBackend for CliGit {
    async fn clone_repo(&self, url: &str, branch: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let dest = dest.to_string_lossy();
        self.run_ok(None, &["clone", "--branch", branch, url, &dest])
            .await?;
        Ok(())
    }

    async fn fetch(&self, repo: &Path) -> Result<()> {
        self.run_ok(Some(repo), &["fetch", "--prune", "origin"])
            .await?;
        Ok(())
    }

    async fn verify_branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let remote_ref = format!("refs/remotes/origin/{}", branch);
        let output = self
            .run(
                Some(repo),
                &["rev-parse", "--verify", "--quiet", &remote_ref],
            )
            .await?;
        Ok(output.status.success())
    }

    async fn checkout(&self, repo: &Path, branch: &str) -> Result<()> {
        let remote_ref = format!("origin/{}", branch);
        self.run_ok(Some(repo), &["checkout", "-B", branch, &remote_ref])
            .await?;
        Ok(())
    }

    async fn pull(
        &self,
        repo: &Path,
        source: Option<&Path>,
        refspec: &str,
    ) -> Result<Vec<String>> {
        let before = self.head_commit(repo).await?;

        let source = source
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| "origin".to_string());
        self.run_ok(
            Some(repo),
            &["pull", "--no-rebase", "--no-edit", &source, refspec],
        )
        .await?;

        let after = self.head_commit(repo).await?;
        if before == after {
            return Ok(Vec::new());
        }

        let diff = self
            .run_ok(Some(repo), &["diff", "--name-only", &before, &after])
            .await?;
        Ok(diff
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn head_commit(&self, repo: &Path) -> Result<String> {
        self.run_ok(Some(repo), &["rev-parse", "HEAD"]).await
    }
}
