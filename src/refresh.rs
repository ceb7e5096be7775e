//! Automatic refresh cycle.
//!
//! Every tick, each served golden repository whose last refresh is older
//! than the interval gets a refresh job, unless one is already running.
//! Repositories under a write-mode lease are left alone; a lease held past
//! `lease_warn_secs` is reported as starving the cycle. A refresh that
//! fails is not retried here beyond the next tick picking it up again.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ErrorKind, Result};
use crate::golden::GoldenRepoManager;
use crate::models::GoldenStatus;
use crate::write_mode::WriteModeLock;

/// Outcome of one pass over the registry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// `(alias, job_id)` of every refresh submitted.
    pub submitted: Vec<(String, String)>,
    /// Skipped because a write-mode lease is held.
    pub leased: Vec<String>,
    /// Leases held longer than the warning threshold.
    pub starved: Vec<String>,
    /// Skipped because a job already holds the repository.
    pub busy: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct AutoRefresher {
    golden: GoldenRepoManager,
    write_mode: Arc<WriteModeLock>,
    interval: Duration,
    lease_warn: Duration,
}

impl AutoRefresher {
    pub fn new(config: &Config, golden: GoldenRepoManager, write_mode: Arc<WriteModeLock>) -> Self {
        Self {
            golden,
            write_mode,
            interval: Duration::from_secs(config.refresh.interval_secs),
            lease_warn: Duration::from_secs(config.refresh.lease_warn_secs),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// One pass: submit refreshes for every due repository.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let now = Utc::now();
        let interval = chrono::Duration::from_std(self.interval)
            .unwrap_or_else(|_| chrono::Duration::zero());

        for repo in self.golden.list().await? {
            if repo.status == GoldenStatus::Indexing || repo.snapshot.is_none() {
                continue;
            }
            let due = repo.last_refresh.map_or(true, |at| now - at >= interval);
            if !due {
                continue;
            }
            if repo.status == GoldenStatus::Refreshing {
                report.busy.push(repo.alias);
                continue;
            }

            if let Some(lease) = self.write_mode.lease(&repo.alias) {
                if lease.age_secs >= self.lease_warn.as_secs() {
                    warn!(
                        alias = %repo.alias,
                        age_secs = lease.age_secs,
                        "write-mode lease is starving automatic refresh"
                    );
                    report.starved.push(repo.alias.clone());
                }
                report.leased.push(repo.alias);
                continue;
            }

            match self.golden.refresh(&repo.alias).await {
                Ok(job_id) => {
                    info!(alias = %repo.alias, job_id = %job_id, "automatic refresh submitted");
                    report.submitted.push((repo.alias, job_id));
                }
                Err(err) if err.kind() == ErrorKind::Conflict => {
                    debug!(alias = %repo.alias, "refresh skipped; repository busy");
                    report.busy.push(repo.alias);
                }
                Err(err) => {
                    warn!(alias = %repo.alias, error = %err, "automatic refresh not submitted");
                    report.failed.push((repo.alias, err.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Run the cycle forever on the configured interval. Returns `None`
    /// when the cycle is disabled.
    pub fn spawn(self) -> Option<tokio::task::JoinHandle<()>> {
        if !self.enabled() {
            return None;
        }
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick fires immediately; give startup recovery room.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = self.run_once().await {
                    warn!(error = %err, "refresh cycle failed");
                }
            }
        }))
    }
}
