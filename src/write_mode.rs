//! Write-mode lock: exclusivity between manual edit sessions on a golden
//! repository and the refreshes that would replace its content.
//!
//! A lease moves through two states:
//!
//! ```text
//! enter ──▶ Held ──exit──▶ Exiting ──refresh done (ok or failed)──▶ released
//! ```
//!
//! Refreshes of a leased repository are gated by [`WriteModeLock::gate`]:
//! the lease owner's own refresh (carrying the lease marker) and any
//! refresh arriving after `exit` has begun are admitted; everything else
//! is held back, either failing fast or deferring per configuration.
//!
//! Each lease is mirrored by a marker file `<golden>/<alias>/.write-mode`
//! so an unreleased lease keeps blocking refreshes across restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::models::{ts_to_datetime, Job, JobStatus};
use crate::snapshot::mirror_path;

pub const MARKER_FILE: &str = ".write-mode";

/// Runs a refresh on behalf of a lease owner and waits for it.
#[async_trait]
pub trait RefreshRunner: Send + Sync {
    async fn refresh_and_wait(&self, alias: &str, lease_marker: &str) -> Result<Job>;
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaseInfo {
    pub alias: String,
    pub marker: String,
    /// Working copy the session edits; `exit` snapshots it.
    pub mirror: PathBuf,
    pub entered_at: DateTime<Utc>,
    pub age_secs: u64,
    pub exiting: bool,
}

/// Whether a refresh may proceed against the current lease.
#[derive(Debug, Clone)]
pub enum LeaseGate {
    Open,
    Held(LeaseInfo),
}

#[derive(Debug, Clone, Serialize)]
pub struct ExitOutcome {
    pub alias: String,
    /// Whether a lease was held (and has now been released).
    pub released: bool,
    pub refresh_job: Option<String>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MarkerFile {
    marker: String,
    entered_at: i64,
}

#[derive(Debug, Clone)]
struct Lease {
    marker: String,
    entered_at: DateTime<Utc>,
    exiting: bool,
}

impl Lease {
    fn info(&self, root: &Path, alias: &str) -> LeaseInfo {
        LeaseInfo {
            alias: alias.to_string(),
            marker: self.marker.clone(),
            mirror: mirror_path(root, alias),
            entered_at: self.entered_at,
            age_secs: (Utc::now() - self.entered_at).num_seconds().max(0) as u64,
            exiting: self.exiting,
        }
    }
}

pub struct WriteModeLock {
    root: PathBuf,
    leases: Mutex<HashMap<String, Lease>>,
    changed: watch::Sender<u64>,
}

impl WriteModeLock {
    /// `root` is the golden storage directory (`<storage>/golden`).
    pub fn new(root: PathBuf) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            root,
            leases: Mutex::new(HashMap::new()),
            changed,
        }
    }

    fn marker_path(&self, alias: &str) -> PathBuf {
        self.root.join(alias).join(MARKER_FILE)
    }

    fn bump(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Reload leases left open by a previous process. Returns how many.
    pub fn load(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut leases = self.leases.lock();
        for entry in entries.flatten() {
            let path = entry.path().join(MARKER_FILE);
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            let alias = entry.file_name().to_string_lossy().to_string();
            match serde_json::from_slice::<MarkerFile>(&bytes) {
                Ok(file) => {
                    warn!(alias = %alias, "write-mode lease survived restart; refreshes stay blocked until exit");
                    leases.insert(
                        alias,
                        Lease {
                            marker: file.marker,
                            entered_at: ts_to_datetime(file.entered_at),
                            exiting: false,
                        },
                    );
                }
                Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable write-mode marker"),
            }
        }
        Ok(leases.len())
    }

    /// Open a lease. A second `enter` while held is a Conflict.
    ///
    /// Whether the repository accepts write mode at all is checked by the
    /// caller against the registry.
    pub fn enter(&self, alias: &str) -> Result<LeaseInfo> {
        let lease = {
            let mut leases = self.leases.lock();
            if let Some(existing) = leases.get(alias) {
                return Err(FleetError::conflict(format!(
                    "write mode already active for '{}' since {}",
                    alias, existing.entered_at
                )));
            }
            let lease = Lease {
                marker: Uuid::new_v4().to_string(),
                entered_at: Utc::now(),
                exiting: false,
            };
            leases.insert(alias.to_string(), lease.clone());
            lease
        };

        let file = MarkerFile {
            marker: lease.marker.clone(),
            entered_at: lease.entered_at.timestamp(),
        };
        let written = serde_json::to_vec(&file)
            .map_err(FleetError::from)
            .and_then(|bytes| {
                let path = self.marker_path(alias);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, bytes)?;
                Ok(())
            });
        if let Err(e) = written {
            self.leases.lock().remove(alias);
            return Err(e);
        }

        info!(alias, "write mode entered");
        self.bump();
        Ok(lease.info(&self.root, alias))
    }

    /// Close the lease after running a refresh to completion.
    ///
    /// Blocks until the refresh is terminal. The lease is released on every
    /// path, including a failed refresh, which is then reported as an error.
    /// Exiting without a lease succeeds with a warning and runs nothing.
    pub async fn exit(&self, alias: &str, runner: &dyn RefreshRunner) -> Result<ExitOutcome> {
        let marker = {
            let mut leases = self.leases.lock();
            match leases.get_mut(alias) {
                Some(lease) if !lease.exiting => {
                    lease.exiting = true;
                    Some(lease.marker.clone())
                }
                Some(_) => {
                    return Err(FleetError::conflict(format!(
                        "write mode exit already in progress for '{}'",
                        alias
                    )))
                }
                None => None,
            }
        };

        let Some(marker) = marker else {
            let warning = format!("write mode was not active for '{}'", alias);
            warn!(alias, "{}", warning);
            return Ok(ExitOutcome {
                alias: alias.to_string(),
                released: false,
                refresh_job: None,
                warning: Some(warning),
            });
        };
        self.bump();

        let _release = ReleaseOnDrop {
            lock: self,
            alias,
            marker: &marker,
        };

        info!(alias, "write mode exiting; refreshing");
        let job = runner.refresh_and_wait(alias, &marker).await?;
        match job.status {
            JobStatus::Completed => Ok(ExitOutcome {
                alias: alias.to_string(),
                released: true,
                refresh_job: Some(job.id),
                warning: None,
            }),
            _ => {
                let reason = job
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "refresh did not complete".to_string());
                Err(FleetError::backend_with_code(
                    format!(
                        "write mode released for '{}', but its refresh (job {}) failed: {}",
                        alias, job.id, reason
                    ),
                    "exit_refresh_failed",
                ))
            }
        }
    }

    fn release(&self, alias: &str, marker: &str) {
        {
            let mut leases = self.leases.lock();
            if leases.get(alias).map(|l| l.marker.as_str()) == Some(marker) {
                leases.remove(alias);
            } else {
                return;
            }
        }
        if let Err(e) = std::fs::remove_file(self.marker_path(alias)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(alias, error = %e, "failed to remove write-mode marker");
            }
        }
        info!(alias, "write mode released");
        self.bump();
    }

    /// Whether a refresh of `alias`, optionally carrying a lease marker,
    /// may proceed right now.
    pub fn gate(&self, alias: &str, marker: Option<&str>) -> LeaseGate {
        let leases = self.leases.lock();
        match leases.get(alias) {
            None => LeaseGate::Open,
            Some(lease) if lease.exiting => LeaseGate::Open,
            Some(lease) if marker == Some(lease.marker.as_str()) => LeaseGate::Open,
            Some(lease) => LeaseGate::Held(lease.info(&self.root, alias)),
        }
    }

    /// Wait up to `timeout` for the gate of `alias` to open.
    pub async fn wait_for_gate(&self, alias: &str, timeout: Duration) -> bool {
        let mut rx = self.changed.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if matches!(self.gate(alias, None), LeaseGate::Open) {
                return true;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return matches!(self.gate(alias, None), LeaseGate::Open),
            }
        }
    }

    pub fn lease(&self, alias: &str) -> Option<LeaseInfo> {
        self.leases.lock().get(alias).map(|l| l.info(&self.root, alias))
    }

    /// Held leases, oldest first.
    pub fn leases(&self) -> Vec<LeaseInfo> {
        let mut leases: Vec<LeaseInfo> = self
            .leases
            .lock()
            .iter()
            .map(|(alias, lease)| lease.info(&self.root, alias))
            .collect();
        leases.sort_by_key(|l| l.entered_at);
        leases
    }

    /// Drop a lease without refreshing (the repository was removed).
    pub fn forget(&self, alias: &str) {
        if let Some(lease) = self.lease(alias) {
            self.release(alias, &lease.marker);
        }
    }
}

struct ReleaseOnDrop<'a> {
    lock: &'a WriteModeLock,
    alias: &'a str,
    marker: &'a str,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.lock.release(self.alias, self.marker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{JobError, JobKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct CountingRunner {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl RefreshRunner for CountingRunner {
        async fn refresh_and_wait(&self, alias: &str, _marker: &str) -> Result<Job> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Job {
                id: "job-1".to_string(),
                kind: JobKind::Refresh,
                target: alias.to_string(),
                owner: None,
                status: if self.fail {
                    JobStatus::Failed
                } else {
                    JobStatus::Completed
                },
                progress: 100,
                message: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: Some(Utc::now()),
                result: None,
                error: self.fail.then(|| JobError {
                    kind: ErrorKind::BackendFailure,
                    message: "fetch failed".to_string(),
                    code: None,
                }),
            })
        }
    }

    fn runner(fail: bool) -> CountingRunner {
        CountingRunner {
            calls: AtomicUsize::new(0),
            fail,
        }
    }

    #[tokio::test]
    async fn exit_without_lease_warns_and_skips_refresh() {
        let tmp = TempDir::new().unwrap();
        let lock = WriteModeLock::new(tmp.path().to_path_buf());
        let runner = runner(false);

        let outcome = lock.exit("alpha", &runner).await.unwrap();
        assert!(!outcome.released);
        assert!(outcome.warning.is_some());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_enter_conflicts() {
        let tmp = TempDir::new().unwrap();
        let lock = WriteModeLock::new(tmp.path().to_path_buf());
        let lease = lock.enter("alpha").unwrap();
        assert_eq!(lease.mirror, tmp.path().join("alpha").join("mirror"));
        let err = lock.enter("alpha").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(lock.enter("beta").is_ok());
    }

    #[tokio::test]
    async fn failed_refresh_still_releases() {
        let tmp = TempDir::new().unwrap();
        let lock = WriteModeLock::new(tmp.path().to_path_buf());
        lock.enter("alpha").unwrap();
        assert!(tmp.path().join("alpha").join(MARKER_FILE).exists());

        let runner = runner(true);
        let err = lock.exit("alpha", &runner).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendFailure);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert!(lock.lease("alpha").is_none());
        assert!(!tmp.path().join("alpha").join(MARKER_FILE).exists());
    }

    #[tokio::test]
    async fn gate_admits_owner_and_exiting() {
        let tmp = TempDir::new().unwrap();
        let lock = WriteModeLock::new(tmp.path().to_path_buf());
        assert!(matches!(lock.gate("alpha", None), LeaseGate::Open));

        let lease = lock.enter("alpha").unwrap();
        assert!(matches!(lock.gate("alpha", None), LeaseGate::Held(_)));
        assert!(matches!(
            lock.gate("alpha", Some(&lease.marker)),
            LeaseGate::Open
        ));
        assert!(!lock.wait_for_gate("alpha", Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn deferred_waiter_wakes_on_release() {
        let tmp = TempDir::new().unwrap();
        let lock = Arc::new(WriteModeLock::new(tmp.path().to_path_buf()));
        lock.enter("alpha").unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.wait_for_gate("alpha", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.exit("alpha", &runner(false)).await.unwrap();

        assert!(waiter.await.unwrap());
    }

    #[test]
    fn leases_survive_reload() {
        let tmp = TempDir::new().unwrap();
        let first = WriteModeLock::new(tmp.path().to_path_buf());
        let lease = first.enter("alpha").unwrap();

        let second = WriteModeLock::new(tmp.path().to_path_buf());
        assert_eq!(second.load().unwrap(), 1);
        assert_eq!(second.lease("alpha").unwrap().marker, lease.marker);
    }
}
