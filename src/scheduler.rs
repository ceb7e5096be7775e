//! Background job scheduler.
//!
//! Every mutating repository operation runs as a job. The scheduler:
//!
//! - admits at most one non-terminal job per target. The check and the
//!   claim happen under one lock, so concurrent submissions for the same
//!   target cannot both succeed. The loser gets
//!   [`FleetError::Conflict`] carrying the existing job's id.
//! - returns the job id as soon as the `pending` record is stored; the
//!   body runs on a spawned task once a worker permit is free.
//! - drives `pending -> running -> completed | failed`, capturing errors
//!   and panics from the body into the job's terminal state.
//! - persists every transition so jobs survive restarts; jobs that were
//!   `pending` or `running` when the process died are failed on startup.
//!
//! ```text
//! submit ──claim slot──▶ pending ──permit──▶ running ──body──▶ completed
//!    │                                                    └──▶ failed
//!    └── slot taken ──▶ Conflict(existing id)
//! ```

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, FleetError, Result};
use crate::models::{ts_to_datetime, Job, JobError, JobKind, JobStatus};

/// Handle given to a running job body.
#[derive(Clone)]
pub struct JobContext {
    id: String,
    scheduler: JobScheduler,
}

impl JobContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Report progress, visible through [`JobScheduler::poll`].
    pub fn progress(&self, percent: u8, message: impl Into<String>) {
        let message = message.into();
        debug!(job_id = %self.id, percent, %message, "job progress");
        let mut state = self.scheduler.inner.state.lock();
        if let Some(entry) = state.jobs.get_mut(&self.id) {
            entry.job.progress = percent.min(100);
            entry.job.message = Some(message);
        }
    }
}

/// Filter for [`JobScheduler::list`].
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub owner: Option<String>,
    pub status: Option<JobStatus>,
    pub target: Option<String>,
    pub limit: Option<usize>,
}

/// Snapshot of scheduler occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub workers: usize,
    pub idle_workers: usize,
    pub active_targets: usize,
    pub tracked_jobs: usize,
}

#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    pool: SqlitePool,
    workers: usize,
    permits: Arc<Semaphore>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, JobEntry>,
    /// target -> id of its single non-terminal job
    active: HashMap<String, String>,
}

struct JobEntry {
    job: Job,
    status_tx: watch::Sender<JobStatus>,
}

impl JobScheduler {
    /// Create a scheduler over the job store and fail any jobs a previous
    /// process left unfinished.
    pub async fn open(pool: SqlitePool, workers: usize) -> Result<Self> {
        let scheduler = Self {
            inner: Arc::new(Inner {
                pool,
                workers: workers.max(1),
                permits: Arc::new(Semaphore::new(workers.max(1))),
                state: Mutex::new(State::default()),
            }),
        };

        let interrupted = scheduler.recover_interrupted().await?;
        if interrupted > 0 {
            warn!(interrupted, "failed jobs left unfinished by a previous run");
        }

        Ok(scheduler)
    }

    /// Submit a job for `target`.
    ///
    /// Returns the new job id, or `Conflict` with the id of the job already
    /// active for `target`. The body is not started before this returns.
    pub async fn submit<F, Fut>(
        &self,
        kind: JobKind,
        target: &str,
        owner: Option<&str>,
        body: F,
    ) -> Result<String>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let job = Job {
            id: id.clone(),
            kind,
            target: target.to_string(),
            owner: owner.map(str::to_string),
            status: JobStatus::Pending,
            progress: 0,
            message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        };

        // Check-and-claim in one critical section.
        {
            let mut state = self.inner.state.lock();
            if let Some(existing) = state.active.get(target) {
                return Err(FleetError::job_conflict(
                    format!("a job is already active for '{}'", target),
                    existing.clone(),
                ));
            }
            state.active.insert(target.to_string(), id.clone());
            let (status_tx, _) = watch::channel(JobStatus::Pending);
            state.jobs.insert(
                id.clone(),
                JobEntry {
                    job: job.clone(),
                    status_tx,
                },
            );
        }

        if let Err(err) = insert_job(&self.inner.pool, &job).await {
            self.abandon(&id, target);
            return Err(match err {
                FleetError::Database(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    FleetError::conflict(format!(
                        "the job store already holds an active job for '{}'",
                        target
                    ))
                }
                other => other,
            });
        }

        info!(job_id = %id, kind = kind.as_str(), target, "job admitted");

        let scheduler = self.clone();
        let task_id = id.clone();
        let target = target.to_string();
        tokio::spawn(async move {
            scheduler.run(task_id, target, body).await;
        });

        Ok(id)
    }

    async fn run<F, Fut>(self, id: String, target: String, body: F)
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        // The semaphore is never closed.
        let permit = self.inner.permits.clone().acquire_owned().await.ok();

        if let Some(job) = self.transition(&id, |job| {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        }) {
            if let Err(err) = update_job(&self.inner.pool, &job).await {
                warn!(job_id = %id, error = %err, "failed to persist running state");
            }
            self.notify(&id, job.status);
        }

        let ctx = JobContext {
            id: id.clone(),
            scheduler: self.clone(),
        };
        // A separate task so a panicking body becomes a failed job.
        let outcome = match tokio::spawn(async move { body(ctx).await }).await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(FleetError::Internal(format!("job panicked: {}", join_err))),
        };

        self.finish(&id, &target, outcome).await;
        drop(permit);
    }

    async fn finish(&self, id: &str, target: &str, outcome: Result<serde_json::Value>) {
        let job = self.transition(id, |job| {
            job.completed_at = Some(Utc::now());
            match &outcome {
                Ok(value) => {
                    job.status = JobStatus::Completed;
                    job.progress = 100;
                    job.result = Some(value.clone());
                }
                Err(err) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(JobError::from(err));
                }
            }
        });

        if let Some(job) = &job {
            match &job.error {
                None => info!(job_id = %id, kind = job.kind.as_str(), target, "job completed"),
                Some(err) => warn!(
                    job_id = %id,
                    kind = job.kind.as_str(),
                    target,
                    error_kind = err.kind.as_str(),
                    error = %err.message,
                    "job failed"
                ),
            }
            if let Err(err) = update_job(&self.inner.pool, job).await {
                warn!(job_id = %id, error = %err, "failed to persist terminal state");
            }
        }

        // Release the slot before waking waiters so they can resubmit.
        {
            let mut state = self.inner.state.lock();
            if state.active.get(target).map(String::as_str) == Some(id) {
                state.active.remove(target);
            }
        }
        if let Some(job) = job {
            self.notify(id, job.status);
        }
    }

    /// Apply `update` to the in-memory record and return the new state.
    fn transition(&self, id: &str, update: impl FnOnce(&mut Job)) -> Option<Job> {
        let mut state = self.inner.state.lock();
        let entry = state.jobs.get_mut(id)?;
        update(&mut entry.job);
        Some(entry.job.clone())
    }

    fn notify(&self, id: &str, status: JobStatus) {
        let state = self.inner.state.lock();
        if let Some(entry) = state.jobs.get(id) {
            entry.status_tx.send_replace(status);
        }
    }

    fn abandon(&self, id: &str, target: &str) {
        let mut state = self.inner.state.lock();
        state.jobs.remove(id);
        if state.active.get(target).map(String::as_str) == Some(id) {
            state.active.remove(target);
        }
    }

    /// Current state of a job.
    pub async fn poll(&self, id: &str) -> Result<Job> {
        if let Some(job) = self.cached(id) {
            return Ok(job);
        }

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.inner.pool)
            .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(FleetError::not_found(format!("job '{}'", id))),
        }
    }

    fn cached(&self, id: &str) -> Option<Job> {
        let state = self.inner.state.lock();
        state.jobs.get(id).map(|e| e.job.clone())
    }

    /// Wait until the job is terminal and return its final state.
    pub async fn wait(&self, id: &str) -> Result<Job> {
        let rx = {
            let state = self.inner.state.lock();
            state.jobs.get(id).map(|e| e.status_tx.subscribe())
        };

        if let Some(mut rx) = rx {
            // The sender is only dropped when a terminal job is purged.
            let _ = rx.wait_for(|status| status.is_terminal()).await;
        }

        self.poll(id).await
    }

    /// Id of the non-terminal job currently holding `target`, if any.
    pub fn active_job(&self, target: &str) -> Option<String> {
        self.inner.state.lock().active.get(target).cloned()
    }

    /// `Conflict` carrying the active job's id when `target` is held.
    ///
    /// Submissions call this before their registry lookups: the row a job
    /// creates does not exist until that job finishes.
    pub fn ensure_idle(&self, target: &str) -> Result<()> {
        match self.active_job(target) {
            Some(existing) => Err(FleetError::job_conflict(
                format!("a job is already active for '{}'", target),
                existing,
            )),
            None => Ok(()),
        }
    }

    /// Jobs matching `filter`, newest first.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut sql = String::from("SELECT * FROM jobs WHERE 1 = 1");
        if filter.owner.is_some() {
            sql.push_str(" AND owner = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.target.is_some() {
            sql.push_str(" AND target = ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(owner) = &filter.owner {
            query = query.bind(owner);
        }
        if let Some(status) = &filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(target) = &filter.target {
            query = query.bind(target);
        }
        let limit = filter.limit.unwrap_or(100) as i64;
        let rows = query.bind(limit).fetch_all(&self.inner.pool).await?;

        // Prefer live in-memory state (progress is not persisted).
        rows.iter()
            .map(|row| {
                let job = job_from_row(row)?;
                Ok(self.cached(&job.id).unwrap_or(job))
            })
            .collect()
    }

    /// Remove terminal jobs completed before `now - older_than`.
    pub async fn purge_terminal(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());

        {
            let mut state = self.inner.state.lock();
            state.jobs.retain(|_, entry| {
                !(entry.job.status.is_terminal()
                    && entry.job.completed_at.is_some_and(|t| t < cutoff))
            });
        }

        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND completed_at < ?",
        )
        .bind(cutoff.timestamp())
        .execute(&self.inner.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Periodically purge terminal jobs older than `retention`.
    pub fn spawn_purger(&self, retention: Duration) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                match scheduler.purge_terminal(retention).await {
                    Ok(0) => {}
                    Ok(purged) => info!(purged, "purged old jobs"),
                    Err(err) => warn!(error = %err, "job purge failed"),
                }
            }
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        SchedulerStats {
            workers: self.inner.workers,
            idle_workers: self.inner.permits.available_permits(),
            active_targets: state.active.len(),
            tracked_jobs: state.jobs.len(),
        }
    }

    /// Jobs are not resumable mid-flight: anything left pending or running
    /// by a previous process is failed.
    async fn recover_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', completed_at = ?, error_kind = ?,
                error_message = 'interrupted by restart', error_code = 'interrupted'
            WHERE status IN ('pending', 'running')
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(ErrorKind::BackendFailure.as_str())
        .execute(&self.inner.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

async fn insert_job(pool: &SqlitePool, job: &Job) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO jobs (id, kind, target, owner, status, progress, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&job.id)
    .bind(job.kind.as_str())
    .bind(&job.target)
    .bind(&job.owner)
    .bind(job.status.as_str())
    .bind(job.progress as i64)
    .bind(job.created_at.timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

async fn update_job(pool: &SqlitePool, job: &Job) -> Result<()> {
    let result_json = job.result.as_ref().map(|v| v.to_string());
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = ?, progress = ?, message = ?, started_at = ?, completed_at = ?,
            result_json = ?, error_kind = ?, error_message = ?, error_code = ?
        WHERE id = ?
        "#,
    )
    .bind(job.status.as_str())
    .bind(job.progress as i64)
    .bind(&job.message)
    .bind(job.started_at.map(|t| t.timestamp()))
    .bind(job.completed_at.map(|t| t.timestamp()))
    .bind(result_json)
    .bind(job.error.as_ref().map(|e| e.kind.as_str()))
    .bind(job.error.as_ref().map(|e| e.message.clone()))
    .bind(job.error.as_ref().and_then(|e| e.code.clone()))
    .bind(&job.id)
    .execute(pool)
    .await?;
    Ok(())
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let started_at: Option<i64> = row.get("started_at");
    let completed_at: Option<i64> = row.get("completed_at");
    let result_json: Option<String> = row.get("result_json");
    let error_kind: Option<String> = row.get("error_kind");
    let progress: i64 = row.get("progress");

    let error = match error_kind {
        Some(kind) => Some(JobError {
            kind: ErrorKind::parse(&kind).unwrap_or(ErrorKind::Internal),
            message: row
                .get::<Option<String>, _>("error_message")
                .unwrap_or_default(),
            code: row.get("error_code"),
        }),
        None => None,
    };

    Ok(Job {
        id: row.get("id"),
        kind: JobKind::parse(&kind)
            .ok_or_else(|| FleetError::Internal(format!("unknown job kind '{}'", kind)))?,
        target: row.get("target"),
        owner: row.get("owner"),
        status: JobStatus::parse(&status)
            .ok_or_else(|| FleetError::Internal(format!("unknown job status '{}'", status)))?,
        progress: progress.clamp(0, 100) as u8,
        message: row.get("message"),
        created_at: ts_to_datetime(row.get("created_at")),
        started_at: started_at.map(ts_to_datetime),
        completed_at: completed_at.map(ts_to_datetime),
        result: result_json.map(|r| serde_json::from_str(&r)).transpose()?,
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;
    use tokio::sync::oneshot;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn duplicate_target_is_rejected_with_existing_id() {
        let scheduler = JobScheduler::open(memory_pool().await, 2).await.unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = scheduler
            .submit(JobKind::Refresh, "alpha", None, move |_ctx| async move {
                let _ = release_rx.await;
                Ok(serde_json::json!({}))
            })
            .await
            .unwrap();

        let err = scheduler
            .submit(JobKind::ChangeBranch, "alpha", None, |_ctx| async {
                Ok(serde_json::json!({}))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.existing_job_id(), Some(first.as_str()));

        release_tx.send(()).unwrap();
        let done = scheduler.wait(&first).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        // Slot is free again once terminal.
        let again = scheduler
            .submit(JobKind::Refresh, "alpha", None, |_ctx| async {
                Ok(serde_json::json!({}))
            })
            .await
            .unwrap();
        assert_ne!(again, first);
        scheduler.wait(&again).await.unwrap();
    }

    #[tokio::test]
    async fn failures_and_panics_become_failed_jobs() {
        let scheduler = JobScheduler::open(memory_pool().await, 1).await.unwrap();

        let failing = scheduler
            .submit(JobKind::Refresh, "beta", None, |_ctx| async {
                Err(FleetError::backend_with_code("fetch failed", "git"))
            })
            .await
            .unwrap();
        let job = scheduler.wait(&failing).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let err = job.error.unwrap();
        assert_eq!(err.kind, ErrorKind::BackendFailure);
        assert_eq!(err.code.as_deref(), Some("git"));

        let panicking = scheduler
            .submit(JobKind::Refresh, "gamma", None, |_ctx| async {
                let missing: Option<serde_json::Value> = None;
                Ok(missing.expect("boom"))
            })
            .await
            .unwrap();
        let job = scheduler.wait(&panicking).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().kind, ErrorKind::Internal);

        // The pool keeps working after a panic.
        let ok = scheduler
            .submit(JobKind::Refresh, "gamma", None, |ctx| async move {
                ctx.progress(50, "halfway");
                Ok(serde_json::json!({ "ok": true }))
            })
            .await
            .unwrap();
        let job = scheduler.wait(&ok).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
    }

    #[tokio::test]
    async fn concurrent_submissions_admit_exactly_one() {
        let scheduler = JobScheduler::open(memory_pool().await, 4).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move {
                s.submit(JobKind::Sync, "shared", None, |_ctx| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(serde_json::json!({}))
                })
                .await
            }));
        }

        let mut admitted = Vec::new();
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(id) => admitted.push(id),
                Err(e) => {
                    assert_eq!(e.kind(), ErrorKind::Conflict);
                    conflicts += 1;
                }
            }
        }
        assert_eq!(admitted.len(), 1);
        assert_eq!(conflicts, 15);
        scheduler.wait(&admitted[0]).await.unwrap();
    }

    #[tokio::test]
    async fn restart_fails_interrupted_jobs() {
        let pool = memory_pool().await;
        sqlx::query(
            "INSERT INTO jobs (id, kind, target, status, progress, created_at) \
             VALUES ('j-old', 'refresh', 'alpha', 'running', 40, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let scheduler = JobScheduler::open(pool, 1).await.unwrap();
        let job = scheduler.poll("j-old").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().code.as_deref(), Some("interrupted"));

        // The recovered target is free.
        let id = scheduler
            .submit(JobKind::Refresh, "alpha", None, |_ctx| async {
                Ok(serde_json::json!({}))
            })
            .await
            .unwrap();
        scheduler.wait(&id).await.unwrap();
    }

    #[tokio::test]
    async fn worker_limit_keeps_extra_jobs_pending() {
        let scheduler = JobScheduler::open(memory_pool().await, 1).await.unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let busy = scheduler
            .submit(JobKind::Refresh, "alpha", None, move |_ctx| async move {
                let _ = release_rx.await;
                Ok(serde_json::json!({}))
            })
            .await
            .unwrap();
        let queued = scheduler
            .submit(JobKind::Refresh, "beta", None, |_ctx| async {
                Ok(serde_json::json!({}))
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.poll(&busy).await.unwrap().status, JobStatus::Running);
        assert_eq!(scheduler.poll(&queued).await.unwrap().status, JobStatus::Pending);
        assert_eq!(scheduler.stats().idle_workers, 0);

        release_tx.send(()).unwrap();
        assert_eq!(
            scheduler.wait(&queued).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn list_filters_and_purge() {
        let scheduler = JobScheduler::open(memory_pool().await, 2).await.unwrap();
        for (target, owner) in [("alpha", None), ("dana/ws", Some("dana")), ("erin/ws", Some("erin"))] {
            let id = scheduler
                .submit(JobKind::Sync, target, owner, |_ctx| async {
                    Ok(serde_json::json!({}))
                })
                .await
                .unwrap();
            scheduler.wait(&id).await.unwrap();
        }

        let dana = scheduler
            .list(&JobFilter {
                owner: Some("dana".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(dana.len(), 1);
        assert_eq!(dana[0].target, "dana/ws");

        let completed = scheduler
            .list(&JobFilter {
                status: Some(JobStatus::Completed),
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(completed.len(), 2);

        // Nothing is old enough yet.
        assert_eq!(scheduler.purge_terminal(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(scheduler.purge_terminal(Duration::ZERO).await.unwrap(), 3);
        assert!(scheduler.list(&JobFilter::default()).await.unwrap().is_empty());
        assert_eq!(scheduler.stats().tracked_jobs, 0);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let scheduler = JobScheduler::open(memory_pool().await, 1).await.unwrap();
        let err = scheduler.poll("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
