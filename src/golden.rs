//! Golden repository lifecycle.
//!
//! Add, refresh, branch change, reindex, add-index, and removal all run as
//! scheduler jobs targeting the repository alias, so at most one of them
//! touches a given repository at a time.
//!
//! Refreshes and branch changes follow one protocol:
//!
//! 1. the scheduler slot for the alias is held (duplicates get Conflict)
//! 2. write-exception repositories consult the write-mode lock
//! 3. the mirror is fetched and the target branch verified on the remote
//! 4. a new snapshot is materialized from the mirror
//! 5. every index kind of the repository is rebuilt into the new snapshot
//!    and checked by the health probe
//! 6. the registry pointer is swapped by one `UPDATE`, then the in-memory
//!    store starts serving the new snapshot
//! 7. the old snapshot is reclaimed once no reader has it pinned
//!
//! A failure anywhere before step 6 discards the new snapshot and leaves
//! the repository `ready` on its previous snapshot with `last_error` set.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::backend::{index_dir, BackendSet, BuildOptions, IndexKind};
use crate::config::{Config, LeasePolicy};
use crate::error::{FleetError, Result};
use crate::files::INDEX_DIR_NAME;
use crate::git::GitBackend;
use crate::health::{HealthReport, IndexHealthProbe};
use crate::models::{
    validate_alias, validate_branch, GoldenRepository, GoldenStatus, Job, JobKind,
    SnapshotPointer,
};
use crate::registry::Registry;
use crate::scheduler::{JobContext, JobScheduler};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::write_mode::{LeaseGate, RefreshRunner, WriteModeLock};

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddRepoRequest {
    pub url: String,
    pub alias: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub enable_temporal: bool,
    #[serde(default)]
    pub temporal_options: Option<serde_json::Value>,
    #[serde(default)]
    pub write_exception: bool,
    /// Defaults to `[indexing] default_kinds`.
    #[serde(default)]
    pub index_kinds: Option<Vec<IndexKind>>,
}

impl AddRepoRequest {
    pub fn new(url: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            alias: alias.into(),
            branch: default_branch(),
            category: None,
            enable_temporal: false,
            temporal_options: None,
            write_exception: false,
            index_kinds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoHealth {
    pub alias: String,
    pub generation: Option<u64>,
    pub healthy: bool,
    pub indexes: BTreeMap<IndexKind, HealthReport>,
}

/// Builds index kinds into a tree and verifies each artifact.
///
/// Shared by golden snapshots and activated workspaces.
#[derive(Clone)]
pub struct Indexer {
    backends: Arc<BackendSet>,
    health: Arc<IndexHealthProbe>,
    exclude_globs: Vec<String>,
    max_file_bytes: u64,
}

impl Indexer {
    pub fn new(backends: Arc<BackendSet>, health: Arc<IndexHealthProbe>, config: &Config) -> Self {
        Self {
            backends,
            health,
            exclude_globs: config.indexing.exclude_globs.clone(),
            max_file_bytes: config.indexing.max_file_bytes,
        }
    }

    pub fn backends(&self) -> &BackendSet {
        &self.backends
    }

    pub fn health(&self) -> &IndexHealthProbe {
        &self.health
    }

    fn options(&self, temporal_options: Option<&serde_json::Value>) -> BuildOptions {
        BuildOptions {
            exclude_globs: self.exclude_globs.clone(),
            max_file_bytes: self.max_file_bytes,
            temporal_options: temporal_options.cloned(),
        }
    }

    /// Full build of `kinds` under `root`. Returns element counts per kind.
    pub async fn build_all(
        &self,
        root: &Path,
        kinds: &[IndexKind],
        temporal_options: Option<&serde_json::Value>,
    ) -> Result<BTreeMap<IndexKind, u64>> {
        let options = self.options(temporal_options);
        let mut counts = BTreeMap::new();
        for &kind in kinds {
            let backend = self.backends.require(kind)?;
            let dir = index_dir(root, kind);
            let report = backend.build(root, &dir, &options).await?;
            self.verify(&backend.artifact(&dir), kind)?;
            counts.insert(kind, report.elements);
        }
        Ok(counts)
    }

    /// Incremental update of `kinds` after `changed` paths moved.
    pub async fn update_all(
        &self,
        root: &Path,
        kinds: &[IndexKind],
        changed: &[String],
    ) -> Result<BTreeMap<IndexKind, u64>> {
        let options = self.options(None);
        let mut counts = BTreeMap::new();
        for &kind in kinds {
            let backend = self.backends.require(kind)?;
            let dir = index_dir(root, kind);
            let report = backend.update(root, &dir, changed, &options).await?;
            self.verify(&backend.artifact(&dir), kind)?;
            counts.insert(kind, report.elements);
        }
        Ok(counts)
    }

    fn verify(&self, artifact: &Path, kind: IndexKind) -> Result<()> {
        let report = self.health.check(artifact, true);
        if report.valid {
            return Ok(());
        }
        Err(FleetError::backend_with_code(
            format!(
                "{} index failed validation: {}",
                kind,
                report.errors.join("; ")
            ),
            "index_invalid",
        ))
    }

    /// Health of each kind's artifact under `root`.
    pub fn check(
        &self,
        root: &Path,
        kinds: &[IndexKind],
        force: bool,
    ) -> BTreeMap<IndexKind, HealthReport> {
        kinds
            .iter()
            .map(|&kind| {
                let report = match self.backends.get(kind) {
                    Some(backend) => self
                        .health
                        .check(&backend.artifact(&index_dir(root, kind)), force),
                    None => HealthReport {
                        errors: vec![format!("no index backend registered for '{}'", kind)],
                        ..Default::default()
                    },
                };
                (kind, report)
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct GoldenRepoManager {
    registry: Registry,
    scheduler: JobScheduler,
    snapshots: Arc<SnapshotStore>,
    git: Arc<dyn GitBackend>,
    indexer: Indexer,
    write_mode: Arc<WriteModeLock>,
    lease_policy: LeasePolicy,
    defer_timeout: Duration,
    default_kinds: Vec<IndexKind>,
}

impl GoldenRepoManager {
    pub fn new(
        config: &Config,
        registry: Registry,
        scheduler: JobScheduler,
        snapshots: Arc<SnapshotStore>,
        git: Arc<dyn GitBackend>,
        indexer: Indexer,
        write_mode: Arc<WriteModeLock>,
    ) -> Self {
        Self {
            registry,
            scheduler,
            snapshots,
            git,
            indexer,
            write_mode,
            lease_policy: config.write_mode.on_refresh,
            defer_timeout: Duration::from_secs(config.write_mode.defer_timeout_secs),
            default_kinds: config.indexing.kinds(),
        }
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    // ═══════════════════════════════════════════════════════════════════
    // Submissions
    // ═══════════════════════════════════════════════════════════════════

    pub async fn add_repo(&self, req: AddRepoRequest) -> Result<String> {
        validate_alias(&req.alias)?;
        validate_branch(&req.branch)?;
        if req.url.trim().is_empty() {
            return Err(FleetError::validation("url must not be empty"));
        }

        let mut kinds = req.index_kinds.clone().unwrap_or_else(|| self.default_kinds.clone());
        if req.enable_temporal && !kinds.contains(&IndexKind::Temporal) {
            kinds.push(IndexKind::Temporal);
        }
        kinds.sort();
        kinds.dedup();
        if kinds.is_empty() {
            return Err(FleetError::validation("at least one index kind is required"));
        }
        for &kind in &kinds {
            if !self.indexer.backends().contains(kind) {
                return Err(FleetError::validation(format!(
                    "no index backend registered for '{}'",
                    kind
                )));
            }
        }

        self.scheduler.ensure_idle(&req.alias)?;
        if self.registry.get_golden(&req.alias).await?.is_some() {
            return Err(FleetError::conflict(format!(
                "golden repository '{}' already exists",
                req.alias
            )));
        }

        let repo = GoldenRepository {
            alias: req.alias.clone(),
            url: req.url,
            branch: req.branch,
            category: req.category,
            enable_temporal: req.enable_temporal,
            temporal_options: req.temporal_options,
            write_exception: req.write_exception,
            index_kinds: kinds,
            status: GoldenStatus::Indexing,
            snapshot: None,
            last_refresh: None,
            last_error: None,
            created_at: Utc::now(),
        };

        let manager = self.clone();
        self.scheduler
            .submit(JobKind::AddRepo, &req.alias, None, move |ctx| async move {
                manager.run_add(ctx, repo).await
            })
            .await
    }

    pub async fn refresh(&self, alias: &str) -> Result<String> {
        self.submit_update(JobKind::Refresh, alias, None, None).await
    }

    pub async fn change_branch(&self, alias: &str, branch: &str) -> Result<String> {
        validate_branch(branch)?;
        self.submit_update(JobKind::ChangeBranch, alias, Some(branch.to_string()), None)
            .await
    }

    async fn submit_update(
        &self,
        kind: JobKind,
        alias: &str,
        branch: Option<String>,
        lease_marker: Option<String>,
    ) -> Result<String> {
        self.scheduler.ensure_idle(alias)?;
        let repo = self.registry.require_golden(alias).await?;
        self.require_served(&repo)?;

        let manager = self.clone();
        let alias_owned = alias.to_string();
        self.scheduler
            .submit(kind, alias, None, move |ctx| async move {
                manager
                    .run_update(ctx, &alias_owned, branch, lease_marker)
                    .await
            })
            .await
    }

    pub async fn reindex(&self, alias: &str) -> Result<String> {
        self.scheduler.ensure_idle(alias)?;
        let repo = self.registry.require_golden(alias).await?;
        self.require_served(&repo)?;

        let manager = self.clone();
        let alias_owned = alias.to_string();
        self.scheduler
            .submit(JobKind::Reindex, alias, None, move |ctx| async move {
                manager.run_reindex(ctx, &alias_owned).await
            })
            .await
    }

    pub async fn add_index(&self, alias: &str, kind: IndexKind) -> Result<String> {
        self.scheduler.ensure_idle(alias)?;
        let repo = self.registry.require_golden(alias).await?;
        self.require_served(&repo)?;
        if repo.index_kinds.contains(&kind) {
            return Err(FleetError::validation(format!(
                "golden repository '{}' already has a {} index",
                alias, kind
            )));
        }
        self.indexer.backends().require(kind)?;

        let manager = self.clone();
        let alias_owned = alias.to_string();
        self.scheduler
            .submit(JobKind::AddIndex, alias, None, move |ctx| async move {
                manager.run_add_index(ctx, &alias_owned, kind).await
            })
            .await
    }

    pub async fn remove(&self, alias: &str) -> Result<String> {
        self.scheduler.ensure_idle(alias)?;
        self.registry.require_golden(alias).await?;
        if self.write_mode.lease(alias).is_some() {
            return Err(FleetError::conflict(format!(
                "golden repository '{}' is in write mode; exit it before removing",
                alias
            )));
        }

        let manager = self.clone();
        let alias_owned = alias.to_string();
        self.scheduler
            .submit(JobKind::RemoveRepo, alias, None, move |_ctx| async move {
                manager.run_remove(&alias_owned).await
            })
            .await
    }

    fn require_served(&self, repo: &GoldenRepository) -> Result<()> {
        if repo.snapshot.is_none() {
            return Err(FleetError::conflict(format!(
                "golden repository '{}' is not ready yet",
                repo.alias
            )));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════

    pub async fn list(&self) -> Result<Vec<GoldenRepository>> {
        self.registry.list_golden().await
    }

    pub async fn get(&self, alias: &str) -> Result<GoldenRepository> {
        self.registry.require_golden(alias).await
    }

    /// Pin the snapshot currently served for a ready repository.
    pub async fn pin(&self, alias: &str) -> Result<(GoldenRepository, Arc<Snapshot>)> {
        let repo = self.registry.require_golden(alias).await?;
        self.require_served(&repo)?;
        let snapshot = self.snapshots.pin(alias).ok_or_else(|| {
            FleetError::conflict(format!("golden repository '{}' is not ready yet", alias))
        })?;
        Ok((repo, snapshot))
    }

    pub async fn health(&self, alias: &str, force: bool) -> Result<RepoHealth> {
        let repo = self.registry.require_golden(alias).await?;
        let Some(snapshot) = self.snapshots.pin(alias) else {
            return Ok(RepoHealth {
                alias: repo.alias,
                generation: None,
                healthy: false,
                indexes: BTreeMap::new(),
            });
        };

        let indexes = self.indexer.check(snapshot.path(), &repo.index_kinds, force);
        Ok(RepoHealth {
            alias: repo.alias,
            generation: Some(snapshot.generation()),
            healthy: indexes.values().all(|r| r.valid),
            indexes,
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // Job bodies
    // ═══════════════════════════════════════════════════════════════════

    async fn run_add(&self, ctx: JobContext, repo: GoldenRepository) -> Result<serde_json::Value> {
        self.registry.insert_golden(&repo).await?;

        match self.build_new(&ctx, &repo).await {
            Ok(value) => Ok(value),
            Err(err) => {
                // An add that never produced a snapshot leaves nothing behind.
                if let Err(e) = self.registry.delete_golden(&repo.alias).await {
                    warn!(alias = %repo.alias, error = %e, "failed to remove row of failed add");
                }
                self.remove_storage(&repo.alias);
                Err(err)
            }
        }
    }

    async fn build_new(&self, ctx: &JobContext, repo: &GoldenRepository) -> Result<serde_json::Value> {
        let mirror = self.snapshots.mirror_dir(&repo.alias);
        if mirror.exists() {
            tokio::fs::remove_dir_all(&mirror).await?;
        }

        ctx.progress(10, format!("cloning {}", repo.url));
        self.git.clone_repo(&repo.url, &repo.branch, &mirror).await?;

        ctx.progress(40, "materializing snapshot");
        let pointer = self.materialize(&repo.alias, mirror).await?;

        ctx.progress(60, "building indexes");
        let counts = match self
            .indexer
            .build_all(&pointer.path, &repo.index_kinds, repo.temporal_options.as_ref())
            .await
        {
            Ok(counts) => counts,
            Err(err) => {
                self.snapshots.discard(&pointer);
                return Err(err);
            }
        };

        self.commit(&repo.alias, &pointer, &repo.branch).await?;
        info!(alias = %repo.alias, generation = pointer.generation, "golden repository ready");

        Ok(json!({
            "alias": repo.alias,
            "branch": repo.branch,
            "generation": pointer.generation,
            "indexes": counts,
        }))
    }

    async fn run_update(
        &self,
        ctx: JobContext,
        alias: &str,
        branch: Option<String>,
        lease_marker: Option<String>,
    ) -> Result<serde_json::Value> {
        let repo = self.registry.require_golden(alias).await?;
        self.registry
            .set_golden_status(alias, GoldenStatus::Refreshing, repo.last_error.as_deref())
            .await?;

        match self.update_snapshot(&ctx, &repo, branch, lease_marker).await {
            Ok(value) => Ok(value),
            Err(err) => {
                // Back to the last good snapshot; pointer and last_refresh untouched.
                self.registry
                    .set_golden_status(alias, GoldenStatus::Ready, Some(&err.to_string()))
                    .await?;
                Err(err)
            }
        }
    }

    async fn update_snapshot(
        &self,
        ctx: &JobContext,
        repo: &GoldenRepository,
        branch: Option<String>,
        lease_marker: Option<String>,
    ) -> Result<serde_json::Value> {
        let alias = repo.alias.as_str();
        let target_branch = branch.unwrap_or_else(|| repo.branch.clone());

        if repo.write_exception {
            ctx.progress(5, "checking write-mode lease");
            self.check_lease(alias, lease_marker.as_deref()).await?;
        }

        let mirror = self.snapshots.mirror_dir(alias);
        ctx.progress(15, "fetching");
        self.git.fetch(&mirror).await?;
        if !self.git.verify_branch_exists(&mirror, &target_branch).await? {
            return Err(FleetError::not_found(format!(
                "branch '{}' on the remote of '{}'",
                target_branch, alias
            )));
        }
        self.git.checkout(&mirror, &target_branch).await?;

        ctx.progress(35, "materializing snapshot");
        let pointer = self.materialize(alias, mirror).await?;

        ctx.progress(55, "building indexes");
        let counts = match self
            .indexer
            .build_all(&pointer.path, &repo.index_kinds, repo.temporal_options.as_ref())
            .await
        {
            Ok(counts) => counts,
            Err(err) => {
                self.snapshots.discard(&pointer);
                return Err(err);
            }
        };

        let commit = self.git.head_commit(&pointer.path).await.ok();
        self.commit(alias, &pointer, &target_branch).await?;

        Ok(json!({
            "alias": alias,
            "branch": target_branch,
            "generation": pointer.generation,
            "commit": commit,
            "indexes": counts,
        }))
    }

    async fn run_reindex(&self, ctx: JobContext, alias: &str) -> Result<serde_json::Value> {
        let (repo, current) = self.pin(alias).await?;
        self.registry
            .set_golden_status(alias, GoldenStatus::Refreshing, repo.last_error.as_deref())
            .await?;

        let result: Result<serde_json::Value> = async {
            ctx.progress(20, "materializing snapshot");
            let pointer = self.materialize(alias, current.path().to_path_buf()).await?;
            drop(current);

            ctx.progress(50, "rebuilding indexes");
            let counts = match self
                .indexer
                .build_all(&pointer.path, &repo.index_kinds, repo.temporal_options.as_ref())
                .await
            {
                Ok(counts) => counts,
                Err(err) => {
                    self.snapshots.discard(&pointer);
                    return Err(err);
                }
            };

            self.commit(alias, &pointer, &repo.branch).await?;
            Ok(json!({
                "alias": alias,
                "generation": pointer.generation,
                "indexes": counts,
            }))
        }
        .await;

        if let Err(err) = &result {
            self.registry
                .set_golden_status(alias, GoldenStatus::Ready, Some(&err.to_string()))
                .await?;
        }
        result
    }

    async fn run_add_index(
        &self,
        ctx: JobContext,
        alias: &str,
        kind: IndexKind,
    ) -> Result<serde_json::Value> {
        let (repo, snapshot) = self.pin(alias).await?;

        ctx.progress(30, format!("building {} index", kind));
        let counts = self
            .indexer
            .build_all(snapshot.path(), &[kind], repo.temporal_options.as_ref())
            .await?;

        let mut kinds = repo.index_kinds.clone();
        kinds.push(kind);
        kinds.sort();
        self.registry.set_index_kinds(alias, &kinds).await?;
        info!(alias, kind = kind.as_str(), "index added");

        Ok(json!({
            "alias": alias,
            "kind": kind,
            "elements": counts.get(&kind).copied().unwrap_or(0),
        }))
    }

    async fn run_remove(&self, alias: &str) -> Result<serde_json::Value> {
        if !self.registry.delete_golden(alias).await? {
            return Err(FleetError::not_found(format!("golden repository '{}'", alias)));
        }
        self.write_mode.forget(alias);
        self.snapshots.remove_alias(alias);
        self.indexer.health().invalidate_prefix(&self.snapshots.alias_dir(alias));
        self.remove_storage(alias);
        info!(alias, "golden repository removed");
        Ok(json!({ "alias": alias, "removed": true }))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Protocol steps
    // ═══════════════════════════════════════════════════════════════════

    async fn check_lease(&self, alias: &str, marker: Option<&str>) -> Result<()> {
        let LeaseGate::Held(lease) = self.write_mode.gate(alias, marker) else {
            return Ok(());
        };

        match self.lease_policy {
            LeasePolicy::FailFast => Err(FleetError::conflict(format!(
                "write mode is active for '{}' (held {}s); refresh refused",
                alias, lease.age_secs
            ))),
            LeasePolicy::Defer => {
                info!(alias, "refresh deferred until write mode ends");
                if self.write_mode.wait_for_gate(alias, self.defer_timeout).await {
                    Ok(())
                } else {
                    Err(FleetError::conflict(format!(
                        "write mode for '{}' still active after {}s; refresh abandoned",
                        alias,
                        self.defer_timeout.as_secs()
                    )))
                }
            }
        }
    }

    async fn materialize(&self, alias: &str, source: std::path::PathBuf) -> Result<SnapshotPointer> {
        let snapshots = self.snapshots.clone();
        let alias = alias.to_string();
        tokio::task::spawn_blocking(move || {
            snapshots.materialize(&alias, &source, &[INDEX_DIR_NAME])
        })
        .await?
    }

    /// Swap the registry pointer, then serve the new snapshot.
    async fn commit(&self, alias: &str, pointer: &SnapshotPointer, branch: &str) -> Result<()> {
        if let Err(err) = self
            .registry
            .swap_snapshot(alias, pointer, branch, Utc::now())
            .await
        {
            self.snapshots.discard(pointer);
            return Err(err);
        }
        self.snapshots.install(alias, pointer);
        Ok(())
    }

    /// Best-effort removal of everything under the alias directory that no
    /// reader still has pinned.
    fn remove_storage(&self, alias: &str) {
        let mirror = self.snapshots.mirror_dir(alias);
        if mirror.exists() {
            if let Err(e) = std::fs::remove_dir_all(&mirror) {
                warn!(alias, error = %e, "failed to remove mirror");
            }
        }
        if let Err(e) = self.snapshots.reclaim_orphans(alias) {
            warn!(alias, error = %e, "failed to reclaim snapshots");
        }
        let dir = self.snapshots.alias_dir(alias);
        let _ = std::fs::remove_file(dir.join(crate::write_mode::MARKER_FILE));
        let _ = std::fs::remove_dir(self.snapshots.snapshots_dir(alias));
        let _ = std::fs::remove_dir(&dir);
    }

    /// Bring registry and storage back to a consistent state after a
    /// restart, then start serving every ready repository.
    pub async fn recover(&self) -> Result<()> {
        let repos = self.registry.list_golden().await?;
        let mut known = std::collections::HashSet::new();

        for repo in repos {
            match (&repo.snapshot, repo.status) {
                (None, _) => {
                    warn!(alias = %repo.alias, "removing repository whose add never finished");
                    self.registry.delete_golden(&repo.alias).await?;
                    self.remove_storage(&repo.alias);
                    continue;
                }
                (Some(_), GoldenStatus::Refreshing | GoldenStatus::Indexing) => {
                    warn!(alias = %repo.alias, "refresh interrupted by restart; keeping previous snapshot");
                    self.registry
                        .set_golden_status(
                            &repo.alias,
                            GoldenStatus::Ready,
                            Some("refresh interrupted by restart"),
                        )
                        .await?;
                }
                _ => {}
            }

            if let Some(pointer) = &repo.snapshot {
                self.snapshots.install(&repo.alias, pointer);
                let reclaimed = self.snapshots.reclaim_orphans(&repo.alias)?;
                if reclaimed > 0 {
                    info!(alias = %repo.alias, reclaimed, "reclaimed unreferenced snapshots");
                }
            }
            known.insert(repo.alias);
        }

        if let Ok(entries) = std::fs::read_dir(self.snapshots.root()) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.path().is_dir() && !known.contains(&name) {
                    warn!(alias = %name, "removing storage with no registry entry");
                    if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                        warn!(alias = %name, error = %e, "failed to remove orphaned storage");
                    }
                }
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl RefreshRunner for GoldenRepoManager {
    /// Submit a refresh that owns the lease and wait for it. If another job
    /// holds the slot, wait for that one first so the refresh that is
    /// waited on always starts after the session ended.
    async fn refresh_and_wait(&self, alias: &str, lease_marker: &str) -> Result<Job> {
        loop {
            match self
                .submit_update(
                    JobKind::Refresh,
                    alias,
                    None,
                    Some(lease_marker.to_string()),
                )
                .await
            {
                Ok(id) => return self.scheduler.wait(&id).await,
                Err(err) => match err.existing_job_id() {
                    Some(existing) => {
                        let existing = existing.to_string();
                        info!(alias, job_id = %existing, "waiting for active job before exit refresh");
                        self.scheduler.wait(&existing).await?;
                    }
                    None => return Err(err),
                },
            }
        }
    }
}
