//! The fleet facade.
//!
//! [`Fleet`] opens the database, wires the scheduler, lifecycle managers,
//! write-mode lock, aggregator, and result cache together, runs startup
//! recovery, and exposes every operation in a transport-agnostic shape.
//! Both the CLI and the HTTP server are thin layers over it.
//!
//! Mutating operations return an [`OpResponse`] as soon as their job is
//! admitted; callers poll or wait on the job id for the outcome.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::aggregate::{AggregationRequest, AggregationResponse, Aggregator};
use crate::backend::{BackendSet, IndexKind};
use crate::cache::{CacheLookup, CacheStats, ResultCache};
use crate::config::Config;
use crate::db;
use crate::error::{ErrorKind, FleetError, Result};
use crate::git::GitBackend;
use crate::golden::{AddRepoRequest, GoldenRepoManager, Indexer, RepoHealth};
use crate::health::IndexHealthProbe;
use crate::migrate::run_migrations;
use crate::models::{ActivatedWorkspace, GoldenRepository, Job};
use crate::refresh::{AutoRefresher, CycleReport};
use crate::registry::Registry;
use crate::scheduler::{JobFilter, JobScheduler, SchedulerStats};
use crate::snapshot::SnapshotStore;
use crate::workspace::{ActivateRequest, CompositeOp, WorkspaceManager};
use crate::write_mode::{ExitOutcome, LeaseInfo, WriteModeLock};

/// Result of submitting a mutating operation.
#[derive(Debug, Clone, Serialize)]
pub struct OpResponse {
    pub success: bool,
    /// The admitted job, or on a scheduler conflict the job already active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl OpResponse {
    fn submitted(result: Result<String>, what: &str) -> Self {
        match result {
            Ok(job_id) => Self {
                success: true,
                message: format!("{} submitted", what),
                job_id: Some(job_id),
                error: None,
                error_kind: None,
            },
            Err(err) => Self::failed(&err, what),
        }
    }

    fn failed(err: &FleetError, what: &str) -> Self {
        Self {
            success: false,
            job_id: err.existing_job_id().map(str::to_string),
            message: format!("{} rejected", what),
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetStats {
    pub golden_repos: usize,
    pub scheduler: SchedulerStats,
    pub cache: CacheStats,
    pub leases: Vec<LeaseInfo>,
    /// Retired snapshots kept alive by pinned readers.
    pub pinned_retired_snapshots: usize,
}

pub struct Fleet {
    config: Config,
    registry: Registry,
    scheduler: JobScheduler,
    write_mode: Arc<WriteModeLock>,
    golden: GoldenRepoManager,
    workspaces: WorkspaceManager,
    aggregator: Aggregator,
    cache: Arc<ResultCache>,
    refresher: AutoRefresher,
}

impl Fleet {
    /// Open (or create) the fleet described by `config` and recover from
    /// whatever a previous process left behind.
    pub async fn open(config: Config, git: Arc<dyn GitBackend>, backends: BackendSet) -> Result<Self> {
        let pool = db::connect(&config).await?;
        run_migrations(&pool).await?;

        let golden_root = config.storage.root.join("golden");
        let activated_root = config.storage.root.join("activated");
        std::fs::create_dir_all(&golden_root)?;
        std::fs::create_dir_all(&activated_root)?;

        let registry = Registry::new(pool.clone());
        let scheduler = JobScheduler::open(pool, config.scheduler.workers).await?;
        let snapshots = Arc::new(SnapshotStore::new(golden_root.clone()));
        let write_mode = Arc::new(WriteModeLock::new(golden_root));
        let health = Arc::new(IndexHealthProbe::new(Duration::from_secs(
            config.health.ttl_secs,
        )));
        let indexer = Indexer::new(Arc::new(backends), health, &config);

        let golden = GoldenRepoManager::new(
            &config,
            registry.clone(),
            scheduler.clone(),
            snapshots,
            git.clone(),
            indexer.clone(),
            write_mode.clone(),
        );
        golden.recover().await?;
        // Markers of removed repositories went with their storage.
        let leases = write_mode.load()?;

        let workspaces = WorkspaceManager::new(
            activated_root,
            registry.clone(),
            scheduler.clone(),
            golden.clone(),
            git,
            indexer.clone(),
        );
        let cache = Arc::new(ResultCache::new(&config.cache));
        let aggregator = Aggregator::new(
            &config,
            registry.clone(),
            golden.clone(),
            workspaces.clone(),
            indexer,
            cache.clone(),
        );
        let refresher = AutoRefresher::new(&config, golden.clone(), write_mode.clone());

        info!(
            storage = %config.storage.root.display(),
            workers = config.scheduler.workers,
            leases,
            "fleet opened"
        );

        Ok(Self {
            config,
            registry,
            scheduler,
            write_mode,
            golden,
            workspaces,
            aggregator,
            cache,
            refresher,
        })
    }

    /// Start the cache sweeper, the job purger, and the automatic refresh
    /// cycle when it is enabled.
    pub fn start_background(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = vec![
            self.cache
                .spawn_sweeper(Duration::from_secs(self.config.cache.sweep_interval_secs)),
            self.scheduler.spawn_purger(Duration::from_secs(
                self.config.scheduler.job_retention_hours * 3600,
            )),
        ];
        if let Some(task) = self.refresher.clone().spawn() {
            tasks.push(task);
        }
        tasks
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════════
    // Golden repositories
    // ═══════════════════════════════════════════════════════════════════

    pub async fn add_golden(&self, req: AddRepoRequest) -> OpResponse {
        OpResponse::submitted(self.golden.add_repo(req).await, "add_repo")
    }

    pub async fn refresh_golden(&self, alias: &str) -> OpResponse {
        OpResponse::submitted(self.golden.refresh(alias).await, "refresh")
    }

    pub async fn change_branch(&self, alias: &str, branch: &str) -> OpResponse {
        OpResponse::submitted(
            self.golden.change_branch(alias, branch).await,
            "change_branch",
        )
    }

    pub async fn reindex_golden(&self, alias: &str) -> OpResponse {
        OpResponse::submitted(self.golden.reindex(alias).await, "reindex")
    }

    pub async fn add_index(&self, alias: &str, kind: IndexKind) -> OpResponse {
        OpResponse::submitted(self.golden.add_index(alias, kind).await, "add_index")
    }

    pub async fn remove_golden(&self, alias: &str) -> OpResponse {
        OpResponse::submitted(self.golden.remove(alias).await, "remove_repo")
    }

    pub async fn list_golden(&self) -> Result<Vec<GoldenRepository>> {
        self.golden.list().await
    }

    pub async fn get_golden(&self, alias: &str) -> Result<GoldenRepository> {
        self.golden.get(alias).await
    }

    pub async fn golden_health(&self, alias: &str, force: bool) -> Result<RepoHealth> {
        self.golden.health(alias, force).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Write mode
    // ═══════════════════════════════════════════════════════════════════

    pub async fn enter_write_mode(&self, alias: &str) -> Result<LeaseInfo> {
        let repo = self.registry.require_golden(alias).await?;
        if !repo.write_exception {
            return Err(FleetError::validation(format!(
                "golden repository '{}' does not accept write mode",
                alias
            )));
        }
        self.write_mode.enter(alias)
    }

    /// Blocks until the refresh that closes the session is terminal.
    pub async fn exit_write_mode(&self, alias: &str) -> Result<ExitOutcome> {
        self.registry.require_golden(alias).await?;
        self.write_mode.exit(alias, &self.golden).await
    }

    pub fn write_mode_leases(&self) -> Vec<LeaseInfo> {
        self.write_mode.leases()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Activated workspaces
    // ═══════════════════════════════════════════════════════════════════

    pub async fn activate(&self, req: ActivateRequest) -> OpResponse {
        OpResponse::submitted(self.workspaces.activate(req).await, "activate")
    }

    pub async fn deactivate(&self, owner: &str, user_alias: &str) -> OpResponse {
        OpResponse::submitted(
            self.workspaces.deactivate(owner, user_alias).await,
            "deactivate",
        )
    }

    pub async fn sync_workspace(&self, owner: &str, user_alias: &str) -> OpResponse {
        OpResponse::submitted(self.workspaces.sync(owner, user_alias).await, "sync")
    }

    pub async fn switch_branch(&self, owner: &str, user_alias: &str, branch: &str) -> OpResponse {
        OpResponse::submitted(
            self.workspaces.switch_branch(owner, user_alias, branch).await,
            "switch_branch",
        )
    }

    pub async fn manage_composite(
        &self,
        op: CompositeOp,
        owner: &str,
        user_alias: &str,
        golden_aliases: Vec<String>,
    ) -> OpResponse {
        OpResponse::submitted(
            self.workspaces
                .manage_composite(op, owner, user_alias, golden_aliases)
                .await,
            "composite_update",
        )
    }

    pub async fn list_workspaces(&self, owner: &str) -> Result<Vec<ActivatedWorkspace>> {
        self.workspaces.list(owner).await
    }

    pub async fn get_workspace(&self, owner: &str, user_alias: &str) -> Result<ActivatedWorkspace> {
        self.workspaces.get(owner, user_alias).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Jobs
    // ═══════════════════════════════════════════════════════════════════

    pub async fn poll_job(&self, id: &str) -> Result<Job> {
        self.scheduler.poll(id).await
    }

    pub async fn wait_job(&self, id: &str) -> Result<Job> {
        self.scheduler.wait(id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.scheduler.list(filter).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Queries and cache
    // ═══════════════════════════════════════════════════════════════════

    pub async fn query(&self, req: AggregationRequest) -> Result<AggregationResponse> {
        self.aggregator.query(req).await
    }

    pub fn cache_page(&self, handle: &str, page: usize) -> Result<CacheLookup> {
        self.cache.get(handle, page)
    }

    /// One automatic refresh pass, regardless of whether the cycle runs.
    pub async fn run_refresh_cycle(&self) -> Result<CycleReport> {
        self.refresher.run_once().await
    }

    pub async fn stats(&self) -> Result<FleetStats> {
        Ok(FleetStats {
            golden_repos: self.golden.list().await?.len(),
            scheduler: self.scheduler.stats(),
            cache: self.cache.stats(),
            leases: self.write_mode.leases(),
            pinned_retired_snapshots: self.golden.snapshots().pinned_retired(),
        })
    }
}
