//! Multi-repository query aggregation.
//!
//! A request names its repositories with a [`RepoSelector`]. The selector
//! is resolved against the registry, the backend operation runs for every
//! resolved repository in its own task (bounded by `max_concurrency`), and
//! the per-repository outcomes are merged:
//!
//! - `global`: all items sorted by score, descending, truncated to `limit`
//! - `per_repo`: `limit` split evenly over the repositories that answered,
//!   remainder to the earliest-resolved ones, unused slots passed on
//!
//! `limit` always bounds the total. A repository that fails is reported in
//! `errors` and never affects the others.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::backend::{index_dir, IndexKind, QueryParams, RankedItem};
use crate::cache::ResultCache;
use crate::config::Config;
use crate::error::{FleetError, Result};
use crate::files::{build_globset, content_excludes, walk_files};
use crate::golden::{GoldenRepoManager, Indexer};
use crate::registry::Registry;
use crate::selector::{resolve, RepoSelector, Target, TargetKind};
use crate::workspace::WorkspaceManager;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    #[default]
    Global,
    PerRepo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOperation {
    #[default]
    Search,
    /// `query` is a glob over repository paths; empty lists everything.
    ListFiles,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationRequest {
    pub repos: RepoSelector,
    #[serde(default)]
    pub mode: AggregationMode,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub operation: QueryOperation,
    /// Index kind searched; `full_text` when absent.
    #[serde(default)]
    pub kind: Option<IndexKind>,
    /// Include this owner's activated workspaces as candidates.
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryItem {
    pub repo: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    pub score: f64,
    /// Full content, or a preview when `cache_handle` is set.
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_handle: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationResponse {
    pub success: bool,
    pub mode: AggregationMode,
    pub results: Vec<QueryItem>,
    pub total_results: usize,
    pub repos_queried: Vec<String>,
    pub errors: BTreeMap<String, String>,
    pub partial_failure: bool,
}

/// A repository's items, in resolution order.
struct RepoHits {
    alias: String,
    items: Vec<RankedItem>,
}

#[derive(Clone)]
pub struct Aggregator {
    registry: Registry,
    golden: GoldenRepoManager,
    workspaces: WorkspaceManager,
    indexer: Indexer,
    cache: Arc<ResultCache>,
    default_limit: usize,
    max_limit: usize,
    max_concurrency: usize,
    preview_chars: usize,
}

impl Aggregator {
    pub fn new(
        config: &Config,
        registry: Registry,
        golden: GoldenRepoManager,
        workspaces: WorkspaceManager,
        indexer: Indexer,
        cache: Arc<ResultCache>,
    ) -> Self {
        Self {
            registry,
            golden,
            workspaces,
            indexer,
            cache,
            default_limit: config.aggregation.default_limit,
            max_limit: config.aggregation.max_limit,
            max_concurrency: config.aggregation.max_concurrency.max(1),
            preview_chars: config.cache.preview_chars,
        }
    }

    pub async fn query(&self, req: AggregationRequest) -> Result<AggregationResponse> {
        let limit = req.limit.unwrap_or(self.default_limit);
        if limit == 0 || limit > self.max_limit {
            return Err(FleetError::validation(format!(
                "limit must be between 1 and {}",
                self.max_limit
            )));
        }
        if req.operation == QueryOperation::Search && req.query.trim().is_empty() {
            return Err(FleetError::validation("query must not be empty"));
        }
        if req.operation == QueryOperation::ListFiles && !req.query.is_empty() {
            build_globset(&[req.query.clone()])?;
        }

        let golden: Vec<String> = self
            .registry
            .list_golden()
            .await?
            .into_iter()
            .map(|r| r.alias)
            .collect();
        let workspaces: Option<(String, Vec<String>)> = match &req.owner {
            Some(owner) => Some((
                owner.clone(),
                self.registry
                    .list_workspaces(owner)
                    .await?
                    .into_iter()
                    .map(|w| w.user_alias)
                    .collect(),
            )),
            None => None,
        };
        let resolution = resolve(
            &req.repos,
            &golden,
            workspaces
                .as_ref()
                .map(|(owner, aliases)| (owner.as_str(), aliases.as_slice())),
        )?;

        let mut errors: BTreeMap<String, String> = resolution
            .unknown
            .iter()
            .map(|a| (a.clone(), format!("not found: repository '{}'", a)))
            .collect();
        let repos_queried: Vec<String> =
            resolution.targets.iter().map(|t| t.alias.clone()).collect();

        let kind = req.kind.unwrap_or(IndexKind::FullText);
        let params = QueryParams {
            text: req.query.clone(),
            limit,
        };
        let outcomes = self
            .fan_out(resolution.targets, req.operation, kind, params)
            .await;

        let mut answered = Vec::new();
        for (alias, outcome) in outcomes {
            match outcome {
                Ok(items) => answered.push(RepoHits { alias, items }),
                Err(err) => {
                    warn!(repo = %alias, error = %err, "repository failed during aggregation");
                    errors.insert(alias, err.to_string());
                }
            }
        }

        let merged = match req.mode {
            AggregationMode::Global => merge_global(answered, limit),
            AggregationMode::PerRepo => merge_per_repo(answered, limit),
        };
        let results: Vec<QueryItem> = merged
            .into_iter()
            .map(|(repo, item)| self.finish_item(repo, item))
            .collect();

        Ok(AggregationResponse {
            success: true,
            mode: req.mode,
            total_results: results.len(),
            results,
            repos_queried,
            partial_failure: !errors.is_empty(),
            errors,
        })
    }

    /// Run the operation for every target concurrently. Outcomes come back
    /// in target order.
    async fn fan_out(
        &self,
        targets: Vec<Target>,
        operation: QueryOperation,
        kind: IndexKind,
        params: QueryParams,
    ) -> Vec<(String, Result<Vec<RankedItem>>)> {
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut handles = Vec::with_capacity(targets.len());

        for target in targets {
            let this = self.clone();
            let permits = permits.clone();
            let params = params.clone();
            let alias = target.alias.clone();
            let handle = tokio::spawn(async move {
                let _permit = permits.acquire().await;
                this.query_one(&target, operation, kind, &params).await
            });
            handles.push((alias, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (alias, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(FleetError::Internal(format!(
                    "query task failed: {}",
                    join_err
                ))),
            };
            debug!(repo = %alias, ok = outcome.is_ok(), "repository answered");
            outcomes.push((alias, outcome));
        }
        outcomes
    }

    async fn query_one(
        &self,
        target: &Target,
        operation: QueryOperation,
        kind: IndexKind,
        params: &QueryParams,
    ) -> Result<Vec<RankedItem>> {
        // Holding the pinned snapshot keeps the whole read on one version.
        let (root, kinds, _pin) = match &target.kind {
            TargetKind::Golden => {
                let (repo, snapshot) = self.golden.pin(&target.alias).await?;
                (snapshot.path().to_path_buf(), repo.index_kinds, Some(snapshot))
            }
            TargetKind::Workspace { owner } => {
                let ws = self.workspaces.get(owner, &target.alias).await?;
                (ws.path, ws.index_kinds, None)
            }
        };

        match operation {
            QueryOperation::ListFiles => list_files(root, &params.text).await,
            QueryOperation::Search => {
                if !kinds.contains(&kind) {
                    return Err(FleetError::validation(format!(
                        "repository '{}' has no {} index",
                        target.alias, kind
                    )));
                }
                let backend = self.indexer.backends().require(kind)?;
                let dir = index_dir(&root, kind);
                let health = self.indexer.health().check(&backend.artifact(&dir), false);
                if !health.valid {
                    return Err(FleetError::backend_with_code(
                        format!(
                            "{} index of '{}' is unhealthy: {}",
                            kind,
                            target.alias,
                            health.errors.join("; ")
                        ),
                        "index_unhealthy",
                    ));
                }
                backend.query(&root, &dir, params).await
            }
        }
    }

    /// Move oversized content into the result cache, leaving a preview.
    fn finish_item(&self, repo: String, item: RankedItem) -> QueryItem {
        let (content, cache_handle) = match self.cache.put(&item.content) {
            Some(handle) => (
                item.content.chars().take(self.preview_chars).collect(),
                Some(handle),
            ),
            None => (item.content, None),
        };
        QueryItem {
            repo,
            path: item.path,
            line: item.line,
            score: item.score,
            content,
            cache_handle,
        }
    }
}

async fn list_files(root: PathBuf, pattern: &str) -> Result<Vec<RankedItem>> {
    let matcher = if pattern.is_empty() {
        None
    } else {
        Some(build_globset(&[pattern.to_string()])?)
    };
    tokio::task::spawn_blocking(move || {
        let excludes = content_excludes(&[])?;
        Ok(walk_files(&root, &excludes)?
            .into_iter()
            .filter(|(_, rel)| matcher.as_ref().map_or(true, |m| m.is_match(rel)))
            .map(|(_, rel)| RankedItem {
                path: rel,
                line: None,
                score: 0.0,
                content: String::new(),
            })
            .collect())
    })
    .await?
}

/// Every item, best score first, cut to `limit`. Ties keep resolution
/// order, then each repository's own order.
fn merge_global(answered: Vec<RepoHits>, limit: usize) -> Vec<(String, RankedItem)> {
    let mut all: Vec<(String, RankedItem)> = answered
        .into_iter()
        .flat_map(|hits| {
            let alias = hits.alias;
            hits.items
                .into_iter()
                .map(move |item| (alias.clone(), item))
        })
        .collect();
    all.sort_by(|a, b| {
        b.1.score
            .partial_cmp(&a.1.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    all.truncate(limit);
    all
}

/// Each repository's best items under the allocation from
/// [`allocate_per_repo`], grouped in resolution order.
fn merge_per_repo(answered: Vec<RepoHits>, limit: usize) -> Vec<(String, RankedItem)> {
    let available: Vec<usize> = answered.iter().map(|h| h.items.len()).collect();
    let allocation = allocate_per_repo(&available, limit);

    answered
        .into_iter()
        .zip(allocation)
        .flat_map(|(hits, take)| {
            let alias = hits.alias;
            hits.items
                .into_iter()
                .take(take)
                .map(move |item| (alias.clone(), item))
        })
        .collect()
}

/// Split `limit` over repositories holding `available[i]` items each.
///
/// Each round shares what is left evenly among repositories that still have
/// items, remainder first to the earliest ones. The total is exactly
/// `min(limit, sum(available))`.
pub fn allocate_per_repo(available: &[usize], limit: usize) -> Vec<usize> {
    let mut allocation = vec![0; available.len()];
    let mut remaining = limit.min(available.iter().sum());

    while remaining > 0 {
        let open: Vec<usize> = (0..available.len())
            .filter(|&i| allocation[i] < available[i])
            .collect();
        if open.is_empty() {
            break;
        }
        let share = remaining / open.len();
        let extra = remaining % open.len();
        for (rank, &i) in open.iter().enumerate() {
            let want = share + usize::from(rank < extra);
            let give = want.min(available[i] - allocation[i]);
            allocation[i] += give;
            remaining -= give;
        }
    }
    allocation
}
