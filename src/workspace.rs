//! Activated workspaces: per-user writable copies of golden repositories.
//!
//! A single workspace is a copy of one golden snapshot tree; a composite
//! keeps one subdirectory per component golden repository. Either way the
//! workspace's indexes are built over its whole root, so a composite's
//! index covers the union of its components.
//!
//! All mutations are jobs targeting `"<owner>/<user_alias>"`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::IndexKind;
use crate::error::{FleetError, Result};
use crate::files::{
    copy_tree, hidden_sibling, remove_dir_and_empty_parents, replace_dir, INDEX_DIR_NAME,
};
use crate::git::GitBackend;
use crate::golden::{GoldenRepoManager, Indexer};
use crate::models::{
    validate_alias, validate_branch, workspace_target, ActivatedWorkspace, JobKind,
};
use crate::registry::Registry;
use crate::scheduler::{JobContext, JobScheduler};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivateRequest {
    pub owner: String,
    #[serde(default)]
    pub golden_alias: Option<String>,
    #[serde(default)]
    pub golden_aliases: Option<Vec<String>>,
    #[serde(default)]
    pub user_alias: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeOp {
    Create,
    Update,
    Delete,
}

/// What an activation job builds.
#[derive(Debug, Clone)]
enum Layout {
    Single { golden: String, branch: Option<String> },
    Composite { components: Vec<String> },
}

#[derive(Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    registry: Registry,
    scheduler: JobScheduler,
    golden: GoldenRepoManager,
    git: Arc<dyn GitBackend>,
    indexer: Indexer,
}

impl WorkspaceManager {
    /// `root` is the activated storage directory (`<storage>/activated`).
    pub fn new(
        root: PathBuf,
        registry: Registry,
        scheduler: JobScheduler,
        golden: GoldenRepoManager,
        git: Arc<dyn GitBackend>,
        indexer: Indexer,
    ) -> Self {
        Self {
            root,
            registry,
            scheduler,
            golden,
            git,
            indexer,
        }
    }

    fn workspace_dir(&self, owner: &str, user_alias: &str) -> PathBuf {
        self.root.join(owner).join(user_alias)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Submissions
    // ═══════════════════════════════════════════════════════════════════

    pub async fn activate(&self, req: ActivateRequest) -> Result<String> {
        validate_alias(&req.owner)?;

        let (user_alias, layout) = match (req.golden_alias, req.golden_aliases) {
            (Some(_), Some(_)) => {
                return Err(FleetError::validation(
                    "supply either golden_alias or golden_aliases, not both",
                ))
            }
            (None, None) => {
                return Err(FleetError::validation(
                    "one of golden_alias or golden_aliases is required",
                ))
            }
            (Some(golden), None) => {
                if let Some(branch) = &req.branch {
                    validate_branch(branch)?;
                }
                let user_alias = req.user_alias.unwrap_or_else(|| golden.clone());
                (
                    user_alias,
                    Layout::Single {
                        golden,
                        branch: req.branch,
                    },
                )
            }
            (None, Some(aliases)) => {
                if req.branch.is_some() {
                    return Err(FleetError::validation(
                        "a branch cannot be selected for a composite workspace",
                    ));
                }
                let components = dedup(aliases);
                if components.len() < 2 {
                    return Err(FleetError::validation(
                        "a composite workspace needs at least two distinct golden repositories",
                    ));
                }
                let user_alias = req.user_alias.ok_or_else(|| {
                    FleetError::validation("user_alias is required for a composite workspace")
                })?;
                (user_alias, Layout::Composite { components })
            }
        };
        validate_alias(&user_alias)?;
        self.scheduler
            .ensure_idle(&workspace_target(&req.owner, &user_alias))?;

        let goldens = match &layout {
            Layout::Single { golden, .. } => vec![golden.clone()],
            Layout::Composite { components } => components.clone(),
        };
        for alias in &goldens {
            self.golden.pin(alias).await?;
        }

        if self
            .registry
            .get_workspace(&req.owner, &user_alias)
            .await?
            .is_some()
        {
            return Err(FleetError::conflict(format!(
                "workspace '{}' already exists for {}",
                user_alias, req.owner
            )));
        }

        let manager = self.clone();
        let owner = req.owner;
        let target = workspace_target(&owner, &user_alias);
        let job_owner = owner.clone();
        self.scheduler
            .submit(JobKind::Activate, &target, Some(&job_owner), move |ctx| async move {
                manager.run_activate(ctx, &owner, &user_alias, layout).await
            })
            .await
    }

    pub async fn deactivate(&self, owner: &str, user_alias: &str) -> Result<String> {
        self.scheduler
            .ensure_idle(&workspace_target(owner, user_alias))?;
        let ws = self.registry.require_workspace(owner, user_alias).await?;

        let manager = self.clone();
        self.scheduler
            .submit(JobKind::Deactivate, &ws.job_target(), Some(owner), move |_ctx| async move {
                manager.run_deactivate(&ws).await
            })
            .await
    }

    pub async fn sync(&self, owner: &str, user_alias: &str) -> Result<String> {
        self.scheduler
            .ensure_idle(&workspace_target(owner, user_alias))?;
        let ws = self.registry.require_workspace(owner, user_alias).await?;

        let manager = self.clone();
        self.scheduler
            .submit(JobKind::Sync, &ws.job_target(), Some(owner), move |ctx| async move {
                manager.run_sync(ctx, &ws.owner, &ws.user_alias).await
            })
            .await
    }

    pub async fn switch_branch(&self, owner: &str, user_alias: &str, branch: &str) -> Result<String> {
        validate_branch(branch)?;
        self.scheduler
            .ensure_idle(&workspace_target(owner, user_alias))?;
        let ws = self.registry.require_workspace(owner, user_alias).await?;
        if ws.is_composite {
            return Err(FleetError::validation(
                "branches cannot be switched on a composite workspace",
            ));
        }

        let manager = self.clone();
        let branch = branch.to_string();
        self.scheduler
            .submit(JobKind::SwitchBranch, &ws.job_target(), Some(owner), move |ctx| async move {
                manager
                    .run_switch_branch(ctx, &ws.owner, &ws.user_alias, &branch)
                    .await
            })
            .await
    }

    pub async fn manage_composite(
        &self,
        op: CompositeOp,
        owner: &str,
        user_alias: &str,
        golden_aliases: Vec<String>,
    ) -> Result<String> {
        match op {
            CompositeOp::Create => {
                self.activate(ActivateRequest {
                    owner: owner.to_string(),
                    golden_aliases: Some(golden_aliases),
                    user_alias: Some(user_alias.to_string()),
                    ..Default::default()
                })
                .await
            }
            CompositeOp::Delete => {
                self.require_composite(owner, user_alias).await?;
                self.deactivate(owner, user_alias).await
            }
            CompositeOp::Update => {
                let ws = self.require_composite(owner, user_alias).await?;
                let components = dedup(golden_aliases);
                if components.len() < 2 {
                    return Err(FleetError::conflict(format!(
                        "composite '{}' must keep at least two components",
                        user_alias
                    )));
                }
                for alias in &components {
                    self.golden.pin(alias).await?;
                }

                let manager = self.clone();
                self.scheduler
                    .submit(
                        JobKind::CompositeUpdate,
                        &ws.job_target(),
                        Some(owner),
                        move |ctx| async move {
                            manager
                                .run_composite_update(ctx, &ws.owner, &ws.user_alias, components)
                                .await
                        },
                    )
                    .await
            }
        }
    }

    async fn require_composite(&self, owner: &str, user_alias: &str) -> Result<ActivatedWorkspace> {
        self.scheduler
            .ensure_idle(&workspace_target(owner, user_alias))?;
        let ws = self.registry.require_workspace(owner, user_alias).await?;
        if !ws.is_composite {
            return Err(FleetError::validation(format!(
                "workspace '{}' is not a composite",
                user_alias
            )));
        }
        Ok(ws)
    }

    pub async fn list(&self, owner: &str) -> Result<Vec<ActivatedWorkspace>> {
        self.registry.list_workspaces(owner).await
    }

    pub async fn get(&self, owner: &str, user_alias: &str) -> Result<ActivatedWorkspace> {
        self.registry.require_workspace(owner, user_alias).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Job bodies
    // ═══════════════════════════════════════════════════════════════════

    async fn run_activate(
        &self,
        ctx: JobContext,
        owner: &str,
        user_alias: &str,
        layout: Layout,
    ) -> Result<serde_json::Value> {
        let path = self.workspace_dir(owner, user_alias);
        if path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }

        let result = self
            .build_workspace(&ctx, owner, user_alias, &path, layout)
            .await;
        if result.is_err() {
            if let Err(e) = remove_dir_and_empty_parents(&path, &self.root) {
                warn!(owner, user_alias, error = %e, "failed to clean up after failed activation");
            }
        }
        result
    }

    async fn build_workspace(
        &self,
        ctx: &JobContext,
        owner: &str,
        user_alias: &str,
        path: &Path,
        layout: Layout,
    ) -> Result<serde_json::Value> {
        let mut kinds = BTreeSet::new();
        let (golden_aliases, current_branch, is_composite) = match layout {
            Layout::Single { golden, branch } => {
                ctx.progress(10, format!("copying {}", golden));
                let (repo, snapshot) = self.golden.pin(&golden).await?;
                copy_snapshot(snapshot.path(), path).await?;
                drop(snapshot);
                kinds.extend(repo.index_kinds);

                let branch = match branch {
                    Some(branch) if branch != repo.branch => {
                        ctx.progress(30, format!("checking out {}", branch));
                        self.checkout_remote_branch(path, &branch).await?;
                        branch
                    }
                    _ => repo.branch,
                };
                (vec![golden], branch, false)
            }
            Layout::Composite { components } => {
                for (i, alias) in components.iter().enumerate() {
                    ctx.progress(
                        (10 + 40 * i / components.len()) as u8,
                        format!("copying {}", alias),
                    );
                    let (repo, snapshot) = self.golden.pin(alias).await?;
                    copy_snapshot(snapshot.path(), &path.join(alias)).await?;
                    kinds.extend(repo.index_kinds);
                }
                (components, String::new(), true)
            }
        };

        let mut ws = ActivatedWorkspace {
            owner: owner.to_string(),
            user_alias: user_alias.to_string(),
            golden_aliases,
            current_branch,
            is_composite,
            index_kinds: kinds.into_iter().collect(),
            path: path.to_path_buf(),
            created_at: Utc::now(),
            last_synced: None,
        };

        ctx.progress(60, "building indexes");
        let counts = self.indexer.build_all(path, &ws.index_kinds, None).await?;

        ws.last_synced = Some(Utc::now());
        self.registry.insert_workspace(&ws).await?;
        info!(owner, user_alias, composite = ws.is_composite, "workspace activated");

        Ok(json!({
            "owner": owner,
            "user_alias": user_alias,
            "golden_aliases": ws.golden_aliases,
            "branch": ws.current_branch,
            "indexes": counts,
        }))
    }

    async fn run_deactivate(&self, ws: &ActivatedWorkspace) -> Result<serde_json::Value> {
        if !self.registry.delete_workspace(&ws.owner, &ws.user_alias).await? {
            return Err(FleetError::not_found(format!(
                "workspace '{}' for {}",
                ws.user_alias, ws.owner
            )));
        }
        self.indexer.health().invalidate_prefix(&ws.path);

        let path = ws.path.clone();
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || remove_dir_and_empty_parents(&path, &root)).await??;

        info!(owner = %ws.owner, user_alias = %ws.user_alias, "workspace deactivated");
        Ok(json!({ "owner": ws.owner, "user_alias": ws.user_alias, "removed": true }))
    }

    /// Pull each component's current golden snapshot into the workspace,
    /// staying on the workspace's branch, then update indexes for the
    /// changed files only.
    async fn run_sync(&self, ctx: JobContext, owner: &str, user_alias: &str) -> Result<serde_json::Value> {
        let mut ws = self.registry.require_workspace(owner, user_alias).await?;
        let mut changed = Vec::new();

        for (i, alias) in ws.golden_aliases.iter().enumerate() {
            ctx.progress(
                (10 + 50 * i / ws.golden_aliases.len()) as u8,
                format!("pulling {}", alias),
            );
            let (repo, snapshot) = self.golden.pin(alias).await?;

            let (repo_dir, prefix, branch) = if ws.is_composite {
                (ws.path.join(alias), format!("{}/", alias), repo.branch.clone())
            } else {
                (ws.path.clone(), String::new(), ws.current_branch.clone())
            };
            let refspec = if branch == repo.branch {
                branch
            } else {
                format!("refs/remotes/origin/{}", branch)
            };

            let files = self
                .git
                .pull(&repo_dir, Some(snapshot.path()), &refspec)
                .await?;
            changed.extend(files.into_iter().map(|f| format!("{}{}", prefix, f)));
        }

        ctx.progress(70, format!("reindexing {} changed files", changed.len()));
        if !changed.is_empty() {
            self.indexer
                .update_all(&ws.path, &ws.index_kinds, &changed)
                .await?;
        }

        ws.last_synced = Some(Utc::now());
        self.registry.update_workspace(&ws).await?;

        Ok(json!({
            "owner": owner,
            "user_alias": user_alias,
            "branch": ws.current_branch,
            "changed_files": changed.len(),
        }))
    }

    async fn run_switch_branch(
        &self,
        ctx: JobContext,
        owner: &str,
        user_alias: &str,
        branch: &str,
    ) -> Result<serde_json::Value> {
        let mut ws = self.registry.require_workspace(owner, user_alias).await?;
        let staging = self.stage(&ws).await?;

        let built = async {
            ctx.progress(20, format!("checking out {}", branch));
            self.checkout_remote_branch(&staging, branch).await?;
            ctx.progress(50, "rebuilding indexes");
            let counts = self.indexer.build_all(&staging, &ws.index_kinds, None).await?;
            Ok::<_, FleetError>(counts)
        }
        .await;
        let counts = self.swap_in(&ws, staging, built).await?;

        let previous = std::mem::replace(&mut ws.current_branch, branch.to_string());
        self.registry.update_workspace(&ws).await?;
        info!(owner, user_alias, from = %previous, to = branch, "workspace branch switched");

        Ok(json!({
            "owner": owner,
            "user_alias": user_alias,
            "previous_branch": previous,
            "branch": branch,
            "indexes": counts,
        }))
    }

    async fn run_composite_update(
        &self,
        ctx: JobContext,
        owner: &str,
        user_alias: &str,
        components: Vec<String>,
    ) -> Result<serde_json::Value> {
        let mut ws = self.registry.require_workspace(owner, user_alias).await?;
        let keep: BTreeSet<&String> = components.iter().collect();
        let removed: Vec<String> = ws
            .golden_aliases
            .iter()
            .filter(|a| !keep.contains(a))
            .cloned()
            .collect();
        let added: Vec<String> = components
            .iter()
            .filter(|a| !ws.golden_aliases.contains(a))
            .cloned()
            .collect();

        let staging = self.stage(&ws).await?;
        let built = async {
            for alias in &removed {
                let dir = staging.join(alias);
                if dir.exists() {
                    tokio::fs::remove_dir_all(&dir).await?;
                }
            }

            let mut kinds = BTreeSet::new();
            for alias in &components {
                let (repo, snapshot) = self.golden.pin(alias).await?;
                if added.contains(alias) {
                    ctx.progress(30, format!("copying {}", alias));
                    copy_snapshot(snapshot.path(), &staging.join(alias)).await?;
                }
                kinds.extend(repo.index_kinds);
            }
            let kinds: Vec<IndexKind> = kinds.into_iter().collect();

            ctx.progress(60, "rebuilding indexes");
            let counts = self.indexer.build_all(&staging, &kinds, None).await?;
            Ok::<_, FleetError>((kinds, counts))
        }
        .await;
        let (kinds, counts) = self.swap_in(&ws, staging, built).await?;

        ws.golden_aliases = components;
        ws.index_kinds = kinds;
        ws.last_synced = Some(Utc::now());
        self.registry.update_workspace(&ws).await?;

        Ok(json!({
            "owner": owner,
            "user_alias": user_alias,
            "golden_aliases": ws.golden_aliases,
            "added": added,
            "removed": removed,
            "indexes": counts,
        }))
    }

    /// Copy the workspace, minus its indexes, into a hidden sibling that a
    /// job can rework without touching the live tree.
    async fn stage(&self, ws: &ActivatedWorkspace) -> Result<PathBuf> {
        let live = ws.path.clone();
        let staging = hidden_sibling(&live, "staging");
        let dest = staging.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if dest.exists() {
                std::fs::remove_dir_all(&dest)?;
            }
            copy_tree(&live, &dest, &[INDEX_DIR_NAME])?;
            Ok(())
        })
        .await??;
        Ok(staging)
    }

    /// Swap a staged tree over the workspace when `built` succeeded;
    /// otherwise drop it and leave the workspace as it was.
    async fn swap_in<T>(
        &self,
        ws: &ActivatedWorkspace,
        staging: PathBuf,
        built: Result<T>,
    ) -> Result<T> {
        let live = ws.path.clone();
        let value = match built {
            Ok(value) => value,
            Err(err) => {
                let discarded =
                    tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&staging)).await?;
                if let Err(e) = discarded {
                    warn!(path = %live.display(), error = %e, "failed to discard staged workspace");
                }
                return Err(err);
            }
        };

        tokio::task::spawn_blocking(move || replace_dir(&live, &staging)).await??;
        self.indexer.health().invalidate_prefix(&ws.path);
        Ok(value)
    }

    async fn checkout_remote_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        self.git.fetch(repo).await?;
        if !self.git.verify_branch_exists(repo, branch).await? {
            return Err(FleetError::not_found(format!("branch '{}' on the remote", branch)));
        }
        self.git.checkout(repo, branch).await
    }
}

async fn copy_snapshot(snapshot: &Path, dest: &Path) -> Result<()> {
    let snapshot = snapshot.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || copy_tree(&snapshot, &dest, &[INDEX_DIR_NAME])).await??;
    Ok(())
}

/// Drop repeated aliases, keeping first-seen order.
fn dedup(aliases: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    aliases
        .into_iter()
        .filter(|a| seen.insert(a.clone()))
        .collect()
}
