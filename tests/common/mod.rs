//! Shared fixtures: an in-process git fake, a second index backend, and
//! helpers to open a fleet in a temp directory.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use repo_fleet::backend::{
    BackendSet, BuildOptions, BuildReport, IndexBackend, IndexKind, QueryParams, RankedItem,
};
use repo_fleet::config::Config;
use repo_fleet::error::{FleetError, Result};
use repo_fleet::files::{content_excludes, walk_files};
use repo_fleet::fleet::{Fleet, OpResponse};
use repo_fleet::git::GitBackend;
use repo_fleet::models::{Job, JobStatus};

type Tree = BTreeMap<String, String>;

const META_FILE: &str = "fake.json";

/// What a fake clone records under `<repo>/.git/`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RepoMeta {
    url: String,
    head: String,
    commit: u64,
    tracked: Vec<String>,
    /// Remote branches as of the last fetch: branch -> (commit, tree).
    fetched: BTreeMap<String, (u64, Tree)>,
}

fn read_meta(repo: &Path) -> Result<RepoMeta> {
    let bytes = std::fs::read(repo.join(".git").join(META_FILE))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_meta(repo: &Path, meta: &RepoMeta) -> Result<()> {
    let dir = repo.join(".git");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(META_FILE), serde_json::to_vec(meta)?)?;
    Ok(())
}

/// Files of a working tree, skipping `.git` and index artifacts.
pub fn read_tree(root: &Path) -> Tree {
    let excludes = content_excludes(&[]).unwrap();
    walk_files(root, &excludes)
        .unwrap()
        .into_iter()
        .map(|(abs, rel)| (rel, std::fs::read_to_string(abs).unwrap_or_default()))
        .collect()
}

fn write_file(root: &Path, rel: &str, content: &str) -> Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Git backend over in-memory remotes.
///
/// Remotes are named by their URL. A clone writes the branch's files plus a
/// JSON metadata file under `.git/`, so snapshots and workspaces copied from
/// a clone carry their git state with them.
#[derive(Default)]
pub struct FakeGit {
    remotes: Mutex<HashMap<String, BTreeMap<String, (u64, Tree)>>>,
    commits: AtomicU64,
    fail_fetch: AtomicBool,
    fail_clone: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
    fetches: AtomicUsize,
}

impl FakeGit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the content of `branch` on remote `url`.
    pub fn set_branch(&self, url: &str, branch: &str, files: &[(&str, &str)]) {
        let commit = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        let tree: Tree = files
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect();
        self.remotes
            .lock()
            .entry(url.to_string())
            .or_default()
            .insert(branch.to_string(), (commit, tree));
    }

    /// Add or overwrite one file on `branch` as a new commit.
    pub fn push(&self, url: &str, branch: &str, path: &str, content: &str) {
        let commit = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        let mut remotes = self.remotes.lock();
        let entry = remotes
            .entry(url.to_string())
            .or_default()
            .entry(branch.to_string())
            .or_default();
        entry.0 = commit;
        entry.1.insert(path.to_string(), content.to_string());
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_clone(&self, fail: bool) {
        self.fail_clone.store(fail, Ordering::SeqCst);
    }

    /// Make every fetch wait until [`FakeGit::release_fetch`] is called.
    pub fn block_fetch(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let one blocked (or the next) fetch through.
    pub fn release_fetch(&self) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.add_permits(1);
        }
    }

    pub fn unblock_fetch(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.add_permits(1024);
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn remote_branches(&self, url: &str) -> BTreeMap<String, (u64, Tree)> {
        self.remotes.lock().get(url).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl GitBackend for FakeGit {
    async fn clone_repo(&self, url: &str, branch: &str, dest: &Path) -> Result<()> {
        if self.fail_clone.load(Ordering::SeqCst) {
            return Err(FleetError::backend_with_code("clone refused", "git_clone"));
        }
        let branches = self.remote_branches(url);
        let Some((commit, tree)) = branches.get(branch).cloned() else {
            return Err(FleetError::backend_with_code(
                format!("remote branch '{}' not found in '{}'", branch, url),
                "git_clone",
            ));
        };

        std::fs::create_dir_all(dest)?;
        for (path, content) in &tree {
            write_file(dest, path, content)?;
        }
        write_meta(
            dest,
            &RepoMeta {
                url: url.to_string(),
                head: branch.to_string(),
                commit,
                tracked: tree.keys().cloned().collect(),
                fetched: branches,
            },
        )
    }

    async fn fetch(&self, repo: &Path) -> Result<()> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(FleetError::backend_with_code(
                "could not resolve host",
                "git_fetch",
            ));
        }

        let mut meta = read_meta(repo)?;
        meta.fetched = self.remote_branches(&meta.url);
        write_meta(repo, &meta)
    }

    async fn verify_branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        Ok(read_meta(repo)?.fetched.contains_key(branch))
    }

    async fn checkout(&self, repo: &Path, branch: &str) -> Result<()> {
        let mut meta = read_meta(repo)?;
        let Some((commit, tree)) = meta.fetched.get(branch).cloned() else {
            return Err(FleetError::backend_with_code(
                format!("unknown branch '{}'", branch),
                "git_checkout",
            ));
        };

        // Untracked files survive, as with `git checkout`.
        for path in &meta.tracked {
            if !tree.contains_key(path) {
                let _ = std::fs::remove_file(repo.join(path));
            }
        }
        for (path, content) in &tree {
            write_file(repo, path, content)?;
        }
        meta.head = branch.to_string();
        meta.commit = commit;
        meta.tracked = tree.keys().cloned().collect();
        write_meta(repo, &meta)
    }

    async fn pull(&self, repo: &Path, source: Option<&Path>, refspec: &str) -> Result<Vec<String>> {
        let mut meta = read_meta(repo)?;
        let (commit, incoming) = match source {
            Some(src) => {
                let src_meta = read_meta(src)?;
                match refspec.strip_prefix("refs/remotes/origin/") {
                    Some(branch) => src_meta.fetched.get(branch).cloned().ok_or_else(|| {
                        FleetError::backend_with_code(
                            format!("couldn't find remote ref {}", refspec),
                            "git_pull",
                        )
                    })?,
                    None => (src_meta.commit, read_tree(src)),
                }
            }
            None => self
                .remote_branches(&meta.url)
                .get(refspec)
                .cloned()
                .ok_or_else(|| {
                    FleetError::backend_with_code(
                        format!("couldn't find remote ref {}", refspec),
                        "git_pull",
                    )
                })?,
        };

        let current = read_tree(repo);
        let mut changed = Vec::new();
        for (path, content) in &incoming {
            if current.get(path) != Some(content) {
                write_file(repo, path, content)?;
                changed.push(path.clone());
            }
        }
        for path in &meta.tracked {
            if !incoming.contains_key(path) && current.contains_key(path) {
                std::fs::remove_file(repo.join(path))?;
                changed.push(path.clone());
            }
        }

        meta.commit = commit;
        meta.tracked = incoming.keys().cloned().collect();
        write_meta(repo, &meta)?;
        changed.sort();
        Ok(changed)
    }

    async fn head_commit(&self, repo: &Path) -> Result<String> {
        Ok(format!("{:08x}", read_meta(repo)?.commit))
    }
}

/// A `semantic` backend that records one element per file. Builds can be
/// made to fail.
#[derive(Default)]
pub struct FakeSemantic {
    pub fail_builds: AtomicBool,
    pub builds: AtomicUsize,
}

impl FakeSemantic {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl IndexBackend for FakeSemantic {
    fn kind(&self) -> IndexKind {
        IndexKind::Semantic
    }

    async fn build(&self, root: &Path, index_dir: &Path, _options: &BuildOptions) -> Result<BuildReport> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(FleetError::backend_with_code("embedding service down", "embed"));
        }
        let files = read_tree(root).len() as u64;
        std::fs::create_dir_all(index_dir)?;
        std::fs::write(
            self.artifact(index_dir),
            serde_json::to_vec(&serde_json::json!({ "element_count": files }))?,
        )?;
        Ok(BuildReport { elements: files })
    }

    async fn query(&self, root: &Path, _index_dir: &Path, params: &QueryParams) -> Result<Vec<RankedItem>> {
        let needle = params.text.to_lowercase();
        let mut items: Vec<RankedItem> = read_tree(root)
            .into_iter()
            .filter(|(_, content)| content.to_lowercase().contains(&needle))
            .map(|(path, content)| RankedItem {
                path,
                line: None,
                score: 0.5,
                content,
            })
            .collect();
        items.truncate(params.limit);
        Ok(items)
    }

    fn artifact(&self, index_dir: &Path) -> PathBuf {
        index_dir.join("vectors.json")
    }
}

/// Built-in backends plus the fake semantic one.
pub fn backends(semantic: Arc<FakeSemantic>) -> BackendSet {
    let mut set = BackendSet::with_builtins();
    set.register(semantic);
    set
}

pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::with_root(dir);
    config.health.ttl_secs = 0;
    config.scheduler.workers = 4;
    config
}

pub struct Harness {
    pub dir: TempDir,
    pub git: Arc<FakeGit>,
    pub semantic: Arc<FakeSemantic>,
    pub fleet: Fleet,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let git = FakeGit::new();
        let semantic = FakeSemantic::new();
        let mut config = test_config(dir.path());
        tweak(&mut config);
        let fleet = Fleet::open(config, git.clone(), backends(semantic.clone()))
            .await
            .unwrap();
        Self {
            dir,
            git,
            semantic,
            fleet,
        }
    }

    /// Open a second fleet over the same storage, as after a restart.
    pub async fn reopen(&self) -> Fleet {
        Fleet::open(
            test_config(self.dir.path()),
            self.git.clone(),
            backends(self.semantic.clone()),
        )
        .await
        .unwrap()
    }
}

/// Wait for the job behind `response`, asserting it was admitted.
pub async fn wait(fleet: &Fleet, response: OpResponse) -> Job {
    assert!(response.success, "submission rejected: {:?}", response);
    let id = response.job_id.expect("admitted job has an id");
    fleet.wait_job(&id).await.unwrap()
}

pub async fn completed(fleet: &Fleet, response: OpResponse) -> Job {
    let job = wait(fleet, response).await;
    assert_eq!(job.status, JobStatus::Completed, "job failed: {:?}", job.error);
    job
}

pub async fn failed(fleet: &Fleet, response: OpResponse) -> Job {
    let job = wait(fleet, response).await;
    assert_eq!(job.status, JobStatus::Failed, "job unexpectedly completed");
    job
}
