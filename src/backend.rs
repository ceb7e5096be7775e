//! Index backend contract and the built-in full-text backend.
//!
//! Index engines are external collaborators. Each one implements
//! [`IndexBackend`] for a single [`IndexKind`] and is registered in a
//! [`BackendSet`], which the lifecycle managers use to build indexes and
//! the aggregator uses to answer queries.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                 BackendSet                 │
//! │  ┌───────────┐ ┌──────────┐ ┌───────────┐ │
//! │  │ full_text │ │ semantic │ │ temporal… │ │
//! │  │ (builtin) │ │ (plugin) │ │ (plugin)  │ │
//! │  └───────────┘ └──────────┘ └───────────┘ │
//! └─────────────────────┬──────────────────────┘
//!                       ▼
//!   <root>/.fleet-index/<kind>/…   (one artifact dir per kind)
//! ```

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{FleetError, Result};
use crate::files::{content_excludes, sha256_file, walk_files, INDEX_DIR_NAME};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Semantic,
    FullText,
    Temporal,
    CodeIntel,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Semantic => "semantic",
            IndexKind::FullText => "full_text",
            IndexKind::Temporal => "temporal",
            IndexKind::CodeIntel => "code_intel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "semantic" => Some(IndexKind::Semantic),
            "full_text" => Some(IndexKind::FullText),
            "temporal" => Some(IndexKind::Temporal),
            "code_intel" => Some(IndexKind::CodeIntel),
            _ => None,
        }
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifact directory for `kind` inside a snapshot or workspace root.
pub fn index_dir(root: &Path, kind: IndexKind) -> PathBuf {
    root.join(INDEX_DIR_NAME).join(kind.as_str())
}

/// Inputs to a build, taken from `[indexing]` plus per-repository options.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub exclude_globs: Vec<String>,
    pub max_file_bytes: u64,
    pub temporal_options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub elements: u64,
}

#[derive(Debug, Clone)]
pub struct QueryParams {
    pub text: String,
    pub limit: usize,
}

/// One ranked hit from a backend query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    pub score: f64,
    pub content: String,
}

#[async_trait]
pub trait IndexBackend: Send + Sync {
    fn kind(&self) -> IndexKind;

    /// Build a fresh index of `root` into `index_dir`, replacing any
    /// previous artifact there.
    async fn build(&self, root: &Path, index_dir: &Path, options: &BuildOptions)
        -> Result<BuildReport>;

    /// Bring the index up to date after `changed` (root-relative) paths
    /// were added, modified, or deleted. Defaults to a full rebuild.
    async fn update(
        &self,
        root: &Path,
        index_dir: &Path,
        changed: &[String],
        options: &BuildOptions,
    ) -> Result<BuildReport> {
        let _ = changed;
        self.build(root, index_dir, options).await
    }

    async fn query(&self, root: &Path, index_dir: &Path, params: &QueryParams)
        -> Result<Vec<RankedItem>>;

    /// The file the health probe inspects.
    fn artifact(&self, index_dir: &Path) -> PathBuf;
}

/// Registered index backends, at most one per kind.
pub struct BackendSet {
    backends: HashMap<IndexKind, Arc<dyn IndexBackend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// A set holding the built-in full-text backend.
    pub fn with_builtins() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(FullTextBackend));
        set
    }

    /// Register a backend, replacing any earlier one of the same kind.
    pub fn register(&mut self, backend: Arc<dyn IndexBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    pub fn get(&self, kind: IndexKind) -> Option<Arc<dyn IndexBackend>> {
        self.backends.get(&kind).cloned()
    }

    pub fn require(&self, kind: IndexKind) -> Result<Arc<dyn IndexBackend>> {
        self.get(kind).ok_or_else(|| {
            FleetError::validation(format!("no index backend registered for '{}'", kind))
        })
    }

    pub fn contains(&self, kind: IndexKind) -> bool {
        self.backends.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<IndexKind> {
        let mut kinds: Vec<IndexKind> = self.backends.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl Default for BackendSet {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in full-text backend
// ═══════════════════════════════════════════════════════════════════════

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub kind: IndexKind,
    pub built_at: i64,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

/// Line-matching index over the text files of a tree.
///
/// The artifact is a manifest of indexed files; queries re-read those
/// files from the root and score each by its number of matching lines.
pub struct FullTextBackend;

impl FullTextBackend {
    fn scan(root: &Path, options: &BuildOptions) -> Result<Vec<ManifestEntry>> {
        let excludes = content_excludes(&options.exclude_globs)?;
        let mut entries = Vec::new();
        for (path, rel) in walk_files(root, &excludes)? {
            if let Some(entry) = Self::entry_for(&path, rel, options.max_file_bytes)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Manifest entry for one file, or `None` when it is too large or not text.
    fn entry_for(path: &Path, rel: String, max_bytes: u64) -> Result<Option<ManifestEntry>> {
        let meta = std::fs::metadata(path)?;
        if max_bytes > 0 && meta.len() > max_bytes {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        if bytes.contains(&0) || std::str::from_utf8(&bytes).is_err() {
            return Ok(None);
        }
        Ok(Some(ManifestEntry {
            path: rel,
            size: meta.len(),
            sha256: sha256_file(path)?,
        }))
    }

    fn write_manifest(index_dir: &Path, files: Vec<ManifestEntry>) -> Result<BuildReport> {
        std::fs::create_dir_all(index_dir)?;
        let manifest = Manifest {
            kind: IndexKind::FullText,
            built_at: Utc::now().timestamp(),
            files,
        };
        let elements = manifest.files.len() as u64;

        let tmp = index_dir.join(format!("{}.tmp", MANIFEST_FILE));
        std::fs::write(&tmp, serde_json::to_vec_pretty(&manifest)?)?;
        std::fs::rename(&tmp, index_dir.join(MANIFEST_FILE))?;

        Ok(BuildReport { elements })
    }

    pub fn read_manifest(index_dir: &Path) -> Result<Manifest> {
        let path = index_dir.join(MANIFEST_FILE);
        let bytes = std::fs::read(&path).map_err(|e| {
            FleetError::backend_with_code(
                format!("cannot read {}: {}", path.display(), e),
                "full_text",
            )
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            FleetError::backend_with_code(
                format!("corrupt manifest {}: {}", path.display(), e),
                "full_text",
            )
        })
    }

    fn search(root: &Path, manifest: &Manifest, params: &QueryParams) -> Vec<RankedItem> {
        let needle = params.text.to_lowercase();
        let mut items = Vec::new();

        for entry in &manifest.files {
            let Ok(text) = std::fs::read_to_string(root.join(&entry.path)) else {
                continue;
            };
            let mut first_line = None;
            let mut matches = Vec::new();
            for (idx, line) in text.lines().enumerate() {
                if line.to_lowercase().contains(&needle) {
                    let line_no = idx as u64 + 1;
                    first_line.get_or_insert(line_no);
                    matches.push(format!("{}: {}", line_no, line));
                }
            }
            if matches.is_empty() {
                continue;
            }
            items.push(RankedItem {
                path: entry.path.clone(),
                line: first_line,
                score: matches.len() as f64,
                content: matches.join("\n"),
            });
        }

        items.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        items.truncate(params.limit);
        items
    }
}

#[async_trait]
impl IndexBackend for FullTextBackend {
    fn kind(&self) -> IndexKind {
        IndexKind::FullText
    }

    async fn build(
        &self,
        root: &Path,
        index_dir: &Path,
        options: &BuildOptions,
    ) -> Result<BuildReport> {
        let root = root.to_path_buf();
        let index_dir = index_dir.to_path_buf();
        let options = options.clone();
        tokio::task::spawn_blocking(move || {
            let files = Self::scan(&root, &options)?;
            Self::write_manifest(&index_dir, files)
        })
        .await?
    }

    async fn update(
        &self,
        root: &Path,
        index_dir: &Path,
        changed: &[String],
        options: &BuildOptions,
    ) -> Result<BuildReport> {
        if !index_dir.join(MANIFEST_FILE).exists() {
            return self.build(root, index_dir, options).await;
        }

        let root = root.to_path_buf();
        let index_dir = index_dir.to_path_buf();
        let changed = changed.to_vec();
        let options = options.clone();
        tokio::task::spawn_blocking(move || {
            let manifest = Self::read_manifest(&index_dir)?;
            let excludes = content_excludes(&options.exclude_globs)?;
            let mut files: BTreeMap<String, ManifestEntry> = manifest
                .files
                .into_iter()
                .map(|e| (e.path.clone(), e))
                .collect();

            for rel in changed {
                files.remove(&rel);
                let path = root.join(&rel);
                if !path.is_file() || excludes.is_match(&rel) {
                    continue;
                }
                if let Some(entry) = Self::entry_for(&path, rel.clone(), options.max_file_bytes)? {
                    files.insert(rel, entry);
                }
            }

            Self::write_manifest(&index_dir, files.into_values().collect())
        })
        .await?
    }

    async fn query(
        &self,
        root: &Path,
        index_dir: &Path,
        params: &QueryParams,
    ) -> Result<Vec<RankedItem>> {
        let root = root.to_path_buf();
        let index_dir = index_dir.to_path_buf();
        let params = params.clone();
        tokio::task::spawn_blocking(move || {
            let manifest = Self::read_manifest(&index_dir)?;
            Ok(Self::search(&root, &manifest, &params))
        })
        .await?
    }

    fn artifact(&self, index_dir: &Path) -> PathBuf {
        index_dir.join(MANIFEST_FILE)
    }
}
