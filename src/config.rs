use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::IndexKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub write_mode: WriteModeConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_job_retention_hours")]
    pub job_retention_hours: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            job_retention_hours: default_job_retention_hours(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_job_retention_hours() -> u64 {
    168
}

/// What a refresh does when the repository's write-mode lease is held.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeasePolicy {
    FailFast,
    Defer,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WriteModeConfig {
    #[serde(default = "default_on_refresh")]
    pub on_refresh: LeasePolicy,
    #[serde(default = "default_defer_timeout_secs")]
    pub defer_timeout_secs: u64,
}

impl Default for WriteModeConfig {
    fn default() -> Self {
        Self {
            on_refresh: default_on_refresh(),
            defer_timeout_secs: default_defer_timeout_secs(),
        }
    }
}

fn default_on_refresh() -> LeasePolicy {
    LeasePolicy::FailFast
}
fn default_defer_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RefreshConfig {
    #[serde(default)]
    pub interval_secs: u64,
    #[serde(default = "default_lease_warn_secs")]
    pub lease_warn_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 0,
            lease_warn_secs: default_lease_warn_secs(),
        }
    }
}

fn default_lease_warn_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold: usize,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            page_size: default_page_size(),
            inline_threshold: default_inline_threshold(),
            preview_chars: default_preview_chars(),
            max_entries: default_max_entries(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    900
}
fn default_page_size() -> usize {
    5000
}
fn default_inline_threshold() -> usize {
    2000
}
fn default_preview_chars() -> usize {
    500
}
fn default_max_entries() -> usize {
    1000
}
fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_health_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_health_ttl_secs(),
        }
    }
}

fn default_health_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregationConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_limit() -> usize {
    10
}
fn default_max_limit() -> usize {
    200
}
fn default_max_concurrency() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_kinds")]
    pub default_kinds: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            default_kinds: default_kinds(),
            max_file_bytes: default_max_file_bytes(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_kinds() -> Vec<String> {
    vec!["full_text".to_string()]
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7480".to_string()
}

impl IndexingConfig {
    /// Parsed `default_kinds`. Unknown names were rejected by [`load_config`].
    pub fn kinds(&self) -> Vec<IndexKind> {
        self.default_kinds
            .iter()
            .filter_map(|k| IndexKind::parse(k))
            .collect()
    }
}

impl Config {
    /// A config rooted in `dir` with every optional section defaulted.
    pub fn with_root(dir: &Path) -> Self {
        Self {
            db: DbConfig {
                path: dir.join("fleet.sqlite"),
            },
            storage: StorageConfig {
                root: dir.join("repos"),
            },
            scheduler: SchedulerConfig::default(),
            write_mode: WriteModeConfig::default(),
            refresh: RefreshConfig::default(),
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
            aggregation: AggregationConfig::default(),
            indexing: IndexingConfig::default(),
            server: ServerConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.workers == 0 {
            anyhow::bail!("scheduler.workers must be >= 1");
        }

        if self.cache.page_size == 0 {
            anyhow::bail!("cache.page_size must be >= 1");
        }
        if self.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries must be >= 1");
        }

        if self.aggregation.default_limit == 0 || self.aggregation.max_limit == 0 {
            anyhow::bail!("aggregation limits must be >= 1");
        }
        if self.aggregation.default_limit > self.aggregation.max_limit {
            anyhow::bail!(
                "aggregation.default_limit ({}) must not exceed aggregation.max_limit ({})",
                self.aggregation.default_limit,
                self.aggregation.max_limit
            );
        }
        if self.aggregation.max_concurrency == 0 {
            anyhow::bail!("aggregation.max_concurrency must be >= 1");
        }

        for kind in &self.indexing.default_kinds {
            if IndexKind::parse(kind).is_none() {
                anyhow::bail!(
                    "Unknown index kind in indexing.default_kinds: '{}'. Must be semantic, full_text, temporal, or code_intel.",
                    kind
                );
            }
        }
        if self.indexing.default_kinds.is_empty() {
            anyhow::bail!("indexing.default_kinds must name at least one index kind");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
