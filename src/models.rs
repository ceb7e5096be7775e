//! Core data models used throughout the fleet.
//!
//! These types represent the jobs, golden repositories, and activated
//! workspaces that flow between the scheduler, the lifecycle managers,
//! and the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::backend::IndexKind;
use crate::error::{ErrorKind, FleetError};

/// Operation a background job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    AddRepo,
    Refresh,
    ChangeBranch,
    Reindex,
    Activate,
    Deactivate,
    Sync,
    SwitchBranch,
    CompositeUpdate,
    RemoveRepo,
    AddIndex,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::AddRepo => "add_repo",
            JobKind::Refresh => "refresh",
            JobKind::ChangeBranch => "change_branch",
            JobKind::Reindex => "reindex",
            JobKind::Activate => "activate",
            JobKind::Deactivate => "deactivate",
            JobKind::Sync => "sync",
            JobKind::SwitchBranch => "switch_branch",
            JobKind::CompositeUpdate => "composite_update",
            JobKind::RemoveRepo => "remove_repo",
            JobKind::AddIndex => "add_index",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "add_repo" => JobKind::AddRepo,
            "refresh" => JobKind::Refresh,
            "change_branch" => JobKind::ChangeBranch,
            "reindex" => JobKind::Reindex,
            "activate" => JobKind::Activate,
            "deactivate" => JobKind::Deactivate,
            "sync" => JobKind::Sync,
            "switch_branch" => JobKind::SwitchBranch,
            "composite_update" => JobKind::CompositeUpdate,
            "remove_repo" => JobKind::RemoveRepo,
            "add_index" => JobKind::AddIndex,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Failure payload of a `failed` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<&FleetError> for JobError {
    fn from(err: &FleetError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            code: err.code(),
        }
    }
}

/// A background job record. Immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// Lifecycle state of a golden repository that exists in the registry.
/// `absent` is the lack of a registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoldenStatus {
    Indexing,
    Ready,
    Refreshing,
}

impl GoldenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoldenStatus::Indexing => "indexing",
            GoldenStatus::Ready => "ready",
            GoldenStatus::Refreshing => "refreshing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "indexing" => Some(GoldenStatus::Indexing),
            "ready" => Some(GoldenStatus::Ready),
            "refreshing" => Some(GoldenStatus::Refreshing),
            _ => None,
        }
    }
}

/// Indirection to the snapshot currently served for a golden repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPointer {
    pub generation: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenRepository {
    pub alias: String,
    pub url: String,
    pub branch: String,
    pub category: Option<String>,
    pub enable_temporal: bool,
    pub temporal_options: Option<serde_json::Value>,
    /// Accepts manual write-mode sessions; refreshes must check the lease.
    pub write_exception: bool,
    pub index_kinds: Vec<IndexKind>,
    pub status: GoldenStatus,
    pub snapshot: Option<SnapshotPointer>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GoldenRepository {
    pub fn is_ready(&self) -> bool {
        self.snapshot.is_some() && self.status != GoldenStatus::Indexing
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivatedWorkspace {
    pub owner: String,
    pub user_alias: String,
    pub golden_aliases: Vec<String>,
    pub current_branch: String,
    pub is_composite: bool,
    /// Fixed at activation and composite update; outlives the golden rows.
    pub index_kinds: Vec<IndexKind>,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_synced: Option<DateTime<Utc>>,
}

impl ActivatedWorkspace {
    /// Scheduler target for jobs mutating this workspace.
    pub fn job_target(&self) -> String {
        workspace_target(&self.owner, &self.user_alias)
    }
}

pub fn workspace_target(owner: &str, user_alias: &str) -> String {
    format!("{}/{}", owner, user_alias)
}

pub fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

/// Aliases name directories, so they are restricted to `[A-Za-z0-9._-]`
/// and may not start with a dot.
pub fn validate_alias(alias: &str) -> Result<(), FleetError> {
    if alias.is_empty() || alias.len() > 128 {
        return Err(FleetError::validation(
            "alias must be between 1 and 128 characters",
        ));
    }
    if alias.starts_with('.') {
        return Err(FleetError::validation(format!(
            "alias '{}' must not start with '.'",
            alias
        )));
    }
    if let Some(bad) = alias
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(FleetError::validation(format!(
            "alias '{}' contains invalid character '{}'",
            alias, bad
        )));
    }
    Ok(())
}

/// A subset of git's ref-name rules, enough to reject malformed input
/// before it reaches a backend.
pub fn validate_branch(branch: &str) -> Result<(), FleetError> {
    let invalid = |reason: &str| {
        Err(FleetError::validation(format!(
            "invalid branch name '{}': {}",
            branch, reason
        )))
    };

    if branch.is_empty() {
        return invalid("empty");
    }
    if branch.contains("..") {
        return invalid("contains '..'");
    }
    if branch.starts_with('-') || branch.starts_with('/') {
        return invalid("must not start with '-' or '/'");
    }
    if branch.ends_with('/') || branch.ends_with(".lock") || branch.ends_with('.') {
        return invalid("bad suffix");
    }
    if branch.contains("//") || branch.contains("@{") {
        return invalid("contains '//' or '@{'");
    }
    if branch
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c))
    {
        return invalid("contains a forbidden character");
    }
    Ok(())
}
