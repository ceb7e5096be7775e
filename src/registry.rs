//! Durable registry of golden repositories and activated workspaces.
//!
//! The registry is the single source of truth for repository state. Only
//! the lifecycle and workspace managers write to it, and only from inside
//! a job that holds the target's scheduler slot.
//!
//! The snapshot pointer of a golden repository is updated by
//! [`Registry::swap_snapshot`], a single `UPDATE` statement, so the
//! persisted pointer always names one complete snapshot.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;

use crate::backend::IndexKind;
use crate::error::{FleetError, Result};
use crate::models::{
    ts_to_datetime, ActivatedWorkspace, GoldenRepository, GoldenStatus, SnapshotPointer,
};

#[derive(Clone)]
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ═══════════════════════════════════════════════════════════════════
    // Golden repositories
    // ═══════════════════════════════════════════════════════════════════

    pub async fn insert_golden(&self, repo: &GoldenRepository) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO golden_repos (
                alias, url, branch, category, enable_temporal, temporal_options,
                write_exception, index_kinds, status, snapshot_generation,
                snapshot_path, last_refresh, last_error, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&repo.alias)
        .bind(&repo.url)
        .bind(&repo.branch)
        .bind(&repo.category)
        .bind(repo.enable_temporal as i64)
        .bind(
            repo.temporal_options
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(repo.write_exception as i64)
        .bind(encode_kinds(&repo.index_kinds)?)
        .bind(repo.status.as_str())
        .bind(repo.snapshot.as_ref().map(|s| s.generation as i64))
        .bind(
            repo.snapshot
                .as_ref()
                .map(|s| s.path.to_string_lossy().to_string()),
        )
        .bind(repo.last_refresh.map(|t| t.timestamp()))
        .bind(&repo.last_error)
        .bind(repo.created_at.timestamp())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                FleetError::conflict(format!("golden repository '{}' already exists", repo.alias)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_golden(&self, alias: &str) -> Result<Option<GoldenRepository>> {
        let row = sqlx::query("SELECT * FROM golden_repos WHERE alias = ?")
            .bind(alias)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| golden_from_row(&r)).transpose()
    }

    /// Like [`get_golden`](Self::get_golden), but a missing alias is `NotFound`.
    pub async fn require_golden(&self, alias: &str) -> Result<GoldenRepository> {
        self.get_golden(alias)
            .await?
            .ok_or_else(|| FleetError::not_found(format!("golden repository '{}'", alias)))
    }

    /// All golden repositories ordered by alias.
    pub async fn list_golden(&self) -> Result<Vec<GoldenRepository>> {
        let rows = sqlx::query("SELECT * FROM golden_repos ORDER BY alias")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(golden_from_row).collect()
    }

    pub async fn set_golden_status(
        &self,
        alias: &str,
        status: GoldenStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE golden_repos SET status = ?, last_error = ? WHERE alias = ?")
            .bind(status.as_str())
            .bind(last_error)
            .bind(alias)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Repoint `alias` at a new snapshot. This is the only externally
    /// visible state change of a refresh, branch change, or reindex.
    pub async fn swap_snapshot(
        &self,
        alias: &str,
        pointer: &SnapshotPointer,
        branch: &str,
        refreshed_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE golden_repos
            SET snapshot_generation = ?, snapshot_path = ?, branch = ?,
                last_refresh = ?, status = 'ready', last_error = NULL
            WHERE alias = ?
            "#,
        )
        .bind(pointer.generation as i64)
        .bind(pointer.path.to_string_lossy().to_string())
        .bind(branch)
        .bind(refreshed_at.timestamp())
        .bind(alias)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(FleetError::not_found(format!(
                "golden repository '{}'",
                alias
            )));
        }
        Ok(())
    }

    pub async fn set_index_kinds(&self, alias: &str, kinds: &[IndexKind]) -> Result<()> {
        sqlx::query("UPDATE golden_repos SET index_kinds = ? WHERE alias = ?")
            .bind(encode_kinds(kinds)?)
            .bind(alias)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_golden(&self, alias: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM golden_repos WHERE alias = ?")
            .bind(alias)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Activated workspaces
    // ═══════════════════════════════════════════════════════════════════

    pub async fn insert_workspace(&self, ws: &ActivatedWorkspace) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO activated_repos (
                owner, user_alias, golden_aliases, current_branch, is_composite,
                index_kinds, path, created_at, last_synced
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&ws.owner)
        .bind(&ws.user_alias)
        .bind(serde_json::to_string(&ws.golden_aliases)?)
        .bind(&ws.current_branch)
        .bind(ws.is_composite as i64)
        .bind(encode_kinds(&ws.index_kinds)?)
        .bind(ws.path.to_string_lossy().to_string())
        .bind(ws.created_at.timestamp())
        .bind(ws.last_synced.map(|t| t.timestamp()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(FleetError::conflict(format!(
                    "workspace '{}' already exists for {}",
                    ws.user_alias, ws.owner
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_workspace(
        &self,
        owner: &str,
        user_alias: &str,
    ) -> Result<Option<ActivatedWorkspace>> {
        let row = sqlx::query("SELECT * FROM activated_repos WHERE owner = ? AND user_alias = ?")
            .bind(owner)
            .bind(user_alias)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| workspace_from_row(&r)).transpose()
    }

    pub async fn require_workspace(
        &self,
        owner: &str,
        user_alias: &str,
    ) -> Result<ActivatedWorkspace> {
        self.get_workspace(owner, user_alias).await?.ok_or_else(|| {
            FleetError::not_found(format!("workspace '{}' for {}", user_alias, owner))
        })
    }

    pub async fn list_workspaces(&self, owner: &str) -> Result<Vec<ActivatedWorkspace>> {
        let rows = sqlx::query("SELECT * FROM activated_repos WHERE owner = ? ORDER BY user_alias")
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(workspace_from_row).collect()
    }

    /// Persist the mutable fields of a workspace (components, branch,
    /// index kinds, sync time).
    pub async fn update_workspace(&self, ws: &ActivatedWorkspace) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE activated_repos
            SET golden_aliases = ?, current_branch = ?, is_composite = ?, index_kinds = ?,
                last_synced = ?
            WHERE owner = ? AND user_alias = ?
            "#,
        )
        .bind(serde_json::to_string(&ws.golden_aliases)?)
        .bind(&ws.current_branch)
        .bind(ws.is_composite as i64)
        .bind(encode_kinds(&ws.index_kinds)?)
        .bind(ws.last_synced.map(|t| t.timestamp()))
        .bind(&ws.owner)
        .bind(&ws.user_alias)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(FleetError::not_found(format!(
                "workspace '{}' for {}",
                ws.user_alias, ws.owner
            )));
        }
        Ok(())
    }

    pub async fn delete_workspace(&self, owner: &str, user_alias: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM activated_repos WHERE owner = ? AND user_alias = ?")
            .bind(owner)
            .bind(user_alias)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn encode_kinds(kinds: &[IndexKind]) -> Result<String> {
    Ok(serde_json::to_string(kinds)?)
}

fn golden_from_row(row: &SqliteRow) -> Result<GoldenRepository> {
    let status: String = row.get("status");
    let status = GoldenStatus::parse(&status)
        .ok_or_else(|| FleetError::Internal(format!("unknown golden status '{}'", status)))?;

    let generation: Option<i64> = row.get("snapshot_generation");
    let path: Option<String> = row.get("snapshot_path");
    let snapshot = match (generation, path) {
        (Some(generation), Some(path)) => Some(SnapshotPointer {
            generation: generation as u64,
            path: PathBuf::from(path),
        }),
        _ => None,
    };

    let temporal_options: Option<String> = row.get("temporal_options");
    let index_kinds: String = row.get("index_kinds");
    let last_refresh: Option<i64> = row.get("last_refresh");

    Ok(GoldenRepository {
        alias: row.get("alias"),
        url: row.get("url"),
        branch: row.get("branch"),
        category: row.get("category"),
        enable_temporal: row.get::<i64, _>("enable_temporal") != 0,
        temporal_options: temporal_options
            .map(|t| serde_json::from_str(&t))
            .transpose()?,
        write_exception: row.get::<i64, _>("write_exception") != 0,
        index_kinds: serde_json::from_str(&index_kinds)?,
        status,
        snapshot,
        last_refresh: last_refresh.map(ts_to_datetime),
        last_error: row.get("last_error"),
        created_at: ts_to_datetime(row.get("created_at")),
    })
}

fn workspace_from_row(row: &SqliteRow) -> Result<ActivatedWorkspace> {
    let golden_aliases: String = row.get("golden_aliases");
    let index_kinds: String = row.get("index_kinds");
    let path: String = row.get("path");
    let last_synced: Option<i64> = row.get("last_synced");

    Ok(ActivatedWorkspace {
        owner: row.get("owner"),
        user_alias: row.get("user_alias"),
        golden_aliases: serde_json::from_str(&golden_aliases)?,
        current_branch: row.get("current_branch"),
        is_composite: row.get::<i64, _>("is_composite") != 0,
        index_kinds: serde_json::from_str(&index_kinds)?,
        path: PathBuf::from(path),
        created_at: ts_to_datetime(row.get("created_at")),
        last_synced: last_synced.map(ts_to_datetime),
    })
}
