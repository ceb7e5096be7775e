use sqlx::SqlitePool;

use crate::error::Result;

/// Create every table and index the fleet needs. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Golden repositories; snapshot_generation/snapshot_path form the pointer
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS golden_repos (
            alias TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            branch TEXT NOT NULL,
            category TEXT,
            enable_temporal INTEGER NOT NULL DEFAULT 0,
            temporal_options TEXT,
            write_exception INTEGER NOT NULL DEFAULT 0,
            index_kinds TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL,
            snapshot_generation INTEGER,
            snapshot_path TEXT,
            last_refresh INTEGER,
            last_error TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Activated workspaces, single or composite
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS activated_repos (
            owner TEXT NOT NULL,
            user_alias TEXT NOT NULL,
            golden_aliases TEXT NOT NULL,
            current_branch TEXT NOT NULL,
            is_composite INTEGER NOT NULL DEFAULT 0,
            index_kinds TEXT NOT NULL DEFAULT '[]',
            path TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_synced INTEGER,
            PRIMARY KEY (owner, user_alias)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Background jobs
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            target TEXT NOT NULL,
            owner TEXT,
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            message TEXT,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            result_json TEXT,
            error_kind TEXT,
            error_message TEXT,
            error_code TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one non-terminal job per target
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active_target ON jobs(target) \
         WHERE status IN ('pending', 'running')",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner)")
        .execute(pool)
        .await?;

    Ok(())
}
