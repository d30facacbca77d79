//! Version-tracked schema migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS flows (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            topics TEXT NOT NULL DEFAULT '[]',
            classifier TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS inputs (
            id TEXT PRIMARY KEY,
            flow_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            workspace_id TEXT NOT NULL,
            token TEXT NOT NULL,
            signing_secret TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_inputs_workspace
            ON inputs(platform, workspace_id);

        CREATE TABLE IF NOT EXISTS outputs (
            id TEXT PRIMARY KEY,
            flow_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            name TEXT NOT NULL,
            accepts TEXT NOT NULL DEFAULT '[]',
            is_default INTEGER NOT NULL DEFAULT 0,
            token TEXT NOT NULL,
            sink TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_outputs_flow ON outputs(flow_id);

        CREATE TABLE IF NOT EXISTS discussions (
            id TEXT PRIMARY KEY,
            flow_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            workspace_id TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            thread_id TEXT NOT NULL,
            title TEXT NOT NULL,
            raw_content TEXT NOT NULL,
            thread TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            summary TEXT,
            tasks TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_discussions_status ON discussions(status);

        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            discussion_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            last_error TEXT,
            delivered TEXT NOT NULL DEFAULT '[]',
            partial_delivery INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_discussion ON jobs(discussion_id, status);

        CREATE TABLE IF NOT EXISTS user_mappings (
            platform TEXT NOT NULL,
            workspace_id TEXT NOT NULL,
            source_user_id TEXT NOT NULL,
            dest_user_id TEXT,
            email TEXT,
            confidence REAL NOT NULL DEFAULT 0,
            mapping_type TEXT NOT NULL,
            PRIMARY KEY (platform, workspace_id, source_user_id)
        );
        CREATE INDEX IF NOT EXISTS idx_mappings_email
            ON user_mappings(platform, workspace_id, email);
    "#,
}];

/// Run all pending migrations against the connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("failed to create _migrations table: {e}")))?;

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("failed to read migration version: {e}")))?;

    let current: i64 = match rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?
    {
        Some(row) => row.get(0).map_err(|e| StoreError::Migration(e.to_string()))?,
        None => 0,
    };

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| {
                StoreError::Migration(format!(
                    "migration v{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
    }

    Ok(())
}
