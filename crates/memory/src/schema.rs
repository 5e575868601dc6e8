use std::collections::HashSet;

use libsql::{Connection, params};
use types::MemoryError;

use crate::errors::{initialization_error, migration_error};

const MIGRATION_BOOKKEEPING_TABLE: &str = "memory_migrations";
pub(crate) const REQUIRED_TABLES: &[&str] = &[
    MIGRATION_BOOKKEEPING_TABLE,
    "sessions",
    "transcript_messages",
    "transcript_tool_calls",
    "memory_records",
    "run_failures",
];
pub(crate) const REQUIRED_INDEXES: &[&str] = &[
    "idx_tool_calls_session_message",
    "idx_memory_records_owner_created_at",
    "idx_run_failures_session",
];

#[derive(Debug, Clone, Copy)]
pub(crate) struct Migration {
    pub(crate) version: &'static str,
    pub(crate) sql: &'static str,
}

pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_create_sessions_table",
        sql: include_str!("../migrations/0001_create_sessions_table.sql"),
    },
    Migration {
        version: "0002_create_transcript_messages_table",
        sql: include_str!("../migrations/0002_create_transcript_messages_table.sql"),
    },
    Migration {
        version: "0003_create_transcript_tool_calls_table",
        sql: include_str!("../migrations/0003_create_transcript_tool_calls_table.sql"),
    },
    Migration {
        version: "0004_create_tool_calls_message_index",
        sql: include_str!("../migrations/0004_create_tool_calls_message_index.sql"),
    },
    Migration {
        version: "0005_create_memory_records_table",
        sql: include_str!("../migrations/0005_create_memory_records_table.sql"),
    },
    Migration {
        version: "0006_create_memory_records_owner_index",
        sql: include_str!("../migrations/0006_create_memory_records_owner_index.sql"),
    },
    Migration {
        version: "0007_create_run_failures_table",
        sql: include_str!("../migrations/0007_create_run_failures_table.sql"),
    },
];

pub(crate) async fn rollback_quietly(conn: &Connection) {
    let _ = conn.execute("ROLLBACK TRANSACTION", params![]).await;
}

pub(crate) async fn enable_foreign_keys(conn: &Connection) -> Result<(), MemoryError> {
    conn.execute("PRAGMA foreign_keys = ON", params![])
        .await
        .map_err(|error| initialization_error(error.to_string()))?;
    // Per connection; the pragma returns a row, hence query().
    let mut rows = conn
        .query("PRAGMA busy_timeout = 5000", params![])
        .await
        .map_err(|error| initialization_error(error.to_string()))?;
    let _ = rows.next().await;
    Ok(())
}

/// Switches the database to WAL so readers are not blocked by the writer.
/// `journal_mode` persists, so this runs once at startup.
pub(crate) async fn enable_wal_mode(conn: &Connection) -> Result<(), MemoryError> {
    let mut rows = conn
        .query("PRAGMA journal_mode = WAL", params![])
        .await
        .map_err(|error| initialization_error(format!("failed to enable WAL mode: {error}")))?;
    let _ = rows.next().await;
    Ok(())
}

pub(crate) async fn ensure_migration_bookkeeping(conn: &Connection) -> Result<(), MemoryError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS memory_migrations (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        params![],
    )
    .await
    .map_err(|error| migration_error(error.to_string()))?;
    Ok(())
}

pub(crate) async fn run_pending_migrations(conn: &Connection) -> Result<(), MemoryError> {
    let applied_versions = applied_migration_versions(conn).await?;
    for migration in MIGRATIONS {
        if applied_versions.contains(migration.version) {
            continue;
        }

        conn.execute("BEGIN IMMEDIATE TRANSACTION", params![])
            .await
            .map_err(|error| migration_error(error.to_string()))?;
        let migration_result = async {
            conn.execute_batch(migration.sql)
                .await
                .map_err(|error| migration_error(error.to_string()))?;
            conn.execute(
                "INSERT INTO memory_migrations (version) VALUES (?1)",
                params![migration.version],
            )
            .await
            .map_err(|error| migration_error(error.to_string()))?;
            Ok::<(), MemoryError>(())
        }
        .await;
        if let Err(error) = migration_result {
            rollback_quietly(conn).await;
            return Err(error);
        }
        conn.execute("COMMIT TRANSACTION", params![])
            .await
            .map_err(|error| migration_error(error.to_string()))?;
    }
    Ok(())
}

pub(crate) async fn applied_migration_versions(
    conn: &Connection,
) -> Result<HashSet<String>, MemoryError> {
    let mut rows = conn
        .query(
            "SELECT version FROM memory_migrations ORDER BY version ASC",
            params![],
        )
        .await
        .map_err(|error| migration_error(error.to_string()))?;

    let mut versions = HashSet::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|error| migration_error(error.to_string()))?
    {
        let version = row
            .get::<String>(0)
            .map_err(|error| migration_error(error.to_string()))?;
        versions.insert(version);
    }
    Ok(versions)
}

pub(crate) async fn verify_required_schema(conn: &Connection) -> Result<(), MemoryError> {
    for table in REQUIRED_TABLES {
        if !schema_exists(conn, "table", table).await? {
            return Err(initialization_error(format!(
                "required table `{table}` is missing after migration"
            )));
        }
    }
    for index in REQUIRED_INDEXES {
        if !schema_exists(conn, "index", index).await? {
            return Err(initialization_error(format!(
                "required index `{index}` is missing after migration"
            )));
        }
    }
    Ok(())
}

pub(crate) async fn schema_exists(
    conn: &Connection,
    schema_type: &str,
    object_name: &str,
) -> Result<bool, MemoryError> {
    let mut rows = conn
        .query(
            "SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2 LIMIT 1",
            params![schema_type, object_name],
        )
        .await
        .map_err(|error| initialization_error(error.to_string()))?;
    rows.next()
        .await
        .map(|row| row.is_some())
        .map_err(|error| initialization_error(error.to_string()))
}
