//! Database initialization
//!
//! Opens (creating if needed) the SQLite database and ensures the review
//! tables exist. Schema creation is idempotent and runs on every startup.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Open the database at `db_path`, creating file and tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // WAL lets page reads proceed while a classification write commits
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(5000));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Open a private in-memory database with the review schema
///
/// Uses a single long-lived connection so every query sees the same
/// database. Intended for tests and throwaway tooling.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all review tables (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_detection_sessions_table(pool).await?;
    create_detection_layers_table(pool).await?;
    Ok(())
}

async fn create_detection_sessions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS detection_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            project_name TEXT NOT NULL DEFAULT 'Untitled Project',
            workflow_type TEXT NOT NULL DEFAULT 'detection',
            dataset_path TEXT NOT NULL,
            mask_path TEXT,
            total_layers INTEGER NOT NULL DEFAULT 0 CHECK (total_layers >= 0),
            created_at TEXT NOT NULL,
            updated_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_detection_sessions_user ON detection_sessions(user_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_detection_layers_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS detection_layers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL
                REFERENCES detection_sessions(id) ON DELETE CASCADE,
            layer_index INTEGER NOT NULL CHECK (layer_index >= 0),
            layer_name TEXT NOT NULL,
            classification TEXT NOT NULL DEFAULT 'error'
                CHECK (classification IN ('error', 'correct', 'incorrect', 'unsure')),
            created_at TEXT NOT NULL,
            updated_at TEXT,
            UNIQUE (session_id, layer_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
