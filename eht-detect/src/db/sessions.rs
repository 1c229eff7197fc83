//! Detection session database operations

use eht_common::time::{now_rfc3339, parse_rfc3339};
use eht_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::models::{DetectionSession, NewSession, WORKFLOW_DETECTION};

const SESSION_COLUMNS: &str = "id, user_id, project_name, workflow_type, dataset_path, mask_path, \
                               total_layers, created_at, updated_at";

fn session_from_row(row: &SqliteRow) -> Result<DetectionSession> {
    let created_at: String = row.get("created_at");
    let updated_at: Option<String> = row.get("updated_at");

    Ok(DetectionSession {
        id: row.get("id"),
        user_id: row.get("user_id"),
        project_name: row.get("project_name"),
        workflow_type: row.get("workflow_type"),
        dataset_path: row.get("dataset_path"),
        mask_path: row.get("mask_path"),
        total_layers: row.get("total_layers"),
        created_at: parse_rfc3339(&created_at)?,
        updated_at: updated_at.as_deref().map(parse_rfc3339).transpose()?,
    })
}

/// Create a session and one layer record per name, atomically
///
/// Layers get dense indices `0..layer_names.len()` and the default
/// classification. Returns the new session id.
pub async fn create_session(
    pool: &SqlitePool,
    session: &NewSession,
    layer_names: &[String],
) -> Result<i64> {
    let now = now_rfc3339();
    let mut tx = pool.begin().await?;

    let session_id: i64 = sqlx::query(
        r#"
        INSERT INTO detection_sessions (
            user_id, project_name, workflow_type, dataset_path, mask_path,
            total_layers, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(session.user_id)
    .bind(&session.project_name)
    .bind(WORKFLOW_DETECTION)
    .bind(&session.dataset_path)
    .bind(&session.mask_path)
    .bind(layer_names.len() as i64)
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    for (index, name) in layer_names.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO detection_layers (session_id, layer_index, layer_name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(index as i64)
        .bind(name)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    debug!(session_id, layers = layer_names.len(), "Created detection session");
    Ok(session_id)
}

/// Load a session only if it belongs to `user_id`
pub async fn get_owned_session(
    pool: &SqlitePool,
    session_id: i64,
    user_id: i64,
) -> Result<Option<DetectionSession>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM detection_sessions WHERE id = ? AND user_id = ?",
        SESSION_COLUMNS
    ))
    .bind(session_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(session_from_row).transpose()
}

/// Delete a session and its layers; returns whether the session existed
pub async fn delete_session(pool: &SqlitePool, session_id: i64) -> Result<bool> {
    let mut tx = pool.begin().await?;

    // Explicit so the layers go even when foreign keys are not enforced
    sqlx::query("DELETE FROM detection_layers WHERE session_id = ?")
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
    let deleted = sqlx::query("DELETE FROM detection_sessions WHERE id = ?")
        .bind(session_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;
    Ok(deleted > 0)
}

/// Bump `updated_at` after a change that does not touch the session row
pub async fn touch_session(pool: &SqlitePool, session_id: i64) -> Result<()> {
    sqlx::query("UPDATE detection_sessions SET updated_at = ? WHERE id = ?")
        .bind(now_rfc3339())
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(())
}
