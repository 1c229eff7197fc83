//! Detection layer database operations

use eht_common::time::{now_rfc3339, parse_rfc3339};
use eht_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::classification::Classification;
use crate::models::DetectionLayer;

fn parse_stored_classification(value: &str) -> Result<Classification> {
    value
        .parse()
        .map_err(|_| Error::Internal(format!("Unknown stored classification '{}'", value)))
}

fn layer_from_row(row: &SqliteRow) -> Result<DetectionLayer> {
    let classification: String = row.get("classification");
    let created_at: String = row.get("created_at");
    let updated_at: Option<String> = row.get("updated_at");

    Ok(DetectionLayer {
        id: row.get("id"),
        session_id: row.get("session_id"),
        layer_index: row.get("layer_index"),
        layer_name: row.get("layer_name"),
        classification: parse_stored_classification(&classification)?,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: updated_at.as_deref().map(parse_rfc3339).transpose()?,
    })
}

/// Layers with `start <= layer_index < end`, ascending by index
pub async fn list_layers_in_range(
    pool: &SqlitePool,
    session_id: i64,
    start: i64,
    end: i64,
) -> Result<Vec<DetectionLayer>> {
    let rows = sqlx::query(
        r#"
        SELECT id, session_id, layer_index, layer_name, classification, created_at, updated_at
        FROM detection_layers
        WHERE session_id = ? AND layer_index >= ? AND layer_index < ?
        ORDER BY layer_index ASC
        "#,
    )
    .bind(session_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    rows.iter().map(layer_from_row).collect()
}

/// Set the classification of every listed layer that belongs to the session
///
/// Ids outside the session are skipped. Returns the number of updates; an id
/// listed twice counts twice. All updates commit together.
pub async fn classify_layers(
    pool: &SqlitePool,
    session_id: i64,
    layer_ids: &[i64],
    classification: Classification,
) -> Result<u64> {
    let now = now_rfc3339();
    let mut tx = pool.begin().await?;

    let mut updated = 0;
    for layer_id in layer_ids {
        updated += sqlx::query(
            "UPDATE detection_layers SET classification = ?, updated_at = ? \
             WHERE id = ? AND session_id = ?",
        )
        .bind(classification.as_str())
        .bind(&now)
        .bind(layer_id)
        .bind(session_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }

    tx.commit().await?;
    Ok(updated)
}

/// Per-classification layer counts for a session
pub async fn count_by_classification(
    pool: &SqlitePool,
    session_id: i64,
) -> Result<Vec<(Classification, i64)>> {
    let rows = sqlx::query(
        "SELECT classification, COUNT(*) AS count FROM detection_layers \
         WHERE session_id = ? GROUP BY classification",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<(Classification, i64)> {
            let classification: String = row.get("classification");
            Ok((parse_stored_classification(&classification)?, row.get("count")))
        })
        .collect()
}
