//! FTS5 index management.
//!
//! `fts_units` is a regular (non-content) FTS5 table; its rowid equals
//! `unit_id`, which keeps JOINs back to `units` and `documents`
//! straightforward and rebuilds deterministic. Only `line` units are
//! indexed; `structure` units never are.
//!
//! Full rebuild is the supported refresh mode. Any operation that changes
//! `text_norm` or the set of line units (curation, segmentation, import)
//! marks the index stale via [`mark_stale`]; [`build_index`] clears the
//! flag. A stale index is not an error — queries serve the last successful
//! index and surface the flag.

use anyhow::Result;
use sqlx::SqlitePool;

const STALE_KEY: &str = "fts_stale";

/// Rebuild the FTS5 index from scratch and clear the stale flag.
/// Returns the count of line units indexed.
pub async fn build_index(pool: &SqlitePool) -> Result<u64> {
    let mut tx = pool.begin().await?;

    // Regular (non-contentless) FTS5 table, so DELETE FROM is supported.
    sqlx::query("DELETE FROM fts_units").execute(&mut *tx).await?;

    sqlx::query(
        r#"
        INSERT INTO fts_units (rowid, text_norm)
        SELECT unit_id, text_norm FROM units WHERE unit_type = 'line'
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO engine_state (key, value) VALUES (?, '0')
         ON CONFLICT(key) DO UPDATE SET value = '0'",
    )
    .bind(STALE_KEY)
    .execute(&mut *tx)
    .await?;

    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM units WHERE unit_type = 'line'")
            .fetch_one(&mut *tx)
            .await?;

    tx.commit().await?;

    tracing::info!(units_indexed = count, "FTS5 index rebuilt");
    Ok(count as u64)
}

/// Flag the index stale after a mutation of `text_norm` or the line-unit
/// set. An explicit rebuild is required before the index is current again.
pub async fn mark_stale(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "INSERT INTO engine_state (key, value) VALUES (?, '1')
         ON CONFLICT(key) DO UPDATE SET value = '1'",
    )
    .bind(STALE_KEY)
    .execute(pool)
    .await?;
    Ok(())
}

/// Whether the index is currently stale. An index never built is stale.
pub async fn is_stale(pool: &SqlitePool) -> Result<bool> {
    let value: Option<String> =
        sqlx::query_scalar("SELECT value FROM engine_state WHERE key = ?")
            .bind(STALE_KEY)
            .fetch_optional(pool)
            .await?;
    Ok(value.as_deref() != Some("0"))
}
