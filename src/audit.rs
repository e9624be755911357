//! Alignment audit surface: link listing, review status, retargeting, and
//! quality metrics for a pivot↔target pair.
//!
//! Listing paginates with the same `limit + 1` lookahead scheme as the
//! query engine. Status mutation is idempotent and restricted to
//! `accepted`, `rejected`, or `null` (unreviewed). Retargeting requires the
//! new target to exist and be a `line` unit.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::error::EngineError;
use crate::models::AlignmentLink;

/// One audited link row, with both unit texts joined in.
#[derive(Debug, Clone, Serialize)]
pub struct AuditLink {
    pub link_id: i64,
    pub external_id: Option<i64>,
    pub pivot_unit_id: i64,
    pub target_unit_id: i64,
    pub pivot_text: String,
    pub target_text: String,
    pub status: Option<String>,
}

/// Parameters for a paginated link listing.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditParams {
    pub pivot_doc_id: i64,
    pub target_doc_id: i64,
    #[serde(default)]
    pub external_id: Option<i64>,
    /// `None` = all; `"unreviewed"`, `"accepted"`, or `"rejected"`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Paginated audit result.
#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub pivot_doc_id: i64,
    pub target_doc_id: i64,
    pub links: Vec<AuditLink>,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
    pub next_offset: Option<i64>,
}

/// List links for a pivot↔target pair with optional filters.
pub async fn list_links(pool: &SqlitePool, params: &AuditParams) -> Result<AuditPage, EngineError> {
    if !(1..=200).contains(&params.limit) {
        return Err(EngineError::validation("limit must be in [1, 200]"));
    }
    if params.offset < 0 {
        return Err(EngineError::validation("offset must be >= 0"));
    }

    let mut sql = String::from(
        r#"
        SELECT al.link_id, al.external_id, al.pivot_unit_id, al.target_unit_id,
               pu.text_norm AS pivot_text, tu.text_norm AS target_text, al.status
        FROM alignment_links al
        JOIN units pu ON pu.unit_id = al.pivot_unit_id
        JOIN units tu ON tu.unit_id = al.target_unit_id
        WHERE al.pivot_doc_id = ? AND al.target_doc_id = ?
        "#,
    );
    if params.external_id.is_some() {
        sql.push_str(" AND al.external_id = ?");
    }
    match params.status.as_deref() {
        None => {}
        Some("unreviewed") => sql.push_str(" AND al.status IS NULL"),
        Some("accepted") | Some("rejected") => sql.push_str(" AND al.status = ?"),
        Some(other) => {
            return Err(EngineError::validation(format!(
                "status filter must be 'unreviewed', 'accepted', or 'rejected', got '{}'",
                other
            )))
        }
    }
    sql.push_str(" ORDER BY al.external_id, al.link_id LIMIT ? OFFSET ?");

    let mut query = sqlx::query(&sql)
        .bind(params.pivot_doc_id)
        .bind(params.target_doc_id);
    if let Some(external_id) = params.external_id {
        query = query.bind(external_id);
    }
    if let Some(status) = params.status.as_deref() {
        if status == "accepted" || status == "rejected" {
            query = query.bind(status.to_string());
        }
    }
    query = query.bind(params.limit + 1).bind(params.offset);

    let rows = query.fetch_all(pool).await?;
    let has_more = rows.len() as i64 > params.limit;
    let next_offset = has_more.then_some(params.offset + params.limit);

    let links = rows
        .into_iter()
        .take(params.limit as usize)
        .map(|row| AuditLink {
            link_id: row.get("link_id"),
            external_id: row.get("external_id"),
            pivot_unit_id: row.get("pivot_unit_id"),
            target_unit_id: row.get("target_unit_id"),
            pivot_text: row.get("pivot_text"),
            target_text: row.get("target_text"),
            status: row.get("status"),
        })
        .collect();

    Ok(AuditPage {
        pivot_doc_id: params.pivot_doc_id,
        target_doc_id: params.target_doc_id,
        links,
        limit: params.limit,
        offset: params.offset,
        has_more,
        next_offset,
    })
}

/// Set a link's review status to `accepted`, `rejected`, or back to
/// unreviewed (`None`). Idempotent; returns the refreshed link.
pub async fn update_link_status(
    pool: &SqlitePool,
    link_id: i64,
    status: Option<&str>,
) -> Result<AlignmentLink, EngineError> {
    match status {
        None | Some("accepted") | Some("rejected") => {}
        Some(other) => {
            return Err(EngineError::validation(format!(
                "status must be 'accepted', 'rejected', or null, got '{}'",
                other
            )))
        }
    }

    let result = sqlx::query("UPDATE alignment_links SET status = ? WHERE link_id = ?")
        .bind(status)
        .bind(link_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(EngineError::not_found(format!("link_id={} not found", link_id)));
    }

    let row = sqlx::query(
        "SELECT link_id, run_id, pivot_unit_id, target_unit_id, external_id,
                pivot_doc_id, target_doc_id, status, created_at
         FROM alignment_links WHERE link_id = ?",
    )
    .bind(link_id)
    .fetch_one(pool)
    .await?;
    Ok(AlignmentLink {
        link_id: row.get("link_id"),
        run_id: row.get("run_id"),
        pivot_unit_id: row.get("pivot_unit_id"),
        target_unit_id: row.get("target_unit_id"),
        external_id: row.get("external_id"),
        pivot_doc_id: row.get("pivot_doc_id"),
        target_doc_id: row.get("target_doc_id"),
        status: row.get("status"),
        created_at: row.get("created_at"),
    })
}

/// Delete a link by identity. Returns the number of rows removed (0 or 1).
pub async fn delete_link(pool: &SqlitePool, link_id: i64) -> Result<u64, EngineError> {
    let result = sqlx::query("DELETE FROM alignment_links WHERE link_id = ?")
        .bind(link_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Change the target unit of an existing link. The new target must exist
/// and be a `line` unit.
pub async fn retarget_link(
    pool: &SqlitePool,
    link_id: i64,
    new_target_unit_id: i64,
) -> Result<(), EngineError> {
    let row = sqlx::query("SELECT unit_type, doc_id FROM units WHERE unit_id = ?")
        .bind(new_target_unit_id)
        .fetch_optional(pool)
        .await?;
    let row = row.ok_or_else(|| {
        EngineError::not_found(format!(
            "new_target_unit_id={} does not exist",
            new_target_unit_id
        ))
    })?;
    let unit_type: String = row.get("unit_type");
    if unit_type != "line" {
        return Err(EngineError::validation(format!(
            "new_target_unit_id={} is a {} unit; only line units can be aligned",
            new_target_unit_id, unit_type
        )));
    }
    let new_target_doc_id: i64 = row.get("doc_id");

    let result = sqlx::query(
        "UPDATE alignment_links SET target_unit_id = ?, target_doc_id = ? WHERE link_id = ?",
    )
    .bind(new_target_unit_id)
    .bind(new_target_doc_id)
    .bind(link_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(EngineError::not_found(format!("link_id={} not found", link_id)));
    }
    Ok(())
}

/// Review-status tallies for a pair.
#[derive(Debug, Clone, Serialize)]
pub struct StatusCounts {
    pub unreviewed: i64,
    pub accepted: i64,
    pub rejected: i64,
}

/// A sampled orphan unit (no link on its side of the pair).
#[derive(Debug, Clone, Serialize)]
pub struct OrphanUnit {
    pub unit_id: i64,
    pub external_id: Option<i64>,
    pub text: String,
}

/// Coverage, orphan, collision, and status metrics for a pivot↔target
/// pair, optionally scoped to one run.
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub pivot_doc_id: i64,
    pub target_doc_id: i64,
    pub run_id: Option<String>,
    pub total_pivot_units: i64,
    pub total_target_units: i64,
    pub total_links: i64,
    pub covered_pivot_units: i64,
    pub covered_target_units: i64,
    pub coverage_pct: f64,
    pub orphan_pivot_count: i64,
    pub orphan_target_count: i64,
    /// Pivot units appearing in more than one link for this pair.
    pub collision_count: i64,
    pub status_counts: StatusCounts,
    pub sample_orphan_pivot: Vec<OrphanUnit>,
    pub sample_orphan_target: Vec<OrphanUnit>,
}

/// Compute quality metrics for a pivot↔target pair.
pub async fn quality(
    pool: &SqlitePool,
    pivot_doc_id: i64,
    target_doc_id: i64,
    run_id: Option<&str>,
) -> Result<QualityReport, EngineError> {
    let run_filter = if run_id.is_some() { " AND al.run_id = ?" } else { "" };

    let sql = format!(
        r#"
        SELECT
            COUNT(*)                          AS total_links,
            COUNT(DISTINCT al.pivot_unit_id)  AS covered_pivot,
            COUNT(DISTINCT al.target_unit_id) AS covered_target,
            SUM(CASE WHEN al.status IS NULL      THEN 1 ELSE 0 END) AS n_unreviewed,
            SUM(CASE WHEN al.status = 'accepted' THEN 1 ELSE 0 END) AS n_accepted,
            SUM(CASE WHEN al.status = 'rejected' THEN 1 ELSE 0 END) AS n_rejected
        FROM alignment_links al
        WHERE al.pivot_doc_id = ? AND al.target_doc_id = ?{run_filter}
        "#
    );
    let mut agg = sqlx::query(&sql).bind(pivot_doc_id).bind(target_doc_id);
    if let Some(run_id) = run_id {
        agg = agg.bind(run_id);
    }
    let agg = agg.fetch_one(pool).await?;

    let total_links: i64 = agg.get("total_links");
    let covered_pivot: i64 = agg.get("covered_pivot");
    let covered_target: i64 = agg.get("covered_target");
    let status_counts = StatusCounts {
        unreviewed: agg.get::<Option<i64>, _>("n_unreviewed").unwrap_or(0),
        accepted: agg.get::<Option<i64>, _>("n_accepted").unwrap_or(0),
        rejected: agg.get::<Option<i64>, _>("n_rejected").unwrap_or(0),
    };

    let total_pivot: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM units WHERE doc_id = ? AND unit_type = 'line'",
    )
    .bind(pivot_doc_id)
    .fetch_one(pool)
    .await?;
    let total_target: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM units WHERE doc_id = ? AND unit_type = 'line'",
    )
    .bind(target_doc_id)
    .fetch_one(pool)
    .await?;

    let coverage_pct = if total_pivot > 0 {
        ((covered_pivot as f64 / total_pivot as f64 * 100.0) * 100.0).round() / 100.0
    } else {
        0.0
    };

    let collision_sql = format!(
        r#"
        SELECT COUNT(*) FROM (
            SELECT al.pivot_unit_id
            FROM alignment_links al
            WHERE al.pivot_doc_id = ? AND al.target_doc_id = ?{run_filter}
            GROUP BY al.pivot_unit_id
            HAVING COUNT(*) > 1
        )
        "#
    );
    let mut collision_query = sqlx::query_scalar::<_, i64>(&collision_sql)
        .bind(pivot_doc_id)
        .bind(target_doc_id);
    if let Some(run_id) = run_id {
        collision_query = collision_query.bind(run_id);
    }
    let collision_count = collision_query.fetch_one(pool).await?;

    let sample_orphan_pivot =
        sample_orphans(pool, pivot_doc_id, target_doc_id, run_id, true, pivot_doc_id).await?;
    let sample_orphan_target =
        sample_orphans(pool, pivot_doc_id, target_doc_id, run_id, false, target_doc_id).await?;

    Ok(QualityReport {
        pivot_doc_id,
        target_doc_id,
        run_id: run_id.map(str::to_string),
        total_pivot_units: total_pivot,
        total_target_units: total_target,
        total_links,
        covered_pivot_units: covered_pivot,
        covered_target_units: covered_target,
        coverage_pct,
        orphan_pivot_count: total_pivot - covered_pivot,
        orphan_target_count: total_target - covered_target,
        collision_count,
        status_counts,
        sample_orphan_pivot,
        sample_orphan_target,
    })
}

/// Up to 5 line units of `unit_doc_id` with no link on their side of the
/// pair.
async fn sample_orphans(
    pool: &SqlitePool,
    pivot_doc_id: i64,
    target_doc_id: i64,
    run_id: Option<&str>,
    pivot_side: bool,
    unit_doc_id: i64,
) -> Result<Vec<OrphanUnit>, EngineError> {
    let link_column = if pivot_side { "pivot_unit_id" } else { "target_unit_id" };
    let run_filter = if run_id.is_some() { " AND al.run_id = ?" } else { "" };
    let sql = format!(
        r#"
        SELECT u.unit_id, u.external_id, u.text_norm
        FROM units u
        WHERE u.doc_id = ? AND u.unit_type = 'line'
          AND u.unit_id NOT IN (
              SELECT al.{link_column} FROM alignment_links al
              WHERE al.pivot_doc_id = ? AND al.target_doc_id = ?{run_filter}
          )
        ORDER BY u.unit_id
        LIMIT 5
        "#
    );
    let mut query = sqlx::query(&sql)
        .bind(unit_doc_id)
        .bind(pivot_doc_id)
        .bind(target_doc_id);
    if let Some(run_id) = run_id {
        query = query.bind(run_id);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|row| OrphanUnit {
            unit_id: row.get("unit_id"),
            external_id: row.get("external_id"),
            text: row.get("text_norm"),
        })
        .collect())
}
