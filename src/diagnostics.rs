//! Database diagnostics helpers.
//!
//! Collects operational health signals from a corpus database without
//! mutating domain data: SQLite integrity, applied schema versions, table
//! counts, structural FTS staleness (independent of the stale flag),
//! run-log completeness, alignment-link referential checks, and document
//! metadata gaps. Findings land in `issues` and roll up into an overall
//! `status` (`ok` / `warning` / `error`). Intended for local debugging and
//! CI sanity checks.

use std::collections::BTreeMap;

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityInfo {
    pub ok: bool,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaInfo {
    pub versions_applied: Vec<i64>,
    pub current_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CountsInfo {
    pub documents: i64,
    pub units_total: i64,
    pub line_units: i64,
    pub structure_units: i64,
    pub runs: i64,
    pub alignment_links: i64,
    pub fts_rows: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FtsInfo {
    pub row_delta_vs_line_units: i64,
    /// Line units with no FTS row.
    pub missing_line_units: i64,
    /// FTS rows whose rowid matches no line unit.
    pub orphan_rows: i64,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunsInfo {
    pub by_kind: BTreeMap<String, i64>,
    pub without_stats: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlignmentInfo {
    pub dangling_pivot_units: i64,
    pub dangling_target_units: i64,
    /// Links whose denormalized pivot_doc_id disagrees with the unit's.
    pub pivot_doc_mismatch: i64,
    pub target_doc_mismatch: i64,
    pub self_links: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataInfo {
    pub missing_required_fields: i64,
    pub docs_without_line_units: i64,
}

/// Full diagnostics report, JSON-shaped for the CLI and reports.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub status: &'static str,
    pub issues: Vec<String>,
    pub integrity: IntegrityInfo,
    pub schema: SchemaInfo,
    pub counts: CountsInfo,
    pub fts: FtsInfo,
    pub runs: RunsInfo,
    pub alignment: AlignmentInfo,
    pub metadata: MetadataInfo,
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<i64, EngineError> {
    let n: i64 = sqlx::query_scalar(sql).fetch_one(pool).await?;
    Ok(n)
}

/// Collect a diagnostics report for a corpus database. Read-only.
pub async fn collect_diagnostics(pool: &SqlitePool) -> Result<DiagnosticsReport, EngineError> {
    let integrity: String = sqlx::query_scalar("PRAGMA integrity_check")
        .fetch_optional(pool)
        .await?
        .unwrap_or_else(|| "unknown".to_string());
    let integrity_ok = integrity == "ok";

    let versions_applied: Vec<i64> =
        sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version")
            .fetch_all(pool)
            .await?;
    let current_version = versions_applied.last().copied();

    let counts = CountsInfo {
        documents: count(pool, "SELECT COUNT(*) FROM documents").await?,
        units_total: count(pool, "SELECT COUNT(*) FROM units").await?,
        line_units: count(pool, "SELECT COUNT(*) FROM units WHERE unit_type = 'line'").await?,
        structure_units: count(pool, "SELECT COUNT(*) FROM units WHERE unit_type = 'structure'")
            .await?,
        runs: count(pool, "SELECT COUNT(*) FROM runs").await?,
        alignment_links: count(pool, "SELECT COUNT(*) FROM alignment_links").await?,
        fts_rows: count(pool, "SELECT COUNT(*) FROM fts_units").await?,
    };

    let missing_line_units = count(
        pool,
        r#"
        SELECT COUNT(*)
        FROM units u
        LEFT JOIN fts_units f ON f.rowid = u.unit_id
        WHERE u.unit_type = 'line' AND f.rowid IS NULL
        "#,
    )
    .await?;
    let orphan_rows = count(
        pool,
        r#"
        SELECT COUNT(*)
        FROM fts_units f
        LEFT JOIN units u ON u.unit_id = f.rowid
        WHERE u.unit_id IS NULL OR u.unit_type != 'line'
        "#,
    )
    .await?;
    let row_delta = counts.fts_rows - counts.line_units;
    let fts = FtsInfo {
        row_delta_vs_line_units: row_delta,
        missing_line_units,
        orphan_rows,
        stale: missing_line_units > 0 || orphan_rows > 0 || row_delta != 0,
    };

    let without_stats = count(
        pool,
        "SELECT COUNT(*) FROM runs WHERE stats_json IS NULL OR TRIM(stats_json) = ''",
    )
    .await?;
    let mut by_kind: BTreeMap<String, i64> = BTreeMap::new();
    for row in sqlx::query("SELECT kind, COUNT(*) AS n FROM runs GROUP BY kind ORDER BY kind")
        .fetch_all(pool)
        .await?
    {
        by_kind.insert(row.get("kind"), row.get("n"));
    }
    let runs = RunsInfo {
        by_kind,
        without_stats,
    };

    let alignment = AlignmentInfo {
        dangling_pivot_units: count(
            pool,
            r#"
            SELECT COUNT(*)
            FROM alignment_links a
            LEFT JOIN units u ON u.unit_id = a.pivot_unit_id
            WHERE u.unit_id IS NULL
            "#,
        )
        .await?,
        dangling_target_units: count(
            pool,
            r#"
            SELECT COUNT(*)
            FROM alignment_links a
            LEFT JOIN units u ON u.unit_id = a.target_unit_id
            WHERE u.unit_id IS NULL
            "#,
        )
        .await?,
        pivot_doc_mismatch: count(
            pool,
            r#"
            SELECT COUNT(*)
            FROM alignment_links a
            JOIN units u ON u.unit_id = a.pivot_unit_id
            WHERE u.doc_id != a.pivot_doc_id
            "#,
        )
        .await?,
        target_doc_mismatch: count(
            pool,
            r#"
            SELECT COUNT(*)
            FROM alignment_links a
            JOIN units u ON u.unit_id = a.target_unit_id
            WHERE u.doc_id != a.target_doc_id
            "#,
        )
        .await?,
        self_links: count(
            pool,
            "SELECT COUNT(*) FROM alignment_links WHERE pivot_doc_id = target_doc_id",
        )
        .await?,
    };

    let metadata = MetadataInfo {
        missing_required_fields: count(
            pool,
            "SELECT COUNT(*) FROM documents
             WHERE TRIM(COALESCE(title, '')) = '' OR TRIM(COALESCE(language, '')) = ''",
        )
        .await?,
        docs_without_line_units: count(
            pool,
            r#"
            SELECT COUNT(*)
            FROM documents d
            WHERE NOT EXISTS (
                SELECT 1 FROM units u
                WHERE u.doc_id = d.doc_id AND u.unit_type = 'line'
            )
            "#,
        )
        .await?,
    };

    let mut issues: Vec<String> = Vec::new();
    if !integrity_ok {
        issues.push(format!("SQLite integrity_check returned: {}", integrity));
    }
    if fts.stale {
        issues.push("FTS appears stale or inconsistent with line units".to_string());
    }
    if runs.without_stats > 0 {
        issues.push(format!("{} run(s) have empty stats_json", runs.without_stats));
    }
    if alignment.dangling_pivot_units > 0 || alignment.dangling_target_units > 0 {
        issues.push(format!(
            "Dangling alignment links found (pivot={}, target={})",
            alignment.dangling_pivot_units, alignment.dangling_target_units
        ));
    }
    if alignment.pivot_doc_mismatch > 0 || alignment.target_doc_mismatch > 0 {
        issues.push(format!(
            "Alignment link doc_id mismatch found (pivot={}, target={})",
            alignment.pivot_doc_mismatch, alignment.target_doc_mismatch
        ));
    }
    if alignment.self_links > 0 {
        issues.push(format!(
            "{} self-link(s) detected in alignment_links",
            alignment.self_links
        ));
    }
    if metadata.missing_required_fields > 0 {
        issues.push(format!(
            "{} document(s) have missing required title/language",
            metadata.missing_required_fields
        ));
    }
    if metadata.docs_without_line_units > 0 {
        issues.push(format!(
            "{} document(s) have no line units",
            metadata.docs_without_line_units
        ));
    }

    let status = if !integrity_ok {
        "error"
    } else if !issues.is_empty() {
        "warning"
    } else {
        "ok"
    };

    Ok(DiagnosticsReport {
        status,
        issues,
        integrity: IntegrityInfo {
            ok: integrity_ok,
            value: integrity,
        },
        schema: SchemaInfo {
            versions_applied,
            current_version,
        },
        counts,
        fts,
        runs,
        alignment,
        metadata,
    })
}
