//! Document metadata validation.
//!
//! Checks required fields (`title`, `language`), recommended fields
//! (`source_path`, `source_hash`, `doc_role`, `resource_type`), recognised
//! `doc_role` values, and flags documents with no line units. Warnings are
//! advisory and never block an operation; only a missing required field
//! marks the document invalid.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::error::EngineError;
use crate::models::DocRole;

#[derive(Debug, Clone, Serialize)]
pub struct MetaValidationResult {
    pub doc_id: i64,
    pub title: String,
    pub is_valid: bool,
    pub warnings: Vec<String>,
}

/// Validate metadata for a single document. Returns warnings, never fails
/// on content.
pub async fn validate_document(
    pool: &SqlitePool,
    doc_id: i64,
) -> Result<MetaValidationResult, EngineError> {
    let row = sqlx::query(
        "SELECT title, language, doc_role, resource_type, source_path, source_hash
         FROM documents WHERE doc_id = ?",
    )
    .bind(doc_id)
    .fetch_optional(pool)
    .await?;

    let row = match row {
        Some(row) => row,
        None => {
            return Ok(MetaValidationResult {
                doc_id,
                title: "<not found>".to_string(),
                is_valid: false,
                warnings: vec![format!("Document doc_id={} does not exist", doc_id)],
            })
        }
    };

    let mut warnings: Vec<String> = Vec::new();
    let mut is_valid = true;

    let field = |name: &str| -> Option<String> { row.get(name) };
    for name in ["title", "language"] {
        if field(name).map(|v| v.trim().is_empty()).unwrap_or(true) {
            warnings.push(format!("Required field '{}' is empty", name));
            is_valid = false;
        }
    }
    for name in ["source_path", "source_hash", "doc_role", "resource_type"] {
        if field(name).map(|v| v.trim().is_empty()).unwrap_or(true) {
            warnings.push(format!("Recommended field '{}' is empty", name));
        }
    }

    if let Some(doc_role) = field("doc_role") {
        if !doc_role.is_empty() && !DocRole::ALL.contains(&doc_role.as_str()) {
            warnings.push(format!(
                "doc_role='{}' is not a recognised value (expected one of {:?})",
                doc_role,
                DocRole::ALL
            ));
        }
    }

    let line_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM units WHERE doc_id = ? AND unit_type = 'line'",
    )
    .bind(doc_id)
    .fetch_one(pool)
    .await?;
    if line_count == 0 {
        warnings.push("Document has no line units (nothing indexed in FTS)".to_string());
    }

    Ok(MetaValidationResult {
        doc_id,
        title: field("title").unwrap_or_default(),
        is_valid,
        warnings,
    })
}

/// Validate metadata for every document in the database.
pub async fn validate_all_documents(
    pool: &SqlitePool,
) -> Result<Vec<MetaValidationResult>, EngineError> {
    let doc_ids: Vec<i64> = sqlx::query_scalar("SELECT doc_id FROM documents ORDER BY doc_id")
        .fetch_all(pool)
        .await?;

    let mut results = Vec::with_capacity(doc_ids.len());
    for doc_id in doc_ids {
        results.push(validate_document(pool, doc_id).await?);
    }
    Ok(results)
}
