//! Alignment dump as CSV or TSV.
//!
//! Rows of `(link_id, pivot_doc_id, target_doc_id, external_id,
//! pivot_external_id, target_external_id, pivot_text, target_text, status)`
//! filtered optionally by pivot document, target document, or exact
//! external id. The delimiter is a parameter (`,` or tab).

use std::io::Write;
use std::path::Path;

use serde::Deserialize;
use sqlx::{Row, SqlitePool};

use crate::error::EngineError;

use super::csv_field;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AlignCsvParams {
    #[serde(default)]
    pub pivot_doc_id: Option<i64>,
    #[serde(default)]
    pub target_doc_id: Option<i64>,
    #[serde(default)]
    pub external_id: Option<i64>,
    /// `","` (default) or `"\t"`.
    #[serde(default)]
    pub delimiter: Option<String>,
}

const HEADER: &[&str] = &[
    "link_id",
    "pivot_doc_id",
    "target_doc_id",
    "external_id",
    "pivot_external_id",
    "target_external_id",
    "pivot_text",
    "target_text",
    "status",
];

/// Write the alignment dump to `out_path`. Returns the row count written
/// (header excluded).
pub async fn export_alignment(
    pool: &SqlitePool,
    params: &AlignCsvParams,
    out_path: &Path,
) -> Result<usize, EngineError> {
    let delimiter = match params.delimiter.as_deref() {
        None | Some(",") => ',',
        Some("\t") => '\t',
        Some(other) => {
            return Err(EngineError::validation(format!(
                "delimiter must be ',' or '\\t', got {:?}",
                other
            )))
        }
    };

    let mut sql = String::from(
        r#"
        SELECT al.link_id, al.pivot_doc_id, al.target_doc_id, al.external_id,
               pu.external_id AS pivot_external_id, tu.external_id AS target_external_id,
               pu.text_norm AS pivot_text, tu.text_norm AS target_text, al.status
        FROM alignment_links al
        JOIN units pu ON pu.unit_id = al.pivot_unit_id
        JOIN units tu ON tu.unit_id = al.target_unit_id
        WHERE 1 = 1
        "#,
    );
    if params.pivot_doc_id.is_some() {
        sql.push_str(" AND al.pivot_doc_id = ?");
    }
    if params.target_doc_id.is_some() {
        sql.push_str(" AND al.target_doc_id = ?");
    }
    if params.external_id.is_some() {
        sql.push_str(" AND al.external_id = ?");
    }
    sql.push_str(" ORDER BY al.pivot_doc_id, al.target_doc_id, al.external_id, al.link_id");

    let mut query = sqlx::query(&sql);
    if let Some(pivot_doc_id) = params.pivot_doc_id {
        query = query.bind(pivot_doc_id);
    }
    if let Some(target_doc_id) = params.target_doc_id {
        query = query.bind(target_doc_id);
    }
    if let Some(external_id) = params.external_id {
        query = query.bind(external_id);
    }
    let rows = query.fetch_all(pool).await?;

    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = std::fs::File::create(out_path)?;

    let sep = delimiter.to_string();
    writeln!(file, "{}", HEADER.join(&sep))?;

    for row in &rows {
        let opt_i64 = |name: &str| -> String {
            row.get::<Option<i64>, _>(name)
                .map(|v| v.to_string())
                .unwrap_or_default()
        };
        let fields = [
            row.get::<i64, _>("link_id").to_string(),
            row.get::<i64, _>("pivot_doc_id").to_string(),
            row.get::<i64, _>("target_doc_id").to_string(),
            opt_i64("external_id"),
            opt_i64("pivot_external_id"),
            opt_i64("target_external_id"),
            row.get::<String, _>("pivot_text"),
            row.get::<String, _>("target_text"),
            row.get::<Option<String>, _>("status").unwrap_or_default(),
        ];
        let line = fields
            .iter()
            .map(|field| csv_field(field, delimiter))
            .collect::<Vec<_>>()
            .join(&sep);
        writeln!(file, "{}", line)?;
    }

    Ok(rows.len())
}
