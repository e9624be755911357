//! Structured TEI-style XML export of a document.
//!
//! UTF-8 with an XML declaration, complete escaping, an XML-1.0 invalid
//! codepoint filter, and a header block carrying the document's
//! identifying metadata. Line units are exported by default; structure
//! units are included on request.

use std::path::Path;

use sqlx::{Row, SqlitePool};

use crate::error::EngineError;
use crate::models::{Document, Unit};

use super::{xml_escape, xml_filter_invalid};

async fn fetch_document(pool: &SqlitePool, doc_id: i64) -> Result<Document, EngineError> {
    let row = sqlx::query(
        "SELECT doc_id, title, language, doc_role, resource_type, meta_json,
                source_path, source_hash, created_at
         FROM documents WHERE doc_id = ?",
    )
    .bind(doc_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| EngineError::not_found(format!("Document doc_id={} not found", doc_id)))?;

    Ok(Document {
        doc_id: row.get("doc_id"),
        title: row.get("title"),
        language: row.get("language"),
        doc_role: row.get("doc_role"),
        resource_type: row.get("resource_type"),
        meta_json: row.get("meta_json"),
        source_path: row.get("source_path"),
        source_hash: row.get("source_hash"),
        created_at: row.get("created_at"),
    })
}

async fn fetch_units(
    pool: &SqlitePool,
    doc_id: i64,
    include_structure: bool,
) -> Result<Vec<Unit>, EngineError> {
    let sql = if include_structure {
        "SELECT unit_id, doc_id, unit_type, n, external_id, text_raw, text_norm, meta_json
         FROM units WHERE doc_id = ? ORDER BY n"
    } else {
        "SELECT unit_id, doc_id, unit_type, n, external_id, text_raw, text_norm, meta_json
         FROM units WHERE doc_id = ? AND unit_type = 'line' ORDER BY n"
    };
    let rows = sqlx::query(sql).bind(doc_id).fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|row| Unit {
            unit_id: row.get("unit_id"),
            doc_id: row.get("doc_id"),
            unit_type: row.get("unit_type"),
            n: row.get("n"),
            external_id: row.get("external_id"),
            text_raw: row.get("text_raw"),
            text_norm: row.get("text_norm"),
            meta_json: row.get("meta_json"),
        })
        .collect())
}

/// Export one document to `out_path`. Returns the number of units written.
pub async fn export_document(
    pool: &SqlitePool,
    doc_id: i64,
    out_path: &Path,
    include_structure: bool,
) -> Result<usize, EngineError> {
    let doc = fetch_document(pool, doc_id).await?;
    let units = fetch_units(pool, doc_id, include_structure).await?;

    let esc = |value: &str| xml_escape(&xml_filter_invalid(value));

    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<TEI xmlns=\"http://www.tei-c.org/ns/1.0\">\n");
    xml.push_str("  <teiHeader>\n    <fileDesc>\n      <titleStmt>\n");
    xml.push_str(&format!(
        "        <title>{}</title>\n",
        esc(doc.title.as_deref().unwrap_or("untitled"))
    ));
    xml.push_str("      </titleStmt>\n      <sourceDesc>\n");
    xml.push_str(&format!("        <p>doc_id: {}</p>\n", doc.doc_id));
    xml.push_str(&format!("        <p>doc_role: {}</p>\n", esc(&doc.doc_role)));
    if let Some(ref resource_type) = doc.resource_type {
        xml.push_str(&format!("        <p>resource_type: {}</p>\n", esc(resource_type)));
    }
    if let Some(ref source_path) = doc.source_path {
        xml.push_str(&format!("        <p>source: {}</p>\n", esc(source_path)));
    }
    if let Some(ref source_hash) = doc.source_hash {
        xml.push_str(&format!("        <p>source_hash: {}</p>\n", esc(source_hash)));
    }
    xml.push_str(&format!("        <p>created: {}</p>\n", esc(&doc.created_at)));
    xml.push_str("      </sourceDesc>\n    </fileDesc>\n  </teiHeader>\n");

    match doc.language {
        Some(ref language) if !language.is_empty() => {
            xml.push_str(&format!("  <text xml:lang=\"{}\">\n", esc(language)));
        }
        _ => xml.push_str("  <text>\n"),
    }
    xml.push_str("    <body>\n");

    for unit in &units {
        if unit.unit_type == "line" {
            match unit.external_id {
                Some(external_id) => xml.push_str(&format!(
                    "      <p xml:id=\"u{}\" n=\"{}\">{}</p>\n",
                    external_id,
                    unit.n,
                    esc(&unit.text_norm)
                )),
                None => xml.push_str(&format!(
                    "      <p n=\"{}\">{}</p>\n",
                    unit.n,
                    esc(&unit.text_norm)
                )),
            }
        } else {
            xml.push_str(&format!(
                "      <ab type=\"structure\" n=\"{}\">{}</ab>\n",
                unit.n,
                esc(&unit.text_norm)
            ));
        }
    }

    xml.push_str("    </body>\n  </text>\n</TEI>\n");

    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(out_path, xml)?;
    Ok(units.len())
}
