//! TXT numbered-lines importer.
//!
//! Reads a plain-text file where numbered lines follow the pattern
//! `[n] text content here`. Matching lines become `line` units with the
//! parsed anchor; non-empty non-matching lines become `structure` units;
//! blank lines are skipped. The encoding detection path is recorded in the
//! document metadata.

use std::path::Path;

use sqlx::SqlitePool;

use crate::encoding;
use crate::error::EngineError;
use crate::textnorm::sha256_hex;

use super::{ImportOptions, ImportReport, NewDocument, NewUnit, NUMBERED_RE};

pub async fn import_txt_numbered_lines(
    pool: &SqlitePool,
    path: &Path,
    options: &ImportOptions,
) -> Result<ImportReport, EngineError> {
    let raw_bytes = std::fs::read(path)?;
    let source_hash = sha256_hex(&raw_bytes);
    let decoded = encoding::decode_bytes(&raw_bytes);

    let mut report = ImportReport {
        encoding: Some(decoded.encoding.clone()),
        enc_method: Some(decoded.method.to_string()),
        ..Default::default()
    };
    if decoded.method.ends_with("-fallback") {
        report.warnings.push(format!(
            "Encoding detection fell back to {} for {}",
            decoded.encoding,
            path.file_name().map(|f| f.to_string_lossy()).unwrap_or_default()
        ));
    }

    let mut units: Vec<NewUnit> = Vec::new();
    let mut external_ids: Vec<i64> = Vec::new();
    let mut n: i64 = 0;

    for raw_line in decoded.text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        n += 1;
        if let Some(caps) = NUMBERED_RE.captures(line) {
            let ext_id: i64 = caps[1].parse().map_err(|_| {
                EngineError::validation(format!("external_id out of range on line n={}", n))
            })?;
            external_ids.push(ext_id);
            units.push(NewUnit::line(n, Some(ext_id), &caps[2]));
        } else {
            units.push(NewUnit::structure(n, line));
        }
    }

    let title = options
        .title
        .clone()
        .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "untitled".to_string());

    let doc = NewDocument {
        title,
        language: options.language.clone(),
        doc_role: options.doc_role.clone(),
        resource_type: options.resource_type.clone(),
        meta_json: Some(
            serde_json::json!({"encoding": decoded.encoding, "enc_method": decoded.method})
                .to_string(),
        ),
        source_path: path.display().to_string(),
        source_hash,
    };

    let doc_id = super::write_unit_graph(pool, &doc, &units)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;

    report.doc_id = doc_id;
    report.units_total = units.len();
    report.units_line = external_ids.len();
    report.units_structure = units.len() - external_ids.len();
    report.analyze_anchors(&external_ids);

    Ok(report)
}
