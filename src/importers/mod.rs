//! Ingestion pipeline: format parsers producing an atomic unit graph.
//!
//! Supported modes:
//!
//! | Mode | Parser | Units |
//! |------|--------|-------|
//! | `txt_numbered_lines` | [`txt`] | `[n] text` lines → `line`, rest → `structure` |
//! | `docx_numbered_lines` | [`docx`] | same convention over DOCX paragraphs |
//! | `docx_paragraphs` | [`docx`] | every non-empty paragraph → `line`, `external_id = n` |
//! | `tei` | [`tei`] | `<p>` or `<s>` elements → `line`, `external_id` from `xml:id` |
//!
//! Ingestion of one document is atomic: the document row and all its units
//! land in a single transaction, or none of them do. Diagnostics
//! (duplicates, holes, non-monotonic anchors, encoding fallbacks) come back
//! as warnings inside a successful report; they never fail the import.

pub mod docx;
pub mod tei;
pub mod txt;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::Path;

use crate::error::EngineError;
use crate::models::UnitKind;
use crate::runs::utcnow_iso;
use crate::textnorm;

/// `[n] text` — leading whitespace tolerated inside the brackets.
pub static NUMBERED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[\s*(\d+)\s*\]\s*(.+)$").expect("numbered-line pattern"));

/// Import mode selector — a closed tagged set; unknown tags are validation
/// errors at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    TxtNumberedLines,
    DocxNumberedLines,
    DocxParagraphs,
    Tei,
}

impl ImportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportMode::TxtNumberedLines => "txt_numbered_lines",
            ImportMode::DocxNumberedLines => "docx_numbered_lines",
            ImportMode::DocxParagraphs => "docx_paragraphs",
            ImportMode::Tei => "tei",
        }
    }
}

/// Caller-supplied document attributes for an import.
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub language: Option<String>,
    pub title: Option<String>,
    pub doc_role: String,
    pub resource_type: Option<String>,
    /// TEI unit element: `p` (default) or `s`.
    pub tei_unit: Option<String>,
}

/// A unit ready for insertion, before its id is assigned.
#[derive(Debug, Clone)]
pub struct NewUnit {
    pub kind: UnitKind,
    pub n: i64,
    pub external_id: Option<i64>,
    pub text_raw: String,
    pub text_norm: String,
    pub meta_json: Option<String>,
}

impl NewUnit {
    /// Build a `line` unit from its raw text, applying the normalization
    /// policy and recording the separator count in metadata.
    pub fn line(n: i64, external_id: Option<i64>, text_raw: &str) -> Self {
        let text_raw = textnorm::normalize_line_endings(text_raw);
        let text_norm = textnorm::normalize(&text_raw);
        let sep_count = textnorm::count_separators(&text_raw);
        let meta_json = if sep_count > 0 {
            Some(format!("{{\"sep_count\":{}}}", sep_count))
        } else {
            None
        };
        NewUnit {
            kind: UnitKind::Line,
            n,
            external_id,
            text_raw,
            text_norm,
            meta_json,
        }
    }

    /// Build a `structure` unit (never indexed, never aligned).
    pub fn structure(n: i64, text_raw: &str) -> Self {
        let text_raw = textnorm::normalize_line_endings(text_raw);
        let text_norm = textnorm::normalize(&text_raw);
        NewUnit {
            kind: UnitKind::Structure,
            n,
            external_id: None,
            text_raw,
            text_norm,
            meta_json: None,
        }
    }
}

/// Document attributes for the `documents` row written with the units.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    pub language: Option<String>,
    pub doc_role: String,
    pub resource_type: Option<String>,
    pub meta_json: Option<String>,
    pub source_path: String,
    pub source_hash: String,
}

/// Ingestion report: document identity, unit counts, anchor diagnostics,
/// warnings, and the encoding detection path.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub doc_id: i64,
    pub units_total: usize,
    pub units_line: usize,
    pub units_structure: usize,
    pub duplicates: Vec<i64>,
    pub holes: Vec<i64>,
    pub non_monotonic: Vec<i64>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enc_method: Option<String>,
}

impl ImportReport {
    /// Fill the anchor diagnostics and their warning lines from the
    /// external-id sequence observed during parsing.
    pub fn analyze_anchors(&mut self, external_ids: &[i64]) {
        let (duplicates, holes, non_monotonic) = analyze_external_ids(external_ids);
        if !duplicates.is_empty() {
            self.warnings
                .push(format!("Duplicate external_id(s) found: {:?}", duplicates));
        }
        if !holes.is_empty() {
            self.warnings
                .push(format!("Holes in external_id sequence: {:?}", holes));
        }
        if !non_monotonic.is_empty() {
            self.warnings
                .push(format!("Non-monotonic external_id(s): {:?}", non_monotonic));
        }
        self.duplicates = duplicates;
        self.holes = holes;
        self.non_monotonic = non_monotonic;
    }
}

/// Return (duplicates, holes, non_monotonic) from a sequence of anchors in
/// document order.
pub fn analyze_external_ids(external_ids: &[i64]) -> (Vec<i64>, Vec<i64>, Vec<i64>) {
    use std::collections::BTreeSet;

    let mut seen: BTreeSet<i64> = BTreeSet::new();
    let mut duplicates: Vec<i64> = Vec::new();
    let mut non_monotonic: Vec<i64> = Vec::new();

    for (i, &eid) in external_ids.iter().enumerate() {
        if !seen.insert(eid) && !duplicates.contains(&eid) {
            duplicates.push(eid);
        }
        if i > 0 && eid <= external_ids[i - 1] {
            non_monotonic.push(eid);
        }
    }

    let mut holes: Vec<i64> = Vec::new();
    if let (Some(&min), Some(&max)) = (seen.first(), seen.last()) {
        for expected in min..=max {
            if !seen.contains(&expected) {
                holes.push(expected);
            }
        }
    }

    (duplicates, holes, non_monotonic)
}

/// Write one document and its units in a single transaction. Readers
/// observe either the empty state or the fully ingested state; any
/// constraint violation rolls the whole graph back.
pub async fn write_unit_graph(
    pool: &SqlitePool,
    doc: &NewDocument,
    units: &[NewUnit],
) -> Result<i64> {
    let mut tx = pool.begin().await?;

    let doc_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO documents
            (title, language, doc_role, resource_type, meta_json, source_path, source_hash, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING doc_id
        "#,
    )
    .bind(&doc.title)
    .bind(&doc.language)
    .bind(&doc.doc_role)
    .bind(&doc.resource_type)
    .bind(&doc.meta_json)
    .bind(&doc.source_path)
    .bind(&doc.source_hash)
    .bind(utcnow_iso())
    .fetch_one(&mut *tx)
    .await?;

    for unit in units {
        sqlx::query(
            r#"
            INSERT INTO units (doc_id, unit_type, n, external_id, text_raw, text_norm, meta_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(doc_id)
        .bind(unit.kind.as_str())
        .bind(unit.n)
        .bind(unit.external_id)
        .bind(&unit.text_raw)
        .bind(&unit.text_norm)
        .bind(&unit.meta_json)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(doc_id)
}

/// Dispatch an import by mode. The file must exist; a missing path is a
/// validation error, not an internal one.
pub async fn run_import(
    pool: &SqlitePool,
    mode: ImportMode,
    path: &Path,
    options: &ImportOptions,
) -> std::result::Result<ImportReport, EngineError> {
    if !path.exists() {
        return Err(EngineError::validation(format!(
            "Source file not found: {}",
            path.display()
        )));
    }

    let report = match mode {
        ImportMode::TxtNumberedLines => txt::import_txt_numbered_lines(pool, path, options).await,
        ImportMode::DocxNumberedLines => docx::import_docx_numbered_lines(pool, path, options).await,
        ImportMode::DocxParagraphs => docx::import_docx_paragraphs(pool, path, options).await,
        ImportMode::Tei => tei::import_tei(pool, path, options).await,
    }?;

    tracing::info!(
        doc_id = report.doc_id,
        mode = mode.as_str(),
        units_total = report.units_total,
        units_line = report.units_line,
        "import complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_pattern_matches() {
        let caps = NUMBERED_RE.captures("[42] Bonjour le monde.").unwrap();
        assert_eq!(&caps[1], "42");
        assert_eq!(&caps[2], "Bonjour le monde.");

        let caps = NUMBERED_RE.captures("[ 7 ]  spaced").unwrap();
        assert_eq!(&caps[1], "7");
        assert_eq!(&caps[2], "spaced");

        assert!(NUMBERED_RE.captures("plain heading").is_none());
        assert!(NUMBERED_RE.captures("[abc] not a number").is_none());
    }

    #[test]
    fn anchor_analysis_finds_duplicates_holes_non_monotonic() {
        let (dups, holes, nonmono) = analyze_external_ids(&[1, 2, 2, 5, 4]);
        assert_eq!(dups, vec![2]);
        assert_eq!(holes, vec![3]);
        assert_eq!(nonmono, vec![2, 4]);
    }

    #[test]
    fn anchor_analysis_clean_sequence() {
        let (dups, holes, nonmono) = analyze_external_ids(&[1, 2, 3]);
        assert!(dups.is_empty());
        assert!(holes.is_empty());
        assert!(nonmono.is_empty());
    }

    #[test]
    fn line_unit_records_separator_count() {
        let unit = NewUnit::line(1, Some(3), "a¤b¤c");
        assert_eq!(unit.text_norm, "a b c");
        assert_eq!(unit.meta_json.as_deref(), Some("{\"sep_count\":2}"));

        let plain = NewUnit::line(2, None, "no separators");
        assert!(plain.meta_json.is_none());
    }
}
