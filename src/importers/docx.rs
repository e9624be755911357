//! DOCX importers.
//!
//! A DOCX file is a ZIP archive whose main content lives in
//! `word/document.xml`; paragraphs are `<w:p>` elements and their text runs
//! are `<w:t>` elements. Two conventions are supported:
//!
//! - **Numbered lines**: paragraphs matching `[n] text` become `line`
//!   units anchored by `n`; other non-empty paragraphs become `structure`
//!   units.
//! - **Paragraphs**: every non-empty paragraph becomes a `line` unit with
//!   `external_id = n` (monotone, gap-free), enabling position-based
//!   alignment when no numeric anchors exist.

use std::io::{BufReader, Read};
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use sqlx::SqlitePool;

use crate::error::EngineError;
use crate::textnorm::sha256_hex;

use super::{ImportOptions, ImportReport, NewDocument, NewUnit, NUMBERED_RE};

/// Extract the plain-text paragraphs of `word/document.xml`.
pub fn extract_paragraphs(path: &Path) -> Result<Vec<String>, EngineError> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|e| EngineError::validation(format!("Not a DOCX (zip) file: {}", e)))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| EngineError::validation(format!("Cannot find word/document.xml: {}", e)))?
        .read_to_string(&mut xml)?;

    parse_document_xml(&xml)
}

fn parse_document_xml(xml: &str) -> Result<Vec<String>, EngineError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_paragraph = false;
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"w:p" => {
                    in_paragraph = true;
                    current.clear();
                }
                b"w:t" => in_text = true,
                // Explicit breaks and tabs inside a run
                b"w:tab" => current.push('\t'),
                b"w:br" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"w:tab" => current.push('\t'),
                b"w:br" => current.push('\n'),
                _ => {}
            },
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:p" => {
                    if in_paragraph {
                        paragraphs.push(std::mem::take(&mut current));
                    }
                    in_paragraph = false;
                }
                b"w:t" => in_text = false,
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if in_text {
                    let text = t
                        .unescape()
                        .map_err(|e| EngineError::validation(format!("Invalid DOCX XML text: {}", e)))?;
                    current.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(EngineError::validation(format!(
                    "DOCX document.xml is not valid XML: {}",
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(paragraphs)
}

/// Import a DOCX file using the numbered-lines convention.
pub async fn import_docx_numbered_lines(
    pool: &SqlitePool,
    path: &Path,
    options: &ImportOptions,
) -> Result<ImportReport, EngineError> {
    let raw_bytes = std::fs::read(path)?;
    let source_hash = sha256_hex(&raw_bytes);
    let paragraphs = extract_paragraphs(path)?;

    let mut units: Vec<NewUnit> = Vec::new();
    let mut external_ids: Vec<i64> = Vec::new();
    let mut n: i64 = 0;

    for raw_para in &paragraphs {
        let para = raw_para.trim();
        if para.is_empty() {
            continue;
        }

        n += 1;
        if let Some(caps) = NUMBERED_RE.captures(para) {
            let ext_id: i64 = caps[1].parse().map_err(|_| {
                EngineError::validation(format!("external_id out of range in paragraph n={}", n))
            })?;
            external_ids.push(ext_id);
            units.push(NewUnit::line(n, Some(ext_id), &caps[2]));
        } else {
            units.push(NewUnit::structure(n, para));
        }
    }

    let doc = new_document(path, options, &source_hash, "docx_numbered_lines");
    let doc_id = super::write_unit_graph(pool, &doc, &units)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;

    let mut report = ImportReport {
        doc_id,
        units_total: units.len(),
        units_line: external_ids.len(),
        units_structure: units.len() - external_ids.len(),
        ..Default::default()
    };
    report.analyze_anchors(&external_ids);
    Ok(report)
}

/// Import a DOCX file taking every non-empty paragraph as a `line` unit
/// with `external_id = n`.
pub async fn import_docx_paragraphs(
    pool: &SqlitePool,
    path: &Path,
    options: &ImportOptions,
) -> Result<ImportReport, EngineError> {
    let raw_bytes = std::fs::read(path)?;
    let source_hash = sha256_hex(&raw_bytes);
    let paragraphs = extract_paragraphs(path)?;

    let mut units: Vec<NewUnit> = Vec::new();
    let mut n: i64 = 0;

    for raw_para in &paragraphs {
        let para = raw_para.trim();
        if para.is_empty() {
            continue;
        }
        n += 1;
        units.push(NewUnit::line(n, Some(n), para));
    }

    let doc = new_document(path, options, &source_hash, "docx_paragraphs");
    let doc_id = super::write_unit_graph(pool, &doc, &units)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;

    Ok(ImportReport {
        doc_id,
        units_total: units.len(),
        units_line: units.len(),
        units_structure: 0,
        ..Default::default()
    })
}

fn new_document(
    path: &Path,
    options: &ImportOptions,
    source_hash: &str,
    mode: &str,
) -> NewDocument {
    let title = options
        .title
        .clone()
        .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "untitled".to_string());

    NewDocument {
        title,
        language: options.language.clone(),
        doc_role: options.doc_role.clone(),
        resource_type: options.resource_type.clone(),
        meta_json: Some(serde_json::json!({"import_mode": mode}).to_string()),
        source_path: path.display().to_string(),
        source_hash: source_hash.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wordml_paragraphs() {
        let xml = r#"<?xml version="1.0"?>
            <w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
              <w:body>
                <w:p><w:r><w:t>[1] Premier</w:t></w:r><w:r><w:t> segment</w:t></w:r></w:p>
                <w:p><w:r><w:t>Chapitre</w:t></w:r></w:p>
                <w:p></w:p>
              </w:body>
            </w:document>"#;
        let paragraphs = parse_document_xml(xml).unwrap();
        assert_eq!(paragraphs.len(), 3);
        assert_eq!(paragraphs[0], "[1] Premier segment");
        assert_eq!(paragraphs[1], "Chapitre");
        assert_eq!(paragraphs[2], "");
    }

    #[test]
    fn text_outside_runs_ignored() {
        let xml = r#"<w:document xmlns:w="x"><w:body>
            <w:p><w:pPr>meta</w:pPr><w:r><w:t>kept</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let paragraphs = parse_document_xml(xml).unwrap();
        assert_eq!(paragraphs, vec!["kept".to_string()]);
    }
}
