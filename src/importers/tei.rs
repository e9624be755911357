//! TEI (lightly-structured XML) importer.
//!
//! Extracts `<p>` (default) or `<s>` elements as `line` units. Namespaces
//! are matched by local name, so any prefix (or none) works. Language is
//! resolved from `xml:lang` on the `<text>` element, then the root; the
//! title comes from the first non-empty `<title>` in the header; both fall
//! back to caller-supplied values and finally the file stem. An `xml:id`
//! ending in digits contributes those digits as the unit's `external_id`;
//! otherwise the sequential position is used.

use std::path::Path;

use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use sqlx::SqlitePool;

use crate::error::EngineError;
use crate::textnorm::sha256_hex;

use super::{ImportOptions, ImportReport, NewDocument, NewUnit};

static TRAILING_DIGITS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)$").expect("trailing digits pattern"));

/// `"s1"` → 1, `"p42"` → 42, `"seg_001"` → 1, `"abc"` → `None`.
fn xmlid_to_int(xmlid: &str) -> Option<i64> {
    TRAILING_DIGITS_RE
        .captures(xmlid)
        .and_then(|caps| caps[1].parse().ok())
}

fn local_name(qname: &[u8]) -> &[u8] {
    match qname.iter().rposition(|&b| b == b':') {
        Some(pos) => &qname[pos + 1..],
        None => qname,
    }
}

/// Read an attribute by local name, preferring the `xml:` prefixed form.
fn attr_local(start: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    let mut plain: Option<String> = None;
    for attr in start.attributes().flatten() {
        let key = attr.key.as_ref();
        if local_name(key) == local {
            let value = String::from_utf8_lossy(&attr.value).into_owned();
            if key.starts_with(b"xml:") {
                return Some(value);
            }
            plain.get_or_insert(value);
        }
    }
    plain
}

#[derive(Debug)]
struct ParsedTei {
    title: Option<String>,
    language: Option<String>,
    /// (text, xml:id, had `<text>`/`<body>` ancestor)
    elements: Vec<(String, Option<String>, bool)>,
}

fn parse_tei(xml: &str, unit_element: &str) -> Result<ParsedTei, EngineError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);

    let unit_local = unit_element.as_bytes();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut title: Option<String> = None;
    let mut language: Option<String> = None;
    let mut root_lang: Option<String> = None;
    let mut seen_root = false;

    let mut elements: Vec<(String, Option<String>, bool)> = Vec::new();
    let mut unit_depth: usize = 0;
    let mut unit_text = String::new();
    let mut unit_id: Option<String> = None;
    let mut unit_in_text = false;
    let mut in_title = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = local_name(e.name().as_ref()).to_vec();

                if !seen_root {
                    seen_root = true;
                    root_lang = attr_local(&e, b"lang");
                }
                if local == b"text" && language.is_none() {
                    language = attr_local(&e, b"lang");
                }
                if local == b"title" && title.is_none() {
                    in_title = true;
                }

                if unit_depth > 0 {
                    unit_depth += 1;
                } else if local == unit_local {
                    unit_depth = 1;
                    unit_text.clear();
                    unit_id = attr_local(&e, b"id");
                    unit_in_text = stack
                        .iter()
                        .any(|tag| tag.as_slice() == b"text" || tag.as_slice() == b"body");
                }

                stack.push(local);
            }
            Ok(Event::End(_)) => {
                stack.pop();
                in_title = false;
                if unit_depth > 0 {
                    unit_depth -= 1;
                    if unit_depth == 0 {
                        elements.push((unit_text.clone(), unit_id.take(), unit_in_text));
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                let name = e.name();
                let local = local_name(name.as_ref());
                if !seen_root {
                    seen_root = true;
                    root_lang = attr_local(&e, b"lang");
                }
                if unit_depth == 0 && local == unit_local {
                    let in_text = stack
                        .iter()
                        .any(|tag| tag.as_slice() == b"text" || tag.as_slice() == b"body");
                    elements.push((String::new(), attr_local(&e, b"id"), in_text));
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| EngineError::validation(format!("Invalid TEI XML text: {}", e)))?;
                if unit_depth > 0 {
                    unit_text.push_str(&text);
                }
                if in_title && title.is_none() {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        title = Some(trimmed.to_string());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(EngineError::validation(format!(
                    "TEI file is not valid XML: {}",
                    e
                )))
            }
            _ => {}
        }
    }

    // Prefer elements inside <text>/<body>; accept any when the document
    // has no text envelope at all.
    let any_in_text = elements.iter().any(|(_, _, in_text)| *in_text);
    if any_in_text {
        elements.retain(|(_, _, in_text)| *in_text);
    }

    Ok(ParsedTei {
        title,
        language: language.or(root_lang),
        elements,
    })
}

pub async fn import_tei(
    pool: &SqlitePool,
    path: &Path,
    options: &ImportOptions,
) -> Result<ImportReport, EngineError> {
    let unit_element = options.tei_unit.as_deref().unwrap_or("p");
    if unit_element != "p" && unit_element != "s" {
        return Err(EngineError::validation(format!(
            "tei_unit must be 'p' or 's', got '{}'",
            unit_element
        )));
    }

    let raw_bytes = std::fs::read(path)?;
    let source_hash = sha256_hex(&raw_bytes);
    let xml = String::from_utf8_lossy(&raw_bytes).into_owned();

    let parsed = parse_tei(&xml, unit_element)?;

    let mut units: Vec<NewUnit> = Vec::new();
    let mut external_ids: Vec<i64> = Vec::new();
    let mut n: i64 = 0;

    for (text, xmlid, _) in &parsed.elements {
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        n += 1;
        let ext_id = xmlid
            .as_deref()
            .and_then(xmlid_to_int)
            .unwrap_or(n);
        external_ids.push(ext_id);
        units.push(NewUnit::line(n, Some(ext_id), text));
    }

    let title = options
        .title
        .clone()
        .or(parsed.title)
        .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "untitled".to_string());
    let language = options.language.clone().or(parsed.language);

    let doc = NewDocument {
        title,
        language,
        doc_role: options.doc_role.clone(),
        resource_type: options.resource_type.clone(),
        meta_json: Some(serde_json::json!({"tei_unit": unit_element}).to_string()),
        source_path: path.display().to_string(),
        source_hash,
    };

    let doc_id = super::write_unit_graph(pool, &doc, &units)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;

    let mut report = ImportReport {
        doc_id,
        units_total: units.len(),
        units_line: units.len(),
        units_structure: 0,
        ..Default::default()
    };
    report.analyze_anchors(&external_ids);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
        <TEI xmlns="http://www.tei-c.org/ns/1.0" xml:lang="la">
          <teiHeader><fileDesc><titleStmt><title>De Bello</title></titleStmt></fileDesc></teiHeader>
          <text xml:lang="fr">
            <body>
              <p xml:id="p1">Premier paragraphe.</p>
              <p xml:id="p2">Deuxi&#232;me <hi>mis en valeur</hi> paragraphe.</p>
              <p></p>
            </body>
          </text>
        </TEI>"#;

    #[test]
    fn parses_namespaced_tei() {
        let parsed = parse_tei(SAMPLE, "p").unwrap();
        assert_eq!(parsed.title.as_deref(), Some("De Bello"));
        assert_eq!(parsed.language.as_deref(), Some("fr"));
        let texts: Vec<&str> = parsed.elements.iter().map(|(t, _, _)| t.trim()).collect();
        assert_eq!(texts[0], "Premier paragraphe.");
        assert!(texts[1].contains("mis en valeur"));
    }

    #[test]
    fn prefixed_namespace_handled() {
        let xml = r#"<tei:TEI xmlns:tei="http://www.tei-c.org/ns/1.0">
            <tei:text><tei:body><tei:s xml:id="s7">Une phrase.</tei:s></tei:body></tei:text>
        </tei:TEI>"#;
        let parsed = parse_tei(xml, "s").unwrap();
        assert_eq!(parsed.elements.len(), 1);
        assert_eq!(parsed.elements[0].1.as_deref(), Some("s7"));
    }

    #[test]
    fn xmlid_trailing_digits() {
        assert_eq!(xmlid_to_int("s1"), Some(1));
        assert_eq!(xmlid_to_int("p42"), Some(42));
        assert_eq!(xmlid_to_int("seg_001"), Some(1));
        assert_eq!(xmlid_to_int("abc"), None);
    }

    #[test]
    fn header_paragraphs_excluded() {
        let xml = r#"<TEI><teiHeader><p>header note</p></teiHeader>
            <text><body><p>body text</p></body></text></TEI>"#;
        let parsed = parse_tei(xml, "p").unwrap();
        assert_eq!(parsed.elements.len(), 1);
        assert_eq!(parsed.elements[0].0.trim(), "body text");
    }
}
