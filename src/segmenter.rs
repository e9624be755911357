//! Sentence segmenter — rebuilds a document at sentence granularity.
//!
//! Splits each stored line unit into sentence-level units with regex rules,
//! protecting known abbreviations and decimal numbers from false boundary
//! detection. The document's unit sequence is rebuilt in order: structure
//! units keep their place, each line unit expands into its sentences, and
//! `n` stays contiguous from 1. Alignment links touching the document are
//! deleted (stale after renumbering) and the FTS index is flagged stale.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::error::EngineError;
use crate::indexer;

/// Tokens whose terminal period must not be treated as a sentence end.
static ABBREV_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\b(?:M|Mme|Mmes|Dr|Prof|St|Sgt|Cdt|Lt|Cpt|Mlle|Mlles|No|Nos|Mr|Mrs|Ms)\.",
        r"|\b(?:Jan|Feb|Mar|Apr|Jun|Jul|Aug|Sep|Sept|Oct|Nov|Dec)\.",
        r"|\b(?:p|pp|vol|ed|eds|fig|tab|art|sect|cf|vs|ibid|loc|op|cit)\.",
        r"|\d+\.\d+",
    ))
    .expect("abbreviation pattern")
});

/// Candidate boundary: end punctuation followed by whitespace. The split is
/// confirmed only when the next character is an uppercase letter, an
/// opening quote, or a parenthesis.
static BOUNDARY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]\s+").expect("boundary pattern"));

fn starts_sentence(ch: char) -> bool {
    ch.is_uppercase() || matches!(ch, '"' | '(' | '\u{2018}' | '\u{2019}' | '\u{201C}' | '\u{201D}')
}

/// Split text into sentence strings.
///
/// 1. Replace known abbreviations with NUL-framed placeholders so their
///    terminal periods are invisible to the boundary regex.
/// 2. Split after end punctuation followed by whitespace and a sentence
///    opener (uppercase letter, quote, parenthesis).
/// 3. Restore placeholders.
///
/// Returns a non-empty list of trimmed sentences; text with no boundary
/// comes back as a single element. The `lang` tag is reserved for
/// language-specific rules.
pub fn segment_text(text: &str, _lang: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return if text.is_empty() { Vec::new() } else { vec![text.to_string()] };
    }

    // Step 1: protect abbreviations
    let mut placeholders: Vec<String> = Vec::new();
    let protected = ABBREV_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let placeholder = format!("\u{0}A{}\u{0}", placeholders.len());
            placeholders.push(caps[0].to_string());
            placeholder
        })
        .into_owned();

    // Step 2: split on confirmed boundaries
    let mut fragments: Vec<&str> = Vec::new();
    let mut start = 0usize;
    for boundary in BOUNDARY_RE.find_iter(&protected) {
        let next_starts_sentence = protected[boundary.end()..]
            .chars()
            .next()
            .map(starts_sentence)
            .unwrap_or(false);
        if next_starts_sentence {
            // Keep the punctuation with the left fragment, drop the gap
            let punct_end = boundary.start()
                + protected[boundary.start()..boundary.end()]
                    .find(char::is_whitespace)
                    .unwrap_or(boundary.end() - boundary.start());
            fragments.push(&protected[start..punct_end]);
            start = boundary.end();
        }
    }
    fragments.push(&protected[start..]);

    // Step 3: restore abbreviations
    let mut sentences: Vec<String> = Vec::new();
    for fragment in fragments {
        let mut restored = fragment.to_string();
        for (i, original) in placeholders.iter().enumerate() {
            restored = restored.replace(&format!("\u{0}A{}\u{0}", i), original);
        }
        let trimmed = restored.trim();
        if !trimmed.is_empty() {
            sentences.push(trimmed.to_string());
        }
    }

    if sentences.is_empty() {
        vec![text.trim().to_string()]
    } else {
        sentences
    }
}

/// Result of resegmenting one document.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentationReport {
    pub doc_id: i64,
    /// Line units before segmentation.
    pub units_input: usize,
    /// Sentence-level line units after segmentation.
    pub units_output: usize,
    pub warnings: Vec<String>,
}

/// Replace the line units of `doc_id` with sentence-segmented units.
///
/// The whole rebuild (link deletion, unit replacement, renumbering) commits
/// as one transaction. The FTS index is NOT rebuilt here; the caller is
/// responsible for a subsequent rebuild.
pub async fn resegment_document(
    pool: &SqlitePool,
    doc_id: i64,
    lang: &str,
) -> Result<SegmentationReport, EngineError> {
    let rows = sqlx::query(
        "SELECT unit_id, n, unit_type, text_raw, text_norm FROM units WHERE doc_id = ? ORDER BY n",
    )
    .bind(doc_id)
    .fetch_all(pool)
    .await?;

    let line_input = rows
        .iter()
        .filter(|row| row.get::<String, _>("unit_type") == "line")
        .count();
    if line_input == 0 {
        return Ok(SegmentationReport {
            doc_id,
            units_input: 0,
            units_output: 0,
            warnings: vec![format!("No line units found for doc_id={}", doc_id)],
        });
    }

    // Rebuild the unit sequence in order: structure units keep their place,
    // line units expand into sentences.
    struct Rebuilt {
        unit_type: &'static str,
        text_raw: String,
        text_norm: String,
    }
    let mut rebuilt: Vec<Rebuilt> = Vec::new();
    let mut units_output = 0usize;
    for row in &rows {
        let unit_type: String = row.get("unit_type");
        if unit_type == "structure" {
            rebuilt.push(Rebuilt {
                unit_type: "structure",
                text_raw: row.get("text_raw"),
                text_norm: row.get("text_norm"),
            });
        } else {
            let text_norm: String = row.get("text_norm");
            for sentence in segment_text(&text_norm, lang) {
                rebuilt.push(Rebuilt {
                    unit_type: "line",
                    text_raw: sentence.clone(),
                    text_norm: sentence,
                });
                units_output += 1;
            }
        }
    }

    let mut tx = pool.begin().await?;

    let deleted_links = sqlx::query(
        "DELETE FROM alignment_links WHERE pivot_doc_id = ? OR target_doc_id = ?",
    )
    .bind(doc_id)
    .bind(doc_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    sqlx::query("DELETE FROM units WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;

    for (i, unit) in rebuilt.iter().enumerate() {
        sqlx::query(
            "INSERT INTO units (doc_id, unit_type, n, external_id, text_raw, text_norm, meta_json)
             VALUES (?, ?, ?, NULL, ?, ?, NULL)",
        )
        .bind(doc_id)
        .bind(unit.unit_type)
        .bind((i + 1) as i64)
        .bind(&unit.text_raw)
        .bind(&unit.text_norm)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    indexer::mark_stale(pool)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;

    let mut warnings = Vec::new();
    if deleted_links > 0 {
        warnings.push(format!(
            "Deleted {} alignment_link(s) for doc_id={} (stale after resegmentation)",
            deleted_links, doc_id
        ));
    }
    tracing::info!(
        doc_id,
        units_input = line_input,
        units_output,
        deleted_links,
        "document resegmented"
    );

    Ok(SegmentationReport {
        doc_id,
        units_input: line_input,
        units_output,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_sentence_boundaries() {
        let sentences = segment_text("Premier point. Deuxième point. Et un troisième!", "fr");
        assert_eq!(
            sentences,
            vec![
                "Premier point.".to_string(),
                "Deuxième point.".to_string(),
                "Et un troisième!".to_string(),
            ]
        );
    }

    #[test]
    fn protects_abbreviations() {
        let sentences = segment_text("M. Dupont est venu. Il repart.", "fr");
        assert_eq!(
            sentences,
            vec!["M. Dupont est venu.".to_string(), "Il repart.".to_string()]
        );
    }

    #[test]
    fn protects_decimal_numbers() {
        let sentences = segment_text("La valeur est 3.14 environ. Fin.", "fr");
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].contains("3.14"));
    }

    #[test]
    fn no_boundary_yields_single_sentence() {
        let sentences = segment_text("une seule phrase sans fin", "fr");
        assert_eq!(sentences, vec!["une seule phrase sans fin".to_string()]);
    }

    #[test]
    fn lowercase_continuation_not_split() {
        let sentences = segment_text("env. dix pages. et la suite", "fr");
        // "et" is lowercase: no split after "pages."
        assert_eq!(sentences.len(), 1);
    }

    #[test]
    fn empty_text() {
        assert!(segment_text("", "fr").is_empty());
    }
}
