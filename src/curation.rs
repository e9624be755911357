//! Curation engine — ordered regex substitution over stored `text_norm`.
//!
//! Lets corpus managers correct OCR errors, normalize spelling variants, or
//! expand abbreviations without re-importing the source file. Rules apply
//! in order; `text_raw` is never touched. Apply runs in one transaction per
//! scope (one document or all documents) and flags the FTS index stale;
//! preview simulates the same pass without writing.
//!
//! Rule flags are a small documented set: `i` (case-insensitive),
//! `m` (multi-line), `s` (dot matches newline). Invalid patterns fail
//! eagerly with a validation error.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::error::EngineError;
use crate::indexer;

/// A single substitution rule as received on the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurationRule {
    pub pattern: String,
    pub replacement: String,
    /// Subset of `i`, `m`, `s`.
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub description: String,
}

/// A rule compiled and ready to apply.
#[derive(Debug)]
pub struct CompiledRule {
    pub regex: Regex,
    pub replacement: String,
    pub description: String,
}

/// Compile the rule list, validating every pattern and flag eagerly.
pub fn compile_rules(rules: &[CurationRule]) -> Result<Vec<CompiledRule>, EngineError> {
    let mut compiled = Vec::with_capacity(rules.len());
    for rule in rules {
        let mut builder = RegexBuilder::new(&rule.pattern);
        for flag in rule.flags.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                other => {
                    return Err(EngineError::validation(format!(
                        "Unknown rule flag '{}' (allowed: i, m, s)",
                        other
                    )))
                }
            }
        }
        let regex = builder.build().map_err(|e| {
            EngineError::validation(format!("Invalid regex pattern '{}': {}", rule.pattern, e))
        })?;
        compiled.push(CompiledRule {
            regex,
            replacement: rule.replacement.clone(),
            description: if rule.description.is_empty() {
                rule.pattern.clone()
            } else {
                rule.description.clone()
            },
        });
    }
    Ok(compiled)
}

/// Apply all rules sequentially; returns the new text and the number of
/// replacements made.
pub fn apply_rules(text: &str, rules: &[CompiledRule]) -> (String, usize) {
    let mut current = text.to_string();
    let mut replacements = 0usize;
    for rule in rules {
        replacements += rule.regex.find_iter(&current).count();
        current = rule
            .regex
            .replace_all(&current, rule.replacement.as_str())
            .into_owned();
    }
    (current, replacements)
}

/// Result of curating one document.
#[derive(Debug, Clone, Serialize)]
pub struct CurationReport {
    pub doc_id: i64,
    pub units_total: usize,
    pub units_modified: usize,
    pub replacements_total: usize,
    /// Descriptions of rules that fired at least once.
    pub rules_matched: Vec<String>,
    pub warnings: Vec<String>,
}

/// A before/after sample from a preview.
#[derive(Debug, Clone, Serialize)]
pub struct CurationExample {
    pub unit_id: i64,
    pub external_id: Option<i64>,
    pub before: String,
    pub after: String,
}

/// Result of a read-only preview.
#[derive(Debug, Clone, Serialize)]
pub struct CurationPreview {
    pub doc_id: i64,
    pub units_total: usize,
    pub units_changed: usize,
    pub replacements_total: usize,
    pub examples: Vec<CurationExample>,
    /// Always `false`: preview never mutates the database.
    pub fts_stale: bool,
}

async fn load_line_units(
    pool: &SqlitePool,
    doc_id: i64,
) -> Result<Vec<(i64, Option<i64>, String)>, EngineError> {
    let rows = sqlx::query(
        "SELECT unit_id, external_id, text_norm FROM units WHERE doc_id = ? AND unit_type = 'line' ORDER BY n",
    )
    .bind(doc_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get("unit_id"), row.get("external_id"), row.get("text_norm")))
        .collect())
}

/// Simulate the rule pass over one document without writing.
pub async fn preview_document(
    pool: &SqlitePool,
    doc_id: i64,
    rules: &[CurationRule],
    limit_examples: usize,
) -> Result<CurationPreview, EngineError> {
    let compiled = compile_rules(rules)?;
    let units = load_line_units(pool, doc_id).await?;

    let mut preview = CurationPreview {
        doc_id,
        units_total: units.len(),
        units_changed: 0,
        replacements_total: 0,
        examples: Vec::new(),
        fts_stale: false,
    };
    if compiled.is_empty() {
        return Ok(preview);
    }

    for (unit_id, external_id, original) in &units {
        let (curated, replacements) = apply_rules(original, &compiled);
        if &curated != original {
            preview.units_changed += 1;
            preview.replacements_total += replacements;
            if preview.examples.len() < limit_examples {
                preview.examples.push(CurationExample {
                    unit_id: *unit_id,
                    external_id: *external_id,
                    before: original.clone(),
                    after: curated,
                });
            }
        }
    }
    Ok(preview)
}

/// Apply rules to the line units of one document inside the supplied
/// transaction. Only modified units are written.
async fn curate_document_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    doc_id: i64,
    rules: &[CompiledRule],
) -> Result<CurationReport, EngineError> {
    let rows = sqlx::query(
        "SELECT unit_id, text_norm FROM units WHERE doc_id = ? AND unit_type = 'line' ORDER BY n",
    )
    .bind(doc_id)
    .fetch_all(&mut **tx)
    .await?;

    let mut report = CurationReport {
        doc_id,
        units_total: rows.len(),
        units_modified: 0,
        replacements_total: 0,
        rules_matched: Vec::new(),
        warnings: Vec::new(),
    };
    if rows.is_empty() {
        report
            .warnings
            .push(format!("No line units found for doc_id={}", doc_id));
        return Ok(report);
    }

    let mut fired: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    for row in &rows {
        let unit_id: i64 = row.get("unit_id");
        let original: String = row.get("text_norm");
        let (curated, replacements) = apply_rules(&original, rules);
        if curated != original {
            for rule in rules {
                if rule.regex.is_match(&original) {
                    fired.insert(rule.description.clone());
                }
            }
            sqlx::query("UPDATE units SET text_norm = ? WHERE unit_id = ?")
                .bind(&curated)
                .bind(unit_id)
                .execute(&mut **tx)
                .await?;
            report.units_modified += 1;
            report.replacements_total += replacements;
        }
    }
    report.rules_matched = fired.into_iter().collect();
    Ok(report)
}

/// Apply rules to one document, or to every document when `doc_id` is
/// `None`. The whole scope commits as one transaction; the stale flag is
/// raised only when something changed.
pub async fn curate(
    pool: &SqlitePool,
    doc_id: Option<i64>,
    rules: &[CurationRule],
) -> Result<Vec<CurationReport>, EngineError> {
    let compiled = compile_rules(rules)?;

    let doc_ids: Vec<i64> = match doc_id {
        Some(id) => vec![id],
        None => sqlx::query_scalar("SELECT doc_id FROM documents ORDER BY doc_id")
            .fetch_all(pool)
            .await?,
    };

    let mut tx = pool.begin().await?;
    let mut reports = Vec::with_capacity(doc_ids.len());
    for id in doc_ids {
        reports.push(curate_document_tx(&mut tx, id, &compiled).await?);
    }
    tx.commit().await?;

    let total_modified: usize = reports.iter().map(|r| r.units_modified).sum();
    if total_modified > 0 {
        indexer::mark_stale(pool)
            .await
            .map_err(|e| EngineError::internal(e.to_string()))?;
    }
    tracing::info!(
        docs = reports.len(),
        units_modified = total_modified,
        "curation applied"
    );
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, replacement: &str, flags: &str) -> CurationRule {
        CurationRule {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            flags: flags.to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn invalid_pattern_fails_eagerly() {
        let err = compile_rules(&[rule("(unclosed", "x", "")]).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn unknown_flag_rejected() {
        let err = compile_rules(&[rule("a", "b", "x")]).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn rules_apply_in_order() {
        let compiled = compile_rules(&[rule("a", "b", ""), rule("b", "c", "")]).unwrap();
        let (out, replacements) = apply_rules("a", &compiled);
        // First rule makes "b", second rule then sees it
        assert_eq!(out, "c");
        assert_eq!(replacements, 2);
    }

    #[test]
    fn case_insensitive_flag() {
        let compiled = compile_rules(&[rule("chat", "CAT", "i")]).unwrap();
        let (out, _) = apply_rules("Chat chat CHAT", &compiled);
        assert_eq!(out, "CAT CAT CAT");
    }

    #[test]
    fn nbsp_to_space_counts_one_replacement() {
        let compiled = compile_rules(&[rule("\u{00A0}", " ", "")]).unwrap();
        let (out, replacements) = apply_rules("a\u{00A0}b", &compiled);
        assert_eq!(out, "a b");
        assert_eq!(replacements, 1);
    }

    #[test]
    fn empty_rule_set_is_noop() {
        let compiled = compile_rules(&[]).unwrap();
        let (out, replacements) = apply_rules("unchanged", &compiled);
        assert_eq!(out, "unchanged");
        assert_eq!(replacements, 0);
    }
}
