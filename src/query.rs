//! Query engine — segment and KWIC modes.
//!
//! Searches the FTS5 index and projects hits into one of two shapes:
//!
//! - **Segment**: the full unit text with every match wrapped in the inline
//!   markers `<<` and `>>`.
//! - **KWIC**: `left` / `match` / `right` windows of `window` tokens around
//!   a match; with `all_occurrences` one hit is emitted per match
//!   occurrence instead of one per unit.
//!
//! Pagination uses `limit + 1` lookahead to compute `has_more` without a
//! global count; `total` stays `null`. Hit ordering is `(doc_id, n)`, which
//! is stable for a given corpus snapshot. A stale index is served as-is;
//! the `fts_stale` flag on the page lets collaborators warn users.
//!
//! When `include_aligned` is set, each hit carries up to `aligned_limit`
//! sibling units reached through alignment links in either direction; when
//! the hit's document participates in `doc_relations`, siblings are
//! restricted to the related documents.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::error::EngineError;
use crate::indexer;

/// Inline highlight markers for segment mode. ASCII, unambiguous, easy to
/// re-escape on the rendering boundary.
pub const HIGHLIGHT_OPEN: &str = "<<";
pub const HIGHLIGHT_CLOSE: &str = ">>";

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\S+").expect("token pattern"));

/// Projection shape of a query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    Segment,
    Kwic,
}

fn default_mode() -> QueryMode {
    QueryMode::Segment
}
fn default_window() -> i64 {
    10
}
fn default_aligned_limit() -> Option<i64> {
    Some(20)
}
fn default_limit() -> i64 {
    50
}

/// Query request parameters; everything except `q` is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryParams {
    #[serde(default)]
    pub q: String,
    #[serde(default = "default_mode")]
    pub mode: QueryMode,
    /// KWIC context width in tokens (3..=25).
    #[serde(default = "default_window")]
    pub window: i64,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub doc_id: Option<i64>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub doc_role: Option<String>,
    #[serde(default)]
    pub include_aligned: bool,
    /// Per-hit cap on attached aligned units; `null` removes the cap.
    #[serde(default = "default_aligned_limit")]
    pub aligned_limit: Option<i64>,
    /// KWIC only: one hit per match occurrence instead of one per unit.
    #[serde(default)]
    pub all_occurrences: bool,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

impl Default for QueryParams {
    fn default() -> Self {
        QueryParams {
            q: String::new(),
            mode: default_mode(),
            window: default_window(),
            language: None,
            doc_id: None,
            resource_type: None,
            doc_role: None,
            include_aligned: false,
            aligned_limit: default_aligned_limit(),
            all_occurrences: false,
            limit: default_limit(),
            offset: 0,
        }
    }
}

impl QueryParams {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(1..=200).contains(&self.limit) {
            return Err(EngineError::validation("limit must be in [1, 200]"));
        }
        if self.offset < 0 {
            return Err(EngineError::validation("offset must be >= 0"));
        }
        if !(3..=25).contains(&self.window) {
            return Err(EngineError::validation("window must be in [3, 25]"));
        }
        if let Some(aligned_limit) = self.aligned_limit {
            if aligned_limit < 1 {
                return Err(EngineError::validation("aligned_limit must be >= 1 or null"));
            }
        }
        Ok(())
    }
}

/// A sibling unit attached to a hit through alignment links.
#[derive(Debug, Clone, Serialize)]
pub struct AlignedUnit {
    pub unit_id: i64,
    pub doc_id: i64,
    pub external_id: Option<i64>,
    pub language: Option<String>,
    pub title: Option<String>,
    pub text: String,
}

/// One query hit, in segment or KWIC shape.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Hit {
    Segment {
        doc_id: i64,
        unit_id: i64,
        external_id: Option<i64>,
        language: Option<String>,
        title: Option<String>,
        /// Unit text with matches wrapped in `<<` `>>`.
        text: String,
        text_norm: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        aligned: Option<Vec<AlignedUnit>>,
    },
    Kwic {
        doc_id: i64,
        unit_id: i64,
        external_id: Option<i64>,
        language: Option<String>,
        title: Option<String>,
        left: String,
        #[serde(rename = "match")]
        match_text: String,
        right: String,
        text_norm: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        aligned: Option<Vec<AlignedUnit>>,
    },
}

/// A paginated query result.
#[derive(Debug, Clone, Serialize)]
pub struct QueryPage {
    pub hits: Vec<Hit>,
    pub limit: i64,
    pub offset: i64,
    pub next_offset: Option<i64>,
    pub has_more: bool,
    /// Intentionally `null`: the engine skips a global count for cost.
    pub total: Option<i64>,
    pub fts_stale: bool,
}

/// Build an FTS5 `NEAR()` proximity query string: terms within `distance`
/// token positions of each other, in any order.
pub fn proximity_query(terms: &[&str], distance: u32) -> Result<String, EngineError> {
    if terms.len() < 2 {
        return Err(EngineError::validation(
            "proximity query requires at least 2 terms",
        ));
    }
    Ok(format!("NEAR({}, {})", terms.join(" "), distance))
}

/// Compile the query terms into one case-insensitive alternation pattern.
/// Terms are whitespace-separated; surrounding double quotes are stripped
/// so phrase queries highlight their words.
fn term_pattern(q: &str) -> Option<Regex> {
    let terms: Vec<String> = q
        .split_whitespace()
        .map(|t| t.trim_matches('"'))
        .filter(|t| !t.is_empty())
        .map(regex::escape)
        .collect();
    if terms.is_empty() {
        return None;
    }
    RegexBuilder::new(&terms.join("|"))
        .case_insensitive(true)
        .build()
        .ok()
}

/// Wrap occurrences of the query terms with `<<` `>>` markers.
fn highlight_segment(text: &str, q: &str) -> String {
    match term_pattern(q) {
        Some(pattern) => pattern
            .replace_all(text, |caps: &regex::Captures<'_>| {
                format!("{}{}{}", HIGHLIGHT_OPEN, &caps[0], HIGHLIGHT_CLOSE)
            })
            .into_owned(),
        None => text.to_string(),
    }
}

/// Extract left/match/right context around every match occurrence.
/// Tokenizes on whitespace; each window is bounded by `window` tokens.
fn all_kwic_windows(text: &str, q: &str, window: usize) -> Vec<(String, String, String)> {
    let pattern = match term_pattern(q) {
        Some(p) => p,
        None => return vec![(String::new(), text.to_string(), String::new())],
    };

    let tokens: Vec<(usize, usize, &str)> = TOKEN_RE
        .find_iter(text)
        .map(|m| (m.start(), m.end(), m.as_str()))
        .collect();

    let mut results = Vec::new();
    for m in pattern.find_iter(text) {
        let pivot = tokens
            .iter()
            .position(|&(start, end, _)| start <= m.start() && m.start() < end)
            .unwrap_or(0);

        let left = tokens[pivot.saturating_sub(window)..pivot]
            .iter()
            .map(|&(_, _, t)| t)
            .collect::<Vec<_>>()
            .join(" ");
        let right_end = (pivot + 1 + window).min(tokens.len());
        let right = tokens[(pivot + 1).min(tokens.len())..right_end]
            .iter()
            .map(|&(_, _, t)| t)
            .collect::<Vec<_>>()
            .join(" ");

        results.push((left, m.as_str().to_string(), right));
    }
    results
}

/// First-match-only variant of [`all_kwic_windows`]. A unit that matched in
/// FTS but not in the per-term pattern yields `(text, "", "")`.
fn kwic_windows(text: &str, q: &str, window: usize) -> (String, String, String) {
    let mut occurrences = all_kwic_windows(text, q, window);
    if occurrences.is_empty() {
        return (text.to_string(), String::new(), String::new());
    }
    occurrences.swap_remove(0)
}

struct HitRow {
    unit_id: i64,
    doc_id: i64,
    external_id: Option<i64>,
    text_norm: String,
    language: Option<String>,
    title: Option<String>,
}

/// Run an FTS query and return a paginated payload.
pub async fn run_query_page(
    pool: &SqlitePool,
    params: &QueryParams,
) -> Result<QueryPage, EngineError> {
    params.validate()?;
    let fts_stale = indexer::is_stale(pool)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;

    if params.q.trim().is_empty() {
        return Ok(QueryPage {
            hits: Vec::new(),
            limit: params.limit,
            offset: params.offset,
            next_offset: None,
            has_more: false,
            total: None,
            fts_stale,
        });
    }

    let mut sql = String::from(
        r#"
        SELECT u.unit_id, u.doc_id, u.external_id, u.text_norm, d.language, d.title
        FROM fts_units f
        JOIN units u ON u.unit_id = f.rowid
        JOIN documents d ON d.doc_id = u.doc_id
        WHERE fts_units MATCH ?
          AND u.unit_type = 'line'
        "#,
    );
    if params.language.is_some() {
        sql.push_str(" AND d.language = ?");
    }
    if params.doc_id.is_some() {
        sql.push_str(" AND u.doc_id = ?");
    }
    if params.resource_type.is_some() {
        sql.push_str(" AND d.resource_type = ?");
    }
    if params.doc_role.is_some() {
        sql.push_str(" AND d.doc_role = ?");
    }
    sql.push_str(" ORDER BY u.doc_id, u.n LIMIT ? OFFSET ?");

    let mut query = sqlx::query(&sql).bind(&params.q);
    if let Some(ref language) = params.language {
        query = query.bind(language);
    }
    if let Some(doc_id) = params.doc_id {
        query = query.bind(doc_id);
    }
    if let Some(ref resource_type) = params.resource_type {
        query = query.bind(resource_type);
    }
    if let Some(ref doc_role) = params.doc_role {
        query = query.bind(doc_role);
    }
    query = query.bind(params.limit + 1).bind(params.offset);

    let rows = query.fetch_all(pool).await.map_err(|e| {
        let msg = e.to_string();
        if msg.contains("fts5") || msg.contains("syntax error") || msg.contains("MATCH") {
            EngineError::validation(format!("Malformed query: {}", msg))
        } else {
            EngineError::Db(e)
        }
    })?;

    let has_more = rows.len() as i64 > params.limit;
    let next_offset = has_more.then_some(params.offset + params.limit);
    let page_rows: Vec<HitRow> = rows
        .into_iter()
        .take(params.limit as usize)
        .map(|row| HitRow {
            unit_id: row.get("unit_id"),
            doc_id: row.get("doc_id"),
            external_id: row.get("external_id"),
            text_norm: row.get("text_norm"),
            language: row.get("language"),
            title: row.get("title"),
        })
        .collect();

    // Sibling-document restriction per hit document, resolved once per page.
    let mut sibling_cache: HashMap<i64, Option<Vec<i64>>> = HashMap::new();

    let mut hits: Vec<Hit> = Vec::new();
    for row in &page_rows {
        let aligned = if params.include_aligned {
            let siblings = match sibling_cache.get(&row.doc_id) {
                Some(cached) => cached.clone(),
                None => {
                    let resolved = related_doc_ids(pool, row.doc_id).await?;
                    sibling_cache.insert(row.doc_id, resolved.clone());
                    resolved
                }
            };
            Some(fetch_aligned_units(pool, row.unit_id, siblings.as_deref(), params.aligned_limit).await?)
        } else {
            None
        };

        match params.mode {
            QueryMode::Segment => {
                hits.push(Hit::Segment {
                    doc_id: row.doc_id,
                    unit_id: row.unit_id,
                    external_id: row.external_id,
                    language: row.language.clone(),
                    title: row.title.clone(),
                    text: highlight_segment(&row.text_norm, &params.q),
                    text_norm: row.text_norm.clone(),
                    aligned,
                });
            }
            QueryMode::Kwic => {
                let window = params.window as usize;
                let occurrences = if params.all_occurrences {
                    all_kwic_windows(&row.text_norm, &params.q, window)
                } else {
                    vec![kwic_windows(&row.text_norm, &params.q, window)]
                };
                for (left, match_text, right) in occurrences {
                    hits.push(Hit::Kwic {
                        doc_id: row.doc_id,
                        unit_id: row.unit_id,
                        external_id: row.external_id,
                        language: row.language.clone(),
                        title: row.title.clone(),
                        left,
                        match_text,
                        right,
                        text_norm: row.text_norm.clone(),
                        aligned: aligned.clone(),
                    });
                }
            }
        }
    }

    tracing::debug!(
        q = %params.q,
        mode = ?params.mode,
        count = hits.len(),
        offset = params.offset,
        "query served"
    );

    Ok(QueryPage {
        hits,
        limit: params.limit,
        offset: params.offset,
        next_offset,
        has_more,
        total: None,
        fts_stale,
    })
}

/// Documents related to `doc_id` through `doc_relations`, in either
/// direction. `None` when the document participates in no relation, in
/// which case enrichment is unrestricted.
async fn related_doc_ids(
    pool: &SqlitePool,
    doc_id: i64,
) -> Result<Option<Vec<i64>>, EngineError> {
    let rows = sqlx::query(
        "SELECT doc_id, target_doc_id FROM doc_relations WHERE doc_id = ? OR target_doc_id = ?",
    )
    .bind(doc_id)
    .bind(doc_id)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Ok(None);
    }
    let mut related: Vec<i64> = Vec::new();
    for row in rows {
        let a: i64 = row.get("doc_id");
        let b: i64 = row.get("target_doc_id");
        let other = if a == doc_id { b } else { a };
        if !related.contains(&other) {
            related.push(other);
        }
    }
    Ok(Some(related))
}

/// Units aligned to `unit_id` through links in either direction, capped by
/// `aligned_limit` and optionally restricted to `sibling_docs`.
async fn fetch_aligned_units(
    pool: &SqlitePool,
    unit_id: i64,
    sibling_docs: Option<&[i64]>,
    aligned_limit: Option<i64>,
) -> Result<Vec<AlignedUnit>, EngineError> {
    let rows = sqlx::query(
        r#"
        SELECT u.unit_id AS unit_id, u.doc_id AS doc_id, al.external_id AS external_id,
               u.text_norm AS text, d.language AS language, d.title AS title
        FROM alignment_links al
        JOIN units u ON u.unit_id = al.target_unit_id
        JOIN documents d ON d.doc_id = u.doc_id
        WHERE al.pivot_unit_id = ?
        UNION
        SELECT u.unit_id, u.doc_id, al.external_id, u.text_norm, d.language, d.title
        FROM alignment_links al
        JOIN units u ON u.unit_id = al.pivot_unit_id
        JOIN documents d ON d.doc_id = u.doc_id
        WHERE al.target_unit_id = ?
        ORDER BY language, doc_id, unit_id
        "#,
    )
    .bind(unit_id)
    .bind(unit_id)
    .fetch_all(pool)
    .await?;

    let mut aligned = Vec::new();
    for row in rows {
        let doc_id: i64 = row.get("doc_id");
        if let Some(siblings) = sibling_docs {
            if !siblings.contains(&doc_id) {
                continue;
            }
        }
        aligned.push(AlignedUnit {
            unit_id: row.get("unit_id"),
            doc_id,
            external_id: row.get("external_id"),
            language: row.get("language"),
            title: row.get("title"),
            text: row.get("text"),
        });
        if let Some(cap) = aligned_limit {
            if aligned.len() as i64 >= cap {
                break;
            }
        }
    }
    Ok(aligned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_highlight_wraps_matches() {
        assert_eq!(
            highlight_segment("Bonjour le monde.", "Bonjour"),
            "<<Bonjour>> le monde."
        );
        assert_eq!(
            highlight_segment("chat et chien", "chat chien"),
            "<<chat>> et <<chien>>"
        );
    }

    #[test]
    fn segment_highlight_case_insensitive() {
        assert_eq!(highlight_segment("BONJOUR", "bonjour"), "<<BONJOUR>>");
    }

    #[test]
    fn segment_highlight_strips_phrase_quotes() {
        assert_eq!(
            highlight_segment("le petit chat", "\"petit\""),
            "le <<petit>> chat"
        );
    }

    #[test]
    fn kwic_multi_occurrence_windows() {
        // window=1, three occurrences
        let text = "needle haystack needle needle haystack";
        let occurrences = all_kwic_windows(text, "needle", 1);
        assert_eq!(
            occurrences,
            vec![
                ("".to_string(), "needle".to_string(), "haystack".to_string()),
                ("haystack".to_string(), "needle".to_string(), "needle".to_string()),
                ("needle".to_string(), "needle".to_string(), "haystack".to_string()),
            ]
        );
    }

    #[test]
    fn kwic_first_match_only() {
        let (left, matched, right) = kwic_windows("a b needle c d", "needle", 2);
        assert_eq!(left, "a b");
        assert_eq!(matched, "needle");
        assert_eq!(right, "c d");
    }

    #[test]
    fn kwic_window_clipped_at_unit_edges() {
        let (left, matched, right) = kwic_windows("needle only", "needle", 5);
        assert_eq!(left, "");
        assert_eq!(matched, "needle");
        assert_eq!(right, "only");
    }

    #[test]
    fn proximity_query_shape() {
        assert_eq!(proximity_query(&["chat", "chien"], 3).unwrap(), "NEAR(chat chien, 3)");
        assert!(proximity_query(&["solo"], 3).is_err());
    }

    #[test]
    fn params_validation_bounds() {
        let mut params = QueryParams {
            q: "x".into(),
            ..Default::default()
        };
        assert!(params.validate().is_ok());
        params.window = 2;
        assert!(params.validate().is_err());
        params.window = 26;
        assert!(params.validate().is_err());
        params.window = 10;
        params.limit = 0;
        assert!(params.validate().is_err());
        params.limit = 201;
        assert!(params.validate().is_err());
        params.limit = 50;
        params.aligned_limit = Some(0);
        assert!(params.validate().is_err());
    }
}
