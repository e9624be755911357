//! Alignment engine — four strategies producing pivot↔target link sets.
//!
//! | Strategy | Matching key |
//! |----------|--------------|
//! | `external_id` | shared anchors; first occurrence wins on duplicates |
//! | `external_id_then_position` | anchors first, then position `n` for the rest |
//! | `position` | shared ordering index `n` |
//! | `similarity` | greedy normalized edit-distance ≥ threshold |
//!
//! Only `line` units participate. Each (pivot, target) pair writes its link
//! set in one transaction tagged by a single run id; re-running alignment
//! never overwrites earlier links — it creates a new set under a new run.
//! Reports carry coverage stats, anchor diagnostics, warnings, and (on
//! request) a debug payload with per-phase link sources, sample links, and
//! similarity score statistics.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::error::EngineError;
use crate::models::RunKind;
use crate::runs;

/// Alignment strategy — a closed tagged set; unknown tags are validation
/// errors at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignStrategy {
    ExternalId,
    ExternalIdThenPosition,
    Position,
    Similarity,
}

impl AlignStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlignStrategy::ExternalId => "external_id",
            AlignStrategy::ExternalIdThenPosition => "external_id_then_position",
            AlignStrategy::Position => "position",
            AlignStrategy::Similarity => "similarity",
        }
    }
}

/// Request parameters for an alignment run.
#[derive(Debug, Clone, Deserialize)]
pub struct AlignParams {
    pub pivot_doc_id: i64,
    pub target_doc_ids: Vec<i64>,
    #[serde(default = "default_strategy")]
    pub strategy: AlignStrategy,
    /// Similarity threshold in [0, 1]; only meaningful for `similarity`.
    #[serde(default = "default_threshold")]
    pub sim_threshold: f64,
    #[serde(default)]
    pub debug_align: bool,
    /// Caller-supplied run id (e.g. from a job); a fresh UUID otherwise.
    #[serde(default)]
    pub run_id: Option<String>,
}

fn default_strategy() -> AlignStrategy {
    AlignStrategy::ExternalId
}
fn default_threshold() -> f64 {
    0.8
}

impl AlignParams {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.target_doc_ids.is_empty() {
            return Err(EngineError::validation(
                "target_doc_ids must be a non-empty list",
            ));
        }
        if !(0.0..=1.0).contains(&self.sim_threshold) {
            return Err(EngineError::validation("sim_threshold must be in [0.0, 1.0]"));
        }
        if let Some(ref run_id) = self.run_id {
            if run_id.trim().is_empty() {
                return Err(EngineError::validation(
                    "run_id must be a non-empty string when provided",
                ));
            }
        }
        Ok(())
    }
}

/// One link sampled into a debug payload.
#[derive(Debug, Clone, Serialize)]
pub struct SampleLink {
    pub phase: &'static str,
    pub pivot_unit_id: i64,
    pub target_unit_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Score statistics over matched similarity pairs.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarityStats {
    pub matched_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_mean: Option<f64>,
}

/// Debug payload attached to a report when `debug_align` is requested.
#[derive(Debug, Clone, Serialize)]
pub struct AlignDebug {
    pub strategy: &'static str,
    pub link_sources: BTreeMap<&'static str, usize>,
    pub sample_links: Vec<SampleLink>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_stats: Option<SimilarityStats>,
}

const SAMPLE_LINK_CAP: usize = 20;

/// Coverage and diagnostic report for one (pivot, target) pair.
#[derive(Debug, Clone, Serialize)]
pub struct AlignmentReport {
    pub pivot_doc_id: i64,
    pub target_doc_id: i64,
    pub pivot_title: String,
    pub target_title: String,
    pub pivot_line_count: usize,
    pub target_line_count: usize,
    pub links_created: usize,
    pub links_skipped: usize,
    pub coverage_pct: f64,
    pub matched: Vec<i64>,
    /// Keys present on the pivot side but absent from the target.
    pub missing_in_target: Vec<i64>,
    /// Keys present on the target side but absent from the pivot.
    pub missing_in_pivot: Vec<i64>,
    pub duplicates_pivot: Vec<i64>,
    pub duplicates_target: Vec<i64>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<AlignDebug>,
}

impl AlignmentReport {
    fn new(pivot_doc_id: i64, target_doc_id: i64, pivot_title: String, target_title: String) -> Self {
        AlignmentReport {
            pivot_doc_id,
            target_doc_id,
            pivot_title,
            target_title,
            pivot_line_count: 0,
            target_line_count: 0,
            links_created: 0,
            links_skipped: 0,
            coverage_pct: 0.0,
            matched: Vec::new(),
            missing_in_target: Vec::new(),
            missing_in_pivot: Vec::new(),
            duplicates_pivot: Vec::new(),
            duplicates_target: Vec::new(),
            warnings: Vec::new(),
            debug: None,
        }
    }

    fn finalize(&mut self, links_created: usize) {
        self.links_created = links_created;
        self.links_skipped = self.pivot_line_count.saturating_sub(links_created);
        self.coverage_pct = if self.pivot_line_count == 0 {
            0.0
        } else {
            round2(links_created as f64 / self.pivot_line_count as f64 * 100.0)
        };
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Overall result of one alignment run across all targets.
#[derive(Debug, Clone, Serialize)]
pub struct AlignOutcome {
    pub run_id: String,
    pub strategy: &'static str,
    pub pivot_doc_id: i64,
    pub debug_align: bool,
    pub total_links_created: usize,
    pub reports: Vec<AlignmentReport>,
}

#[derive(Debug, Clone)]
struct LineUnit {
    unit_id: i64,
    n: i64,
    external_id: Option<i64>,
    text_norm: String,
}

#[derive(Debug, Clone)]
struct NewLink {
    pivot_unit_id: i64,
    target_unit_id: i64,
    external_id: Option<i64>,
}

async fn load_line_units(pool: &SqlitePool, doc_id: i64) -> Result<Vec<LineUnit>, EngineError> {
    let rows = sqlx::query(
        "SELECT unit_id, n, external_id, text_norm FROM units
         WHERE doc_id = ? AND unit_type = 'line' ORDER BY n",
    )
    .bind(doc_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| LineUnit {
            unit_id: row.get("unit_id"),
            n: row.get("n"),
            external_id: row.get("external_id"),
            text_norm: row.get("text_norm"),
        })
        .collect())
}

async fn doc_title(pool: &SqlitePool, doc_id: i64) -> Result<String, EngineError> {
    let title: Option<Option<String>> =
        sqlx::query_scalar("SELECT title FROM documents WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_optional(pool)
            .await?;
    match title {
        Some(Some(title)) => Ok(title),
        Some(None) => Ok(format!("doc_{}", doc_id)),
        None => Err(EngineError::validation(format!(
            "Unknown doc_id: {}",
            doc_id
        ))),
    }
}

/// First-occurrence map `external_id → unit` plus the duplicate keys.
fn anchor_map(units: &[LineUnit]) -> (BTreeMap<i64, &LineUnit>, Vec<i64>) {
    let mut map: BTreeMap<i64, &LineUnit> = BTreeMap::new();
    let mut seen_twice: BTreeSet<i64> = BTreeSet::new();
    for unit in units {
        if let Some(eid) = unit.external_id {
            if map.contains_key(&eid) {
                seen_twice.insert(eid);
            } else {
                map.insert(eid, unit);
            }
        }
    }
    (map, seen_twice.into_iter().collect())
}

/// Write one pair's link set in a single transaction.
async fn insert_links(
    pool: &SqlitePool,
    run_id: &str,
    pivot_doc_id: i64,
    target_doc_id: i64,
    links: &[NewLink],
) -> Result<(), EngineError> {
    let created_at = runs::utcnow_iso();
    let mut tx = pool.begin().await?;
    for link in links {
        sqlx::query(
            "INSERT INTO alignment_links
                 (run_id, pivot_unit_id, target_unit_id, external_id,
                  pivot_doc_id, target_doc_id, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, NULL, ?)",
        )
        .bind(run_id)
        .bind(link.pivot_unit_id)
        .bind(link.target_unit_id)
        .bind(link.external_id)
        .bind(pivot_doc_id)
        .bind(target_doc_id)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

fn push_dup_warnings(report: &mut AlignmentReport) {
    if !report.duplicates_pivot.is_empty() {
        report.warnings.push(format!(
            "Duplicate external_id(s) in pivot doc {}: {:?}",
            report.pivot_doc_id, report.duplicates_pivot
        ));
    }
    if !report.duplicates_target.is_empty() {
        report.warnings.push(format!(
            "Duplicate external_id(s) in target doc {}: {:?}",
            report.target_doc_id, report.duplicates_target
        ));
    }
    if !report.missing_in_target.is_empty() {
        report.warnings.push(format!(
            "{} key(s) in pivot missing from target",
            report.missing_in_target.len()
        ));
    }
    if !report.missing_in_pivot.is_empty() {
        report.warnings.push(format!(
            "{} key(s) in target missing from pivot",
            report.missing_in_pivot.len()
        ));
    }
}

/// Align one (pivot, target) pair by shared `external_id`.
async fn align_pair_external_id(
    pool: &SqlitePool,
    pivot_doc_id: i64,
    target_doc_id: i64,
    run_id: &str,
    debug: bool,
) -> Result<AlignmentReport, EngineError> {
    let pivot_title = doc_title(pool, pivot_doc_id).await?;
    let target_title = doc_title(pool, target_doc_id).await?;
    let pivot_units = load_line_units(pool, pivot_doc_id).await?;
    let target_units = load_line_units(pool, target_doc_id).await?;

    let (pivot_map, pivot_dups) = anchor_map(&pivot_units);
    let (target_map, target_dups) = anchor_map(&target_units);

    let pivot_keys: BTreeSet<i64> = pivot_map.keys().copied().collect();
    let target_keys: BTreeSet<i64> = target_map.keys().copied().collect();

    let mut report = AlignmentReport::new(pivot_doc_id, target_doc_id, pivot_title, target_title);
    report.pivot_line_count = pivot_keys.len();
    report.target_line_count = target_keys.len();
    report.matched = pivot_keys.intersection(&target_keys).copied().collect();
    report.missing_in_target = pivot_keys.difference(&target_keys).copied().collect();
    report.missing_in_pivot = target_keys.difference(&pivot_keys).copied().collect();
    report.duplicates_pivot = pivot_dups;
    report.duplicates_target = target_dups;
    push_dup_warnings(&mut report);

    let mut links: Vec<NewLink> = Vec::new();
    let mut samples: Vec<SampleLink> = Vec::new();
    for eid in &report.matched {
        let pivot_unit = pivot_map[eid];
        let target_unit = target_map[eid];
        links.push(NewLink {
            pivot_unit_id: pivot_unit.unit_id,
            target_unit_id: target_unit.unit_id,
            external_id: Some(*eid),
        });
        if debug && samples.len() < SAMPLE_LINK_CAP {
            samples.push(SampleLink {
                phase: "external_id",
                pivot_unit_id: pivot_unit.unit_id,
                target_unit_id: target_unit.unit_id,
                external_id: Some(*eid),
                position: None,
                score: None,
            });
        }
    }

    insert_links(pool, run_id, pivot_doc_id, target_doc_id, &links).await?;
    report.finalize(links.len());
    if debug {
        report.debug = Some(AlignDebug {
            strategy: "external_id",
            link_sources: BTreeMap::from([("external_id", links.len())]),
            sample_links: samples,
            threshold: None,
            similarity_stats: None,
        });
    }
    Ok(report)
}

/// Align by anchors first, then fill remaining lines by shared position.
async fn align_pair_hybrid(
    pool: &SqlitePool,
    pivot_doc_id: i64,
    target_doc_id: i64,
    run_id: &str,
    debug: bool,
) -> Result<AlignmentReport, EngineError> {
    let pivot_title = doc_title(pool, pivot_doc_id).await?;
    let target_title = doc_title(pool, target_doc_id).await?;
    let pivot_units = load_line_units(pool, pivot_doc_id).await?;
    let target_units = load_line_units(pool, target_doc_id).await?;

    let (pivot_map, pivot_dups) = anchor_map(&pivot_units);
    let (target_map, target_dups) = anchor_map(&target_units);
    let pivot_keys: BTreeSet<i64> = pivot_map.keys().copied().collect();
    let target_keys: BTreeSet<i64> = target_map.keys().copied().collect();

    let mut report = AlignmentReport::new(pivot_doc_id, target_doc_id, pivot_title, target_title);
    report.pivot_line_count = pivot_units.len();
    report.target_line_count = target_units.len();
    report.matched = pivot_keys.intersection(&target_keys).copied().collect();
    report.missing_in_target = pivot_keys.difference(&target_keys).copied().collect();
    report.missing_in_pivot = target_keys.difference(&pivot_keys).copied().collect();
    report.duplicates_pivot = pivot_dups;
    report.duplicates_target = target_dups;
    push_dup_warnings(&mut report);

    let mut used_pivot: BTreeSet<i64> = BTreeSet::new();
    let mut used_target: BTreeSet<i64> = BTreeSet::new();
    let mut links: Vec<NewLink> = Vec::new();
    let mut samples: Vec<SampleLink> = Vec::new();

    // Phase 1: explicit anchor links.
    for eid in &report.matched {
        let pivot_unit = pivot_map[eid];
        let target_unit = target_map[eid];
        used_pivot.insert(pivot_unit.unit_id);
        used_target.insert(target_unit.unit_id);
        links.push(NewLink {
            pivot_unit_id: pivot_unit.unit_id,
            target_unit_id: target_unit.unit_id,
            external_id: Some(*eid),
        });
        if debug && samples.len() < SAMPLE_LINK_CAP {
            samples.push(SampleLink {
                phase: "external_id",
                pivot_unit_id: pivot_unit.unit_id,
                target_unit_id: target_unit.unit_id,
                external_id: Some(*eid),
                position: None,
                score: None,
            });
        }
    }
    let external_id_links = links.len();

    // Phase 2: position fallback over units both sides left unused.
    let pivot_remaining: BTreeMap<i64, i64> = pivot_units
        .iter()
        .filter(|unit| !used_pivot.contains(&unit.unit_id))
        .map(|unit| (unit.n, unit.unit_id))
        .collect();
    let target_remaining: BTreeMap<i64, i64> = target_units
        .iter()
        .filter(|unit| !used_target.contains(&unit.unit_id))
        .map(|unit| (unit.n, unit.unit_id))
        .collect();

    let mut position_links = 0usize;
    for (n, pivot_unit_id) in &pivot_remaining {
        if let Some(target_unit_id) = target_remaining.get(n) {
            links.push(NewLink {
                pivot_unit_id: *pivot_unit_id,
                target_unit_id: *target_unit_id,
                external_id: None,
            });
            position_links += 1;
            if debug && samples.len() < SAMPLE_LINK_CAP {
                samples.push(SampleLink {
                    phase: "position",
                    pivot_unit_id: *pivot_unit_id,
                    target_unit_id: *target_unit_id,
                    external_id: None,
                    position: Some(*n),
                    score: None,
                });
            }
        }
    }
    if position_links > 0 {
        report
            .warnings
            .push(format!("Position fallback created {} link(s)", position_links));
    }

    insert_links(pool, run_id, pivot_doc_id, target_doc_id, &links).await?;
    report.finalize(links.len());
    if debug {
        report.debug = Some(AlignDebug {
            strategy: "external_id_then_position",
            link_sources: BTreeMap::from([
                ("external_id", external_id_links),
                ("position", position_links),
            ]),
            sample_links: samples,
            threshold: None,
            similarity_stats: None,
        });
    }
    Ok(report)
}

/// Align by shared ordering index `n`, regardless of anchors.
async fn align_pair_position(
    pool: &SqlitePool,
    pivot_doc_id: i64,
    target_doc_id: i64,
    run_id: &str,
    debug: bool,
) -> Result<AlignmentReport, EngineError> {
    let pivot_title = doc_title(pool, pivot_doc_id).await?;
    let target_title = doc_title(pool, target_doc_id).await?;
    let pivot_units = load_line_units(pool, pivot_doc_id).await?;
    let target_units = load_line_units(pool, target_doc_id).await?;

    let pivot_pos: BTreeMap<i64, i64> =
        pivot_units.iter().map(|unit| (unit.n, unit.unit_id)).collect();
    let target_pos: BTreeMap<i64, i64> =
        target_units.iter().map(|unit| (unit.n, unit.unit_id)).collect();
    let pivot_ns: BTreeSet<i64> = pivot_pos.keys().copied().collect();
    let target_ns: BTreeSet<i64> = target_pos.keys().copied().collect();

    let mut report = AlignmentReport::new(pivot_doc_id, target_doc_id, pivot_title, target_title);
    report.pivot_line_count = pivot_ns.len();
    report.target_line_count = target_ns.len();
    report.matched = pivot_ns.intersection(&target_ns).copied().collect();
    report.missing_in_target = pivot_ns.difference(&target_ns).copied().collect();
    report.missing_in_pivot = target_ns.difference(&pivot_ns).copied().collect();
    if !report.missing_in_target.is_empty() {
        report.warnings.push(format!(
            "{} position(s) in pivot missing from target",
            report.missing_in_target.len()
        ));
    }
    if !report.missing_in_pivot.is_empty() {
        report.warnings.push(format!(
            "{} position(s) in target missing from pivot",
            report.missing_in_pivot.len()
        ));
    }

    let mut links: Vec<NewLink> = Vec::new();
    let mut samples: Vec<SampleLink> = Vec::new();
    for n in &report.matched {
        let pivot_unit_id = pivot_pos[n];
        let target_unit_id = target_pos[n];
        links.push(NewLink {
            pivot_unit_id,
            target_unit_id,
            external_id: None,
        });
        if debug && samples.len() < SAMPLE_LINK_CAP {
            samples.push(SampleLink {
                phase: "position",
                pivot_unit_id,
                target_unit_id,
                external_id: None,
                position: Some(*n),
                score: None,
            });
        }
    }

    insert_links(pool, run_id, pivot_doc_id, target_doc_id, &links).await?;
    report.finalize(links.len());
    if debug {
        report.debug = Some(AlignDebug {
            strategy: "position",
            link_sources: BTreeMap::from([("position", links.len())]),
            sample_links: samples,
            threshold: None,
            similarity_stats: None,
        });
    }
    Ok(report)
}

/// Levenshtein edit distance over chars, space-optimized to one row.
fn edit_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let (long, short) = if a_chars.len() >= b_chars.len() {
        (&a_chars, &b_chars)
    } else {
        (&b_chars, &a_chars)
    };
    if short.is_empty() {
        return long.len();
    }

    let mut prev: Vec<usize> = (0..=short.len()).collect();
    let mut curr: Vec<usize> = vec![0; short.len() + 1];
    for (i, &c1) in long.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &c2) in short.iter().enumerate() {
            let substitution = prev[j] + usize::from(c1 != c2);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[short.len()]
}

/// Normalized similarity in [0, 1]: `1 - distance / max(len)`.
/// Empty-string pairs score 1.0.
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - edit_distance(a, b) as f64 / max_len as f64
}

/// Greedy one-to-one matching by edit-distance similarity ≥ threshold.
/// Targets are scanned in unit-id order and a strictly better score is
/// required to displace the current best, so ties break deterministically
/// toward the lower unit id.
async fn align_pair_similarity(
    pool: &SqlitePool,
    pivot_doc_id: i64,
    target_doc_id: i64,
    run_id: &str,
    threshold: f64,
    debug: bool,
) -> Result<AlignmentReport, EngineError> {
    let pivot_title = doc_title(pool, pivot_doc_id).await?;
    let target_title = doc_title(pool, target_doc_id).await?;
    let pivot_units = load_line_units(pool, pivot_doc_id).await?;
    let mut target_units = load_line_units(pool, target_doc_id).await?;
    target_units.sort_by_key(|unit| unit.unit_id);

    let mut report = AlignmentReport::new(pivot_doc_id, target_doc_id, pivot_title, target_title);
    report.pivot_line_count = pivot_units.len();
    report.target_line_count = target_units.len();

    let mut used_target: BTreeSet<i64> = BTreeSet::new();
    let mut links: Vec<NewLink> = Vec::new();
    let mut samples: Vec<SampleLink> = Vec::new();
    let mut matched_scores: Vec<f64> = Vec::new();

    for pivot_unit in &pivot_units {
        let mut best_score = -1.0f64;
        let mut best_target: Option<&LineUnit> = None;
        for target_unit in &target_units {
            if used_target.contains(&target_unit.unit_id) {
                continue;
            }
            let score = similarity(&pivot_unit.text_norm, &target_unit.text_norm);
            if score > best_score {
                best_score = score;
                best_target = Some(target_unit);
            }
        }

        match best_target {
            Some(target_unit) if best_score >= threshold => {
                used_target.insert(target_unit.unit_id);
                links.push(NewLink {
                    pivot_unit_id: pivot_unit.unit_id,
                    target_unit_id: target_unit.unit_id,
                    external_id: None,
                });
                report.matched.push(pivot_unit.unit_id);
                matched_scores.push(best_score);
                if debug && samples.len() < SAMPLE_LINK_CAP {
                    samples.push(SampleLink {
                        phase: "similarity",
                        pivot_unit_id: pivot_unit.unit_id,
                        target_unit_id: target_unit.unit_id,
                        external_id: None,
                        position: None,
                        score: Some(round4(best_score)),
                    });
                }
            }
            _ => report.missing_in_target.push(pivot_unit.unit_id),
        }
    }

    if !report.missing_in_target.is_empty() {
        report.warnings.push(format!(
            "{} pivot unit(s) unmatched (similarity < {})",
            report.missing_in_target.len(),
            threshold
        ));
    }

    insert_links(pool, run_id, pivot_doc_id, target_doc_id, &links).await?;
    report.finalize(links.len());
    if debug {
        let similarity_stats = if matched_scores.is_empty() {
            SimilarityStats {
                matched_count: 0,
                score_min: None,
                score_max: None,
                score_mean: None,
            }
        } else {
            let min = matched_scores.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = matched_scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let mean = matched_scores.iter().sum::<f64>() / matched_scores.len() as f64;
            SimilarityStats {
                matched_count: matched_scores.len(),
                score_min: Some(round4(min)),
                score_max: Some(round4(max)),
                score_mean: Some(round4(mean)),
            }
        };
        report.debug = Some(AlignDebug {
            strategy: "similarity",
            link_sources: BTreeMap::from([("similarity", links.len())]),
            sample_links: samples,
            threshold: Some(threshold),
            similarity_stats: Some(similarity_stats),
        });
    }
    Ok(report)
}

/// Run an alignment across all targets, persisting it as a run of kind
/// `align` so it can be referenced later by `run_id`.
pub async fn run_alignment(
    pool: &SqlitePool,
    params: &AlignParams,
) -> Result<AlignOutcome, EngineError> {
    params.validate()?;

    let mut run_params = serde_json::json!({
        "pivot_doc_id": params.pivot_doc_id,
        "target_doc_ids": params.target_doc_ids,
        "strategy": params.strategy.as_str(),
        "debug_align": params.debug_align,
    });
    if params.strategy == AlignStrategy::Similarity {
        run_params["sim_threshold"] = serde_json::json!(params.sim_threshold);
    }

    let run_id = runs::create_run(pool, RunKind::Align, &run_params, params.run_id.clone())
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;

    let mut reports: Vec<AlignmentReport> = Vec::with_capacity(params.target_doc_ids.len());
    for &target_doc_id in &params.target_doc_ids {
        let report = match params.strategy {
            AlignStrategy::ExternalId => {
                align_pair_external_id(pool, params.pivot_doc_id, target_doc_id, &run_id, params.debug_align)
                    .await?
            }
            AlignStrategy::ExternalIdThenPosition => {
                align_pair_hybrid(pool, params.pivot_doc_id, target_doc_id, &run_id, params.debug_align)
                    .await?
            }
            AlignStrategy::Position => {
                align_pair_position(pool, params.pivot_doc_id, target_doc_id, &run_id, params.debug_align)
                    .await?
            }
            AlignStrategy::Similarity => {
                align_pair_similarity(
                    pool,
                    params.pivot_doc_id,
                    target_doc_id,
                    &run_id,
                    params.sim_threshold,
                    params.debug_align,
                )
                .await?
            }
        };
        tracing::info!(
            pivot = params.pivot_doc_id,
            target = target_doc_id,
            strategy = params.strategy.as_str(),
            links_created = report.links_created,
            coverage_pct = report.coverage_pct,
            "pair aligned"
        );
        reports.push(report);
    }

    let total_links_created: usize = reports.iter().map(|r| r.links_created).sum();
    let stats = serde_json::json!({
        "strategy": params.strategy.as_str(),
        "pivot_doc_id": params.pivot_doc_id,
        "target_doc_ids": params.target_doc_ids,
        "debug_align": params.debug_align,
        "total_links_created": total_links_created,
        "pairs": reports,
    });
    runs::update_run_stats(pool, &run_id, &stats)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;

    Ok(AlignOutcome {
        run_id,
        strategy: params.strategy.as_str(),
        pivot_doc_id: params.pivot_doc_id,
        debug_align: params.debug_align,
        total_links_created,
        reports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_distance_basics() {
        assert_eq!(edit_distance("", ""), 0);
        assert_eq!(edit_distance("abc", ""), 3);
        assert_eq!(edit_distance("chat", "chats"), 1);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("même", "même"), 1.0);
        assert_eq!(similarity("ab", "cd"), 0.0);
        let s = similarity("bonjour", "bonjoure");
        assert!(s > 0.8 && s < 1.0);
    }

    #[test]
    fn edit_distance_counts_chars_not_bytes() {
        // é is two bytes but one char
        assert_eq!(edit_distance("é", "e"), 1);
        assert_eq!(edit_distance("été", "ete"), 2);
    }

    #[test]
    fn params_validation() {
        let params = AlignParams {
            pivot_doc_id: 1,
            target_doc_ids: vec![],
            strategy: AlignStrategy::ExternalId,
            sim_threshold: 0.8,
            debug_align: false,
            run_id: None,
        };
        assert!(params.validate().is_err());

        let params = AlignParams {
            target_doc_ids: vec![2],
            sim_threshold: 1.5,
            ..params
        };
        assert!(params.validate().is_err());

        let params = AlignParams {
            sim_threshold: 0.8,
            run_id: Some("  ".into()),
            ..params
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn strategy_tags_round_trip() {
        let s: AlignStrategy = serde_json::from_str("\"external_id_then_position\"").unwrap();
        assert_eq!(s, AlignStrategy::ExternalIdThenPosition);
        assert!(serde_json::from_str::<AlignStrategy>("\"fuzzy\"").is_err());
    }
}
