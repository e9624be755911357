//! Core data models used throughout the engine.
//!
//! The data lifecycle is:
//!
//! ```text
//! Importer → Document + Unit* → index() → fts_units
//!                    │
//!                    ├── align() → AlignmentLink*
//!                    ├── curate() / segment() → rewritten units
//!                    └── every operation → RunRecord
//! ```
//!
//! - A **[`Document`]** is one imported source with role, language, and
//!   provenance metadata.
//! - A **[`Unit`]** is the atomic addressable span of text. Only
//!   `kind = line` units are indexed and alignable; `structure` units are
//!   preserved for context.
//! - An **[`AlignmentLink`]** is a one-to-one pivot↔target correspondence
//!   tagged by the run that produced it.
//! - A **[`RunRecord`]** is the immutable audit record of one operation.

use serde::{Deserialize, Serialize};

/// Role a document plays in the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocRole {
    Standalone,
    Original,
    Translation,
    Excerpt,
    Unknown,
}

impl DocRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocRole::Standalone => "standalone",
            DocRole::Original => "original",
            DocRole::Translation => "translation",
            DocRole::Excerpt => "excerpt",
            DocRole::Unknown => "unknown",
        }
    }

    pub const ALL: &'static [&'static str] =
        &["standalone", "original", "translation", "excerpt", "unknown"];
}

/// Kind of a unit: `line` units are indexed and alignable, `structure`
/// units are scaffolding (headings, notes) kept for context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Line,
    Structure,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Line => "line",
            UnitKind::Structure => "structure",
        }
    }
}

/// Review status of an alignment link. `None` in the database means
/// unreviewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Accepted,
    Rejected,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Accepted => "accepted",
            LinkStatus::Rejected => "rejected",
        }
    }
}

/// Kind of a recorded run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Init,
    Import,
    Index,
    Query,
    Curate,
    Segment,
    Align,
    Export,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Init => "init",
            RunKind::Import => "import",
            RunKind::Index => "index",
            RunKind::Query => "query",
            RunKind::Curate => "curate",
            RunKind::Segment => "segment",
            RunKind::Align => "align",
            RunKind::Export => "export",
        }
    }
}

/// One imported source document.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub doc_id: i64,
    pub title: Option<String>,
    pub language: Option<String>,
    pub doc_role: String,
    pub resource_type: Option<String>,
    /// JSON-shaped metadata map (encoding info, TEI unit element, …).
    pub meta_json: Option<String>,
    pub source_path: Option<String>,
    /// SHA-256 of the source file bytes.
    pub source_hash: Option<String>,
    pub created_at: String,
}

/// The atomic addressable span of text in a document.
///
/// `(doc_id, n)` is unique and covers `1..N` contiguously. `text_raw` is
/// byte-faithful after decoding (line endings normalized); `text_norm` is
/// the output of the normalization policy.
#[derive(Debug, Clone, Serialize)]
pub struct Unit {
    pub unit_id: i64,
    pub doc_id: i64,
    pub unit_type: String,
    /// 1-based ordering index within the document, gap-free.
    pub n: i64,
    /// Integer anchor extracted from the source (e.g. `[42] text…`), when
    /// present. Need not be unique within a document.
    pub external_id: Option<i64>,
    pub text_raw: String,
    pub text_norm: String,
    pub meta_json: Option<String>,
}

/// A one-to-one correspondence between a pivot unit and a target unit.
#[derive(Debug, Clone, Serialize)]
pub struct AlignmentLink {
    pub link_id: i64,
    pub run_id: String,
    pub pivot_unit_id: i64,
    pub target_unit_id: i64,
    /// Anchoring external id, or `None` for position/similarity links.
    pub external_id: Option<i64>,
    pub pivot_doc_id: i64,
    pub target_doc_id: i64,
    /// `None` = unreviewed.
    pub status: Option<String>,
    pub created_at: String,
}

/// A document-level typed edge (`translation_of` or `excerpt_of`).
#[derive(Debug, Clone, Serialize)]
pub struct DocRelation {
    pub id: i64,
    pub doc_id: i64,
    pub relation_type: String,
    pub target_doc_id: i64,
    pub note: Option<String>,
    pub created_at: String,
}

/// Allowed relation types for [`DocRelation`].
pub const RELATION_TYPES: &[&str] = &["translation_of", "excerpt_of"];

/// Immutable record of one operation.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub kind: String,
    pub params: Option<serde_json::Value>,
    pub stats: Option<serde_json::Value>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_serialize_snake_case() {
        assert_eq!(serde_json::to_string(&DocRole::Translation).unwrap(), "\"translation\"");
        assert_eq!(serde_json::to_string(&UnitKind::Line).unwrap(), "\"line\"");
        assert_eq!(serde_json::to_string(&RunKind::Align).unwrap(), "\"align\"");
        let role: DocRole = serde_json::from_str("\"excerpt\"").unwrap();
        assert_eq!(role, DocRole::Excerpt);
    }

    #[test]
    fn unknown_enumerants_are_rejected() {
        assert!(serde_json::from_str::<DocRole>("\"sidecar\"").is_err());
        assert!(serde_json::from_str::<LinkStatus>("\"maybe\"").is_err());
    }
}
