//! # Agrafes
//!
//! **A local multilingual corpus search and alignment engine for
//! concordance work.**
//!
//! Agrafes imports text documents (numbered lines, plain paragraphs,
//! lightly-structured TEI XML), splits them into addressable *units*,
//! indexes them in SQLite FTS5, aligns corresponding units across parallel
//! documents, and answers queries in segment or KWIC mode — optionally
//! enriched with aligned units from sibling documents.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌───────────────┐   ┌────────────┐
//! │  Importers  │──▶│ Normalization │──▶│  SQLite     │
//! │ TXT/DOCX/TEI│   │    policy     │   │ FTS5 index  │
//! └─────────────┘   └───────────────┘   └────┬───────┘
//!                                            │
//!                     ┌──────────┬───────────┤
//!                     ▼          ▼           ▼
//!                ┌─────────┐ ┌────────┐ ┌──────────┐
//!                │  Query  │ │ Aligner│ │ Curation  │
//!                └────┬────┘ └───┬────┘ └────┬─────┘
//!                     └──────────┴───────────┘
//!                                │
//!                     ┌──────────┴──────────┐
//!                     ▼                     ▼
//!                ┌─────────┐          ┌──────────┐
//!                │   CLI   │          │ Sidecar   │
//!                │(agrafes)│          │ (HTTP)    │
//!                └─────────┘          └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. **Importers** ([`importers`]) parse a source file into a document row
//!    plus ordered units (`line` or `structure`), applying the
//!    normalization policy ([`textnorm`]) to produce `text_norm` next to
//!    the byte-faithful `text_raw`. The whole unit graph lands atomically.
//! 2. The **indexer** ([`indexer`]) rebuilds the FTS5 table from `line`
//!    units; the FTS rowid equals the unit id, which is the joining
//!    contract between search hits and units.
//! 3. The **query engine** ([`query`]) searches FTS5 and projects hits into
//!    segment (`<<match>>` markers) or KWIC (left/match/right) shape, with
//!    `limit+1` pagination and optional aligned-sibling enrichment.
//! 4. The **aligner** ([`aligner`]) links pivot units to target units by
//!    anchor, hybrid, position, or similarity strategy; the **audit**
//!    surface ([`audit`]) lists, reviews, retargets, and scores links.
//! 5. **Curation** ([`curation`]) rewrites `text_norm` with ordered regex
//!    rules; **segmentation** ([`segmenter`]) rebuilds a document at
//!    sentence granularity. Both flag the index stale.
//! 6. Every operation is recorded as a **run** ([`runs`]); long operations
//!    run as **jobs** ([`jobs`]) behind the **sidecar** ([`server`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Core data types: `Document`, `Unit`, `AlignmentLink`, `RunRecord` |
//! | [`error`] | Typed error taxonomy (validation / unauthorized / not-found / internal) |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Versioned, idempotent schema migrations |
//! | [`diagnostics`] | Operational health report (integrity, FTS consistency, link checks) |
//! | [`textnorm`] | Deterministic raw → normalized text policy |
//! | [`encoding`] | Encoding detection ladder (BOM → detector → cp1252 → latin-1) |
//! | [`importers`] | Format parsers: numbered TXT/DOCX, DOCX paragraphs, TEI XML |
//! | [`indexer`] | FTS5 rebuild + stale flag |
//! | [`query`] | Segment/KWIC search with pagination and aligned enrichment |
//! | [`aligner`] | Four alignment strategies producing link sets |
//! | [`audit`] | Link listing, review status, retarget, quality metrics |
//! | [`curation`] | Ordered regex rules over `text_norm`, preview and apply |
//! | [`segmenter`] | Sentence resegmentation of a document |
//! | [`metadata`] | Document metadata validation |
//! | [`runs`] | Append-only run log + per-run log files |
//! | [`jobs`] | FIFO job queue, single worker, progress, cancellation |
//! | [`portfile`] | Sidecar discovery file + liveness inspection |
//! | [`contract`] | JSON envelope, error codes, OpenAPI snapshot |
//! | [`server`] | Loopback HTTP sidecar (axum) |
//! | [`exporters`] | TEI XML, alignment CSV/TSV, run report JSONL/HTML |

pub mod aligner;
pub mod audit;
pub mod contract;
pub mod curation;
pub mod db;
pub mod diagnostics;
pub mod encoding;
pub mod error;
pub mod exporters;
pub mod importers;
pub mod indexer;
pub mod jobs;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod portfile;
pub mod query;
pub mod runs;
pub mod segmenter;
pub mod server;
pub mod textnorm;
