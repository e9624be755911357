//! Versioned database schema migrations.
//!
//! Each migration has a monotone integer version and a list of SQL
//! statements. Applied versions are recorded in `schema_migrations`, so
//! re-running the runner is a no-op for versions already applied. Schema
//! evolution is additive only — no migration drops or rewrites data.
//!
//! # Schema
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌─────────────────┐
//! │  documents   │──┐  │    units     │──┐  │ alignment_links │
//! │              │  │  │              │  │  │                 │
//! │ doc_id (PK)  │  └──│ doc_id (FK)  │  ├──│ pivot_unit_id   │
//! │ title        │     │ unit_id (PK) │  └──│ target_unit_id  │
//! │ language     │     │ unit_type    │     │ run_id          │
//! │ doc_role     │     │ n            │     │ external_id     │
//! │ resource_type│     │ external_id  │     │ pivot_doc_id    │
//! │ meta_json    │     │ text_raw     │     │ target_doc_id   │
//! │ source_path  │     │ text_norm    │     │ status          │
//! │ source_hash  │     │ meta_json    │     └─────────────────┘
//! │ created_at   │     └──────────────┘
//! └──────────────┘     ┌──────────────┐     ┌──────────────┐
//!                      │  fts_units   │     │ doc_relations│
//!                      │  (FTS5)      │     │ runs         │
//!                      │ rowid=unit_id│     │ engine_state │
//!                      └──────────────┘     └──────────────┘
//! ```
//!
//! `fts_units` is a regular (non-content) FTS5 table whose rowid equals
//! `unit_id`; that identity is the joining contract between search hits and
//! units. The tokenizer is `unicode61` with `remove_diacritics 0`
//! (diacritic-sensitive).

use anyhow::Result;
use sqlx::SqlitePool;

struct Migration {
    version: i64,
    name: &'static str,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                doc_id         INTEGER PRIMARY KEY AUTOINCREMENT,
                title          TEXT,
                language       TEXT,
                doc_role       TEXT NOT NULL DEFAULT 'standalone',
                resource_type  TEXT,
                meta_json      TEXT,
                source_path    TEXT,
                source_hash    TEXT,
                created_at     TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS units (
                unit_id      INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_id       INTEGER NOT NULL REFERENCES documents(doc_id),
                unit_type    TEXT NOT NULL CHECK (unit_type IN ('line', 'structure')),
                n            INTEGER NOT NULL,
                external_id  INTEGER,
                text_raw     TEXT NOT NULL,
                text_norm    TEXT NOT NULL,
                meta_json    TEXT,
                UNIQUE (doc_id, n)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_units_doc_external ON units(doc_id, external_id)",
            "CREATE INDEX IF NOT EXISTS idx_units_doc_n ON units(doc_id, n)",
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id      TEXT PRIMARY KEY,
                kind        TEXT NOT NULL,
                params_json TEXT,
                stats_json  TEXT,
                created_at  TEXT NOT NULL
            )
            "#,
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS fts_units USING fts5(
                text_norm,
                tokenize = "unicode61 remove_diacritics 0"
            )
            "#,
        ],
    },
    Migration {
        version: 2,
        name: "alignment",
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS alignment_links (
                link_id        INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id         TEXT NOT NULL,
                pivot_unit_id  INTEGER NOT NULL REFERENCES units(unit_id),
                target_unit_id INTEGER NOT NULL REFERENCES units(unit_id),
                external_id    INTEGER,
                pivot_doc_id   INTEGER NOT NULL,
                target_doc_id  INTEGER NOT NULL,
                status         TEXT CHECK (status IN ('accepted', 'rejected')),
                created_at     TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_links_pivot_unit ON alignment_links(pivot_unit_id)",
            "CREATE INDEX IF NOT EXISTS idx_links_target_unit ON alignment_links(target_unit_id)",
            "CREATE INDEX IF NOT EXISTS idx_links_doc_pair ON alignment_links(pivot_doc_id, target_doc_id)",
            "CREATE INDEX IF NOT EXISTS idx_links_external ON alignment_links(external_id)",
            "CREATE INDEX IF NOT EXISTS idx_links_status ON alignment_links(status)",
            r#"
            CREATE TABLE IF NOT EXISTS doc_relations (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_id         INTEGER NOT NULL REFERENCES documents(doc_id),
                relation_type  TEXT NOT NULL,
                target_doc_id  INTEGER NOT NULL REFERENCES documents(doc_id),
                note           TEXT,
                created_at     TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_doc_relations_doc ON doc_relations(doc_id, relation_type)",
        ],
    },
    Migration {
        version: 3,
        name: "engine_state",
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS engine_state (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        ],
    },
];

/// Apply any pending migrations and return the count applied.
///
/// Bootstraps the `schema_migrations` tracker first, then applies each
/// pending migration inside its own transaction. Safe to call on every
/// startup.
pub async fn apply_migrations(pool: &SqlitePool) -> Result<u32> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_migrations")
        .fetch_all(pool)
        .await?;

    let mut count = 0u32;
    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }

        let mut tx = pool.begin().await?;
        for stmt in migration.statements {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, datetime('now'))")
            .bind(migration.version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(version = migration.version, name = migration.name, "migration applied");
        count += 1;
    }

    Ok(count)
}

/// Highest migration version known to this build.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}
