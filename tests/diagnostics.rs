//! Database diagnostics over a scratch database.

use std::path::{Path, PathBuf};

use sqlx::SqlitePool;
use tempfile::TempDir;

use agrafes::aligner::{run_alignment, AlignParams, AlignStrategy};
use agrafes::diagnostics::collect_diagnostics;
use agrafes::importers::{self, ImportMode, ImportOptions};
use agrafes::{db, indexer, migrate};

async fn setup() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect(&tmp.path().join("corpus.db")).await.unwrap();
    migrate::apply_migrations(&pool).await.unwrap();
    (tmp, pool)
}

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

async fn import_txt(pool: &SqlitePool, path: &Path, language: &str) -> i64 {
    let options = ImportOptions {
        language: Some(language.to_string()),
        doc_role: "standalone".to_string(),
        ..Default::default()
    };
    importers::run_import(pool, ImportMode::TxtNumberedLines, path, &options)
        .await
        .unwrap()
        .doc_id
}

#[tokio::test]
async fn fresh_database_is_ok() {
    let (_tmp, pool) = setup().await;

    let report = collect_diagnostics(&pool).await.unwrap();
    assert_eq!(report.status, "ok");
    assert!(report.issues.is_empty());
    assert!(report.integrity.ok);
    assert_eq!(report.counts.documents, 0);
    assert!(!report.fts.stale);
    assert_eq!(report.schema.current_version, Some(migrate::latest_version()));
    pool.close().await;
}

#[tokio::test]
async fn detects_fts_stale_before_index() {
    let (tmp, pool) = setup().await;
    let path = write_file(tmp.path(), "doc.txt", "[1] Bonjour le monde.\n[2] Salut à tous.\n");
    import_txt(&pool, &path, "fr").await;

    let report = collect_diagnostics(&pool).await.unwrap();
    assert_eq!(report.status, "warning");
    assert!(report.fts.stale);
    assert!(report.fts.missing_line_units > 0);
    assert!(report.issues.iter().any(|i| i.contains("FTS")));
    pool.close().await;
}

#[tokio::test]
async fn consistent_after_index_rebuild() {
    let (tmp, pool) = setup().await;
    let path = write_file(tmp.path(), "doc.txt", "[1] Bonjour le monde.\n[2] Salut à tous.\n");
    import_txt(&pool, &path, "fr").await;
    indexer::build_index(&pool).await.unwrap();

    let report = collect_diagnostics(&pool).await.unwrap();
    assert_eq!(report.status, "ok");
    assert!(!report.fts.stale);
    assert_eq!(report.fts.row_delta_vs_line_units, 0);
    assert_eq!(report.counts.line_units, 2);
    assert_eq!(report.counts.fts_rows, 2);
    pool.close().await;
}

#[tokio::test]
async fn detects_orphan_fts_rows() {
    let (tmp, pool) = setup().await;
    let path = write_file(tmp.path(), "doc.txt", "[1] Bonjour le monde.\n");
    import_txt(&pool, &path, "fr").await;
    indexer::build_index(&pool).await.unwrap();

    sqlx::query("INSERT INTO fts_units(rowid, text_norm) VALUES (?, ?)")
        .bind(99_999)
        .bind("ghost row")
        .execute(&pool)
        .await
        .unwrap();

    let report = collect_diagnostics(&pool).await.unwrap();
    assert_eq!(report.status, "warning");
    assert!(report.fts.orphan_rows >= 1);
    assert!(report.fts.stale);
    pool.close().await;
}

#[tokio::test]
async fn detects_alignment_doc_mismatch() {
    let (tmp, pool) = setup().await;
    let fr = write_file(tmp.path(), "fr.txt", "[1] Bonjour.\n");
    let en = write_file(tmp.path(), "en.txt", "[1] Hello.\n");
    let pivot = import_txt(&pool, &fr, "fr").await;
    let target = import_txt(&pool, &en, "en").await;
    indexer::build_index(&pool).await.unwrap();
    run_alignment(
        &pool,
        &AlignParams {
            pivot_doc_id: pivot,
            target_doc_ids: vec![target],
            strategy: AlignStrategy::ExternalId,
            sim_threshold: 0.8,
            debug_align: false,
            run_id: None,
        },
    )
    .await
    .unwrap();

    // Corrupt the denormalized doc_id while keeping valid unit FKs
    sqlx::query("UPDATE alignment_links SET pivot_doc_id = ?")
        .bind(999_999)
        .execute(&pool)
        .await
        .unwrap();

    let report = collect_diagnostics(&pool).await.unwrap();
    assert_eq!(report.status, "warning");
    assert!(report.alignment.pivot_doc_mismatch >= 1);
    assert!(report
        .issues
        .iter()
        .any(|i| i.contains("doc_id mismatch")));
    pool.close().await;
}

#[tokio::test]
async fn reports_documents_without_line_units() {
    let (tmp, pool) = setup().await;
    // A file of only structure lines yields a document with zero line units
    let path = write_file(tmp.path(), "doc.txt", "Chapitre premier\nNote liminaire\n");
    import_txt(&pool, &path, "fr").await;
    indexer::build_index(&pool).await.unwrap();

    let report = collect_diagnostics(&pool).await.unwrap();
    assert_eq!(report.status, "warning");
    assert_eq!(report.metadata.docs_without_line_units, 1);
    assert!(report
        .issues
        .iter()
        .any(|i| i.contains("no line units")));
    pool.close().await;
}
