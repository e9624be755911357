//! Curation preview vs apply over a scratch database.

use std::path::{Path, PathBuf};

use sqlx::{Row, SqlitePool};
use tempfile::TempDir;

use agrafes::curation::{self, CurationRule};
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

async fn import_txt(pool: &SqlitePool, path: &Path) -> i64 {
    let options = ImportOptions {
        language: Some("fr".to_string()),
        doc_role: "standalone".to_string(),
        ..Default::default()
    };
    importers::run_import(pool, ImportMode::TxtNumberedLines, path, &options)
        .await
        .unwrap()
        .doc_id
}

fn rule(pattern: &str, replacement: &str) -> CurationRule {
    CurationRule {
        pattern: pattern.to_string(),
        replacement: replacement.to_string(),
        flags: String::new(),
        description: String::new(),
    }
}

#[tokio::test]
async fn preview_reports_without_mutating() {
    let (tmp, pool) = setup().await;
    // The import policy maps NBSP to a space in text_norm, so curate on a
    // plain marker instead to observe the rule engine itself.
    let path = write_file(tmp.path(), "doc.txt", "[1] a__b\n[2] rien ici\n");
    let doc_id = import_txt(&pool, &path).await;
    indexer::build_index(&pool).await.unwrap();

    let rules = vec![rule("__", " ")];
    let preview = curation::preview_document(&pool, doc_id, &rules, 10).await.unwrap();
    assert_eq!(preview.units_total, 2);
    assert_eq!(preview.units_changed, 1);
    assert_eq!(preview.replacements_total, 1);
    assert!(!preview.fts_stale);
    assert_eq!(preview.examples.len(), 1);
    assert_eq!(preview.examples[0].before, "a__b");
    assert_eq!(preview.examples[0].after, "a b");

    // Database untouched, index still fresh
    let text_norm: String =
        sqlx::query_scalar("SELECT text_norm FROM units WHERE doc_id = ? AND n = 1")
            .bind(doc_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(text_norm, "a__b");
    assert!(!indexer::is_stale(&pool).await.unwrap());
    pool.close().await;
}

#[tokio::test]
async fn apply_rewrites_norm_keeps_raw_and_flags_stale() {
    let (tmp, pool) = setup().await;
    let path = write_file(tmp.path(), "doc.txt", "[1] a__b\n");
    let doc_id = import_txt(&pool, &path).await;
    indexer::build_index(&pool).await.unwrap();

    let reports = curation::curate(&pool, Some(doc_id), &[rule("__", " ")])
        .await
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].units_modified, 1);
    assert_eq!(reports[0].replacements_total, 1);

    let row = sqlx::query("SELECT text_raw, text_norm FROM units WHERE doc_id = ?")
        .bind(doc_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("text_raw"), "a__b");
    assert_eq!(row.get::<String, _>("text_norm"), "a b");
    assert!(indexer::is_stale(&pool).await.unwrap());

    // Rebuild clears the flag and queries see the curated text
    indexer::build_index(&pool).await.unwrap();
    assert!(!indexer::is_stale(&pool).await.unwrap());
    pool.close().await;
}

#[tokio::test]
async fn empty_rule_set_is_a_noop() {
    let (tmp, pool) = setup().await;
    let path = write_file(tmp.path(), "doc.txt", "[1] inchangé\n");
    let doc_id = import_txt(&pool, &path).await;
    indexer::build_index(&pool).await.unwrap();

    let reports = curation::curate(&pool, Some(doc_id), &[]).await.unwrap();
    assert_eq!(reports[0].units_modified, 0);
    assert!(!indexer::is_stale(&pool).await.unwrap(), "no-op must not flag the index");
    pool.close().await;
}

#[tokio::test]
async fn all_documents_scope_curates_each() {
    let (tmp, pool) = setup().await;
    let first = write_file(tmp.path(), "a.txt", "[1] teh mot\n");
    let second = write_file(tmp.path(), "b.txt", "[1] teh autre\n");
    let doc_a = import_txt(&pool, &first).await;
    let doc_b = import_txt(&pool, &second).await;

    let reports = curation::curate(&pool, None, &[rule(r"\bteh\b", "the")])
        .await
        .unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.units_modified == 1));

    for doc_id in [doc_a, doc_b] {
        let text_norm: String =
            sqlx::query_scalar("SELECT text_norm FROM units WHERE doc_id = ?")
                .bind(doc_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(text_norm.starts_with("the "));
    }
    pool.close().await;
}

#[tokio::test]
async fn invalid_pattern_fails_before_touching_anything() {
    let (tmp, pool) = setup().await;
    let path = write_file(tmp.path(), "doc.txt", "[1] contenu\n");
    let doc_id = import_txt(&pool, &path).await;

    let err = curation::curate(&pool, Some(doc_id), &[rule("(oops", "x")])
        .await
        .unwrap_err();
    assert!(matches!(err, agrafes::error::EngineError::Validation(_)));

    let err = curation::preview_document(&pool, doc_id, &[rule("(oops", "x")], 10)
        .await
        .unwrap_err();
    assert!(matches!(err, agrafes::error::EngineError::Validation(_)));
    pool.close().await;
}

#[tokio::test]
async fn nbsp_rule_on_legacy_normalized_text() {
    // A corpus curated before the space-mapping policy can still hold
    // NBSP in text_norm; the rule engine must reach it.
    let (tmp, pool) = setup().await;
    let path = write_file(tmp.path(), "doc.txt", "[1] placeholder\n");
    let doc_id = import_txt(&pool, &path).await;
    sqlx::query("UPDATE units SET text_raw = ?, text_norm = ? WHERE doc_id = ?")
        .bind("a\u{00A0}b")
        .bind("a\u{00A0}b")
        .bind(doc_id)
        .execute(&pool)
        .await
        .unwrap();
    indexer::build_index(&pool).await.unwrap();

    let rules = vec![rule("\u{00A0}", " ")];
    let preview = curation::preview_document(&pool, doc_id, &rules, 10).await.unwrap();
    assert_eq!(preview.units_changed, 1);
    assert_eq!(preview.replacements_total, 1);
    assert!(!preview.fts_stale);

    let reports = curation::curate(&pool, Some(doc_id), &rules).await.unwrap();
    assert_eq!(reports[0].units_modified, 1);
    assert_eq!(reports[0].replacements_total, 1);

    let row = sqlx::query("SELECT text_raw, text_norm FROM units WHERE doc_id = ?")
        .bind(doc_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("text_norm"), "a b");
    assert_eq!(row.get::<String, _>("text_raw"), "a\u{00A0}b");
    assert!(indexer::is_stale(&pool).await.unwrap());
    pool.close().await;
}

#[tokio::test]
async fn rules_matched_lists_firing_descriptions() {
    let (tmp, pool) = setup().await;
    let path = write_file(tmp.path(), "doc.txt", "[1] un chat noir\n");
    let doc_id = import_txt(&pool, &path).await;

    let rules = vec![
        CurationRule {
            pattern: "chat".to_string(),
            replacement: "chien".to_string(),
            flags: String::new(),
            description: "chat vers chien".to_string(),
        },
        CurationRule {
            pattern: "zèbre".to_string(),
            replacement: "girafe".to_string(),
            flags: String::new(),
            description: "jamais utilisé".to_string(),
        },
    ];
    let reports = curation::curate(&pool, Some(doc_id), &rules).await.unwrap();
    assert_eq!(reports[0].rules_matched, vec!["chat vers chien".to_string()]);
    pool.close().await;
}
