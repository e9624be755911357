//! End-to-end import → index → query flows over a scratch database.

use std::path::{Path, PathBuf};

use sqlx::{Row, SqlitePool};
use tempfile::TempDir;

use agrafes::importers::{self, ImportMode, ImportOptions};
use agrafes::query::{run_query_page, Hit, QueryMode, QueryParams};
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

async fn import_txt(pool: &SqlitePool, path: &Path, language: &str) -> importers::ImportReport {
    let options = ImportOptions {
        language: Some(language.to_string()),
        doc_role: "standalone".to_string(),
        ..Default::default()
    };
    importers::run_import(pool, ImportMode::TxtNumberedLines, path, &options)
        .await
        .unwrap()
}

fn segment_params(q: &str) -> QueryParams {
    QueryParams {
        q: q.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn numbered_line_round_trip() {
    let (tmp, pool) = setup().await;
    let path = write_file(
        tmp.path(),
        "deux_lignes.txt",
        "[1] Bonjour le monde.\n[2] Deuxième ligne.\n",
    );

    let report = import_txt(&pool, &path, "fr").await;
    assert_eq!(report.units_total, 2);
    assert_eq!(report.units_line, 2);
    assert_eq!(report.units_structure, 0);
    assert!(report.warnings.is_empty());

    let rows = sqlx::query("SELECT n, external_id, text_raw FROM units WHERE doc_id = ? ORDER BY n")
        .bind(report.doc_id)
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get::<i64, _>("n"), 1);
    assert_eq!(rows[0].get::<Option<i64>, _>("external_id"), Some(1));
    assert_eq!(rows[0].get::<String, _>("text_raw"), "Bonjour le monde.");
    assert_eq!(rows[1].get::<i64, _>("n"), 2);
    assert_eq!(rows[1].get::<Option<i64>, _>("external_id"), Some(2));

    let indexed = indexer::build_index(&pool).await.unwrap();
    assert_eq!(indexed, 2);

    let page = run_query_page(&pool, &segment_params("Bonjour")).await.unwrap();
    assert_eq!(page.hits.len(), 1);
    assert!(!page.fts_stale);
    match &page.hits[0] {
        Hit::Segment { text, external_id, .. } => {
            assert_eq!(text, "<<Bonjour>> le monde.");
            assert_eq!(*external_id, Some(1));
        }
        other => panic!("expected segment hit, got {:?}", other),
    }
    pool.close().await;
}

#[tokio::test]
async fn structure_units_are_not_indexed() {
    let (tmp, pool) = setup().await;
    let path = write_file(
        tmp.path(),
        "mixte.txt",
        "Chapitre premier\n[1] La ligne cherchable.\nNote marginale cherchable\n",
    );

    let report = import_txt(&pool, &path, "fr").await;
    assert_eq!(report.units_total, 3);
    assert_eq!(report.units_line, 1);
    assert_eq!(report.units_structure, 2);

    indexer::build_index(&pool).await.unwrap();
    let page = run_query_page(&pool, &segment_params("cherchable")).await.unwrap();
    // Only the line unit matches; the structure units never entered FTS
    assert_eq!(page.hits.len(), 1);
    pool.close().await;
}

#[tokio::test]
async fn import_diagnostics_duplicates_holes_non_monotonic() {
    let (tmp, pool) = setup().await;
    let path = write_file(
        tmp.path(),
        "diag.txt",
        "[1] un\n[2] deux\n[2] deux encore\n[5] cinq\n[4] quatre\n",
    );

    let report = import_txt(&pool, &path, "fr").await;
    assert_eq!(report.duplicates, vec![2]);
    assert_eq!(report.holes, vec![3]);
    assert_eq!(report.non_monotonic, vec![2, 4]);
    assert_eq!(report.warnings.len(), 3);
    pool.close().await;
}

#[tokio::test]
async fn unit_ordering_is_contiguous_per_document() {
    let (tmp, pool) = setup().await;
    let path = write_file(
        tmp.path(),
        "ordre.txt",
        "Titre\n[10] dix\n\nEntre\n[20] vingt\n[30] trente\n",
    );
    let report = import_txt(&pool, &path, "fr").await;

    let ns: Vec<i64> = sqlx::query_scalar("SELECT n FROM units WHERE doc_id = ? ORDER BY n")
        .bind(report.doc_id)
        .fetch_all(&pool)
        .await
        .unwrap();
    let expected: Vec<i64> = (1..=ns.len() as i64).collect();
    assert_eq!(ns, expected, "n must cover 1..N without gaps");
    pool.close().await;
}

#[tokio::test]
async fn separator_preserved_in_raw_replaced_in_norm() {
    let (tmp, pool) = setup().await;
    let path = write_file(tmp.path(), "sep.txt", "[1] avant¤après¤fin\n");
    let report = import_txt(&pool, &path, "fr").await;

    let row = sqlx::query("SELECT text_raw, text_norm, meta_json FROM units WHERE doc_id = ?")
        .bind(report.doc_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let text_raw: String = row.get("text_raw");
    let text_norm: String = row.get("text_norm");
    let meta_json: Option<String> = row.get("meta_json");
    assert_eq!(text_raw.matches('¤').count(), 2);
    assert!(!text_norm.contains('¤'));
    let meta: serde_json::Value = serde_json::from_str(&meta_json.unwrap()).unwrap();
    assert_eq!(meta["sep_count"], serde_json::json!(2));
    pool.close().await;
}

#[tokio::test]
async fn index_identity_matches_line_units() {
    let (tmp, pool) = setup().await;
    let path = write_file(tmp.path(), "id.txt", "En-tête\n[1] alpha\n[2] beta\n");
    import_txt(&pool, &path, "fr").await;
    indexer::build_index(&pool).await.unwrap();

    let fts_rowids: Vec<i64> = sqlx::query_scalar("SELECT rowid FROM fts_units ORDER BY rowid")
        .fetch_all(&pool)
        .await
        .unwrap();
    let line_unit_ids: Vec<i64> = sqlx::query_scalar(
        "SELECT unit_id FROM units WHERE unit_type = 'line' ORDER BY unit_id",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(fts_rowids, line_unit_ids);
    pool.close().await;
}

#[tokio::test]
async fn kwic_mode_returns_windows() {
    let (tmp, pool) = setup().await;
    let path = write_file(
        tmp.path(),
        "kwic.txt",
        "[1] un deux trois aiguille quatre cinq six\n",
    );
    import_txt(&pool, &path, "fr").await;
    indexer::build_index(&pool).await.unwrap();

    let params = QueryParams {
        q: "aiguille".to_string(),
        mode: QueryMode::Kwic,
        window: 3,
        ..Default::default()
    };
    let page = run_query_page(&pool, &params).await.unwrap();
    assert_eq!(page.hits.len(), 1);
    match &page.hits[0] {
        Hit::Kwic { left, match_text, right, .. } => {
            assert_eq!(left, "un deux trois");
            assert_eq!(match_text, "aiguille");
            assert_eq!(right, "quatre cinq six");
        }
        other => panic!("expected kwic hit, got {:?}", other),
    }
    pool.close().await;
}

#[tokio::test]
async fn kwic_all_occurrences_expands_per_match() {
    let (tmp, pool) = setup().await;
    let path = write_file(
        tmp.path(),
        "multi.txt",
        "[1] needle haystack needle needle haystack\n",
    );
    import_txt(&pool, &path, "en").await;
    indexer::build_index(&pool).await.unwrap();

    let params = QueryParams {
        q: "needle".to_string(),
        mode: QueryMode::Kwic,
        window: 3,
        all_occurrences: true,
        ..Default::default()
    };
    let page = run_query_page(&pool, &params).await.unwrap();
    assert_eq!(page.hits.len(), 3, "one hit per occurrence");

    // Without the flag: one hit per unit
    let params = QueryParams {
        all_occurrences: false,
        ..params
    };
    let page = run_query_page(&pool, &params).await.unwrap();
    assert_eq!(page.hits.len(), 1);
    pool.close().await;
}

#[tokio::test]
async fn pagination_lookahead_concatenates_cleanly() {
    let (tmp, pool) = setup().await;
    let mut content = String::new();
    for i in 1..=7 {
        content.push_str(&format!("[{}] motif ligne numéro {}\n", i, i));
    }
    let path = write_file(tmp.path(), "pages.txt", &content);
    import_txt(&pool, &path, "fr").await;
    indexer::build_index(&pool).await.unwrap();

    // One big page
    let full = run_query_page(
        &pool,
        &QueryParams {
            q: "motif".to_string(),
            limit: 50,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(full.hits.len(), 7);
    assert!(!full.has_more);
    assert_eq!(full.next_offset, None);
    assert_eq!(full.total, None);

    // Walk in pages of 3, following next_offset
    let mut collected: Vec<i64> = Vec::new();
    let mut offset = 0i64;
    loop {
        let page = run_query_page(
            &pool,
            &QueryParams {
                q: "motif".to_string(),
                limit: 3,
                offset,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        for hit in &page.hits {
            if let Hit::Segment { unit_id, .. } = hit {
                collected.push(*unit_id);
            }
        }
        match page.next_offset {
            Some(next) => {
                assert!(page.has_more);
                offset = next;
            }
            None => break,
        }
    }
    let full_ids: Vec<i64> = full
        .hits
        .iter()
        .map(|hit| match hit {
            Hit::Segment { unit_id, .. } => *unit_id,
            Hit::Kwic { unit_id, .. } => *unit_id,
        })
        .collect();
    assert_eq!(collected, full_ids);
    pool.close().await;
}

#[tokio::test]
async fn malformed_fts_query_is_a_validation_error() {
    let (tmp, pool) = setup().await;
    let path = write_file(tmp.path(), "q.txt", "[1] contenu\n");
    import_txt(&pool, &path, "fr").await;
    indexer::build_index(&pool).await.unwrap();

    let err = run_query_page(&pool, &segment_params("AND AND (")).await.unwrap_err();
    assert!(matches!(err, agrafes::error::EngineError::Validation(_)), "got {:?}", err);
    pool.close().await;
}

#[tokio::test]
async fn empty_query_returns_empty_page() {
    let (_tmp, pool) = setup().await;
    let page = run_query_page(&pool, &segment_params("   ")).await.unwrap();
    assert!(page.hits.is_empty());
    assert!(!page.has_more);
    pool.close().await;
}

#[tokio::test]
async fn proximity_query_matches_within_distance() {
    let (tmp, pool) = setup().await;
    let path = write_file(
        tmp.path(),
        "near.txt",
        "[1] le chat dort près du chien\n[2] le chat dort très loin mais vraiment très loin du grand chien noir et blanc c'est certain oui\n",
    );
    import_txt(&pool, &path, "fr").await;
    indexer::build_index(&pool).await.unwrap();

    let near = agrafes::query::proximity_query(&["chat", "chien"], 4).unwrap();
    let page = run_query_page(&pool, &segment_params(&near)).await.unwrap();
    assert_eq!(page.hits.len(), 1, "only the close pair is within 4 tokens");
    pool.close().await;
}

#[tokio::test]
async fn docx_paragraphs_via_tei_importer_counterpart() {
    // TEI import resolves language and title from the document itself.
    let (tmp, pool) = setup().await;
    let path = write_file(
        tmp.path(),
        "doc.xml",
        r#"<?xml version="1.0"?>
<TEI xmlns="http://www.tei-c.org/ns/1.0">
  <teiHeader><fileDesc><titleStmt><title>Essai</title></titleStmt></fileDesc></teiHeader>
  <text xml:lang="fr"><body>
    <p xml:id="p1">Premier.</p>
    <p xml:id="p2">Second.</p>
  </body></text>
</TEI>"#,
    );
    let options = ImportOptions {
        doc_role: "standalone".to_string(),
        ..Default::default()
    };
    let report = importers::run_import(&pool, ImportMode::Tei, &path, &options)
        .await
        .unwrap();
    assert_eq!(report.units_line, 2);

    let row = sqlx::query("SELECT title, language FROM documents WHERE doc_id = ?")
        .bind(report.doc_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.get::<Option<String>, _>("title"), Some("Essai".to_string()));
    assert_eq!(row.get::<Option<String>, _>("language"), Some("fr".to_string()));
    pool.close().await;
}

#[tokio::test]
async fn missing_source_file_is_validation_error() {
    let (tmp, pool) = setup().await;
    let options = ImportOptions {
        language: Some("fr".to_string()),
        doc_role: "standalone".to_string(),
        ..Default::default()
    };
    let err = importers::run_import(
        &pool,
        ImportMode::TxtNumberedLines,
        &tmp.path().join("absent.txt"),
        &options,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, agrafes::error::EngineError::Validation(_)));
    pool.close().await;
}
