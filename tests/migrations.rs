use tempfile::TempDir;

use agrafes::{db, migrate};

#[tokio::test]
async fn migrations_apply_on_empty_database() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("corpus.db");

    let pool = db::connect(&db_path).await.unwrap();
    let applied = migrate::apply_migrations(&pool).await.unwrap();
    assert!(applied >= 3, "expected all migrations to apply, got {}", applied);

    // Every expected table exists
    for table in [
        "documents",
        "units",
        "runs",
        "fts_units",
        "alignment_links",
        "doc_relations",
        "engine_state",
        "schema_migrations",
    ] {
        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = ?",
        )
        .bind(table)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(exists > 0, "table {} missing", table);
    }
    pool.close().await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("corpus.db");

    let pool = db::connect(&db_path).await.unwrap();
    let first = migrate::apply_migrations(&pool).await.unwrap();
    assert!(first > 0);

    let second = migrate::apply_migrations(&pool).await.unwrap();
    assert_eq!(second, 0, "re-running migrations must be a no-op");

    let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(versions.last().copied(), Some(migrate::latest_version()));
    // Versions are monotone and unique
    let mut sorted = versions.clone();
    sorted.dedup();
    assert_eq!(sorted, versions);
    pool.close().await;
}
