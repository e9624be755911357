//! Sidecar lifecycle, token guard, and job runtime over real HTTP.
//!
//! Each test starts an in-process sidecar on an OS-assigned port against a
//! scratch database and talks to it with a plain HTTP client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use agrafes::portfile::{self, Portfile};
use agrafes::server::{start, SidecarHandle, SidecarOptions, StartOutcome};

const TOKEN_HEADER: &str = "X-Agrafes-Token";

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

async fn start_sidecar(db_path: &Path, token_mode: &str) -> SidecarHandle {
    match start(SidecarOptions {
        db_path: db_path.to_path_buf(),
        host: "127.0.0.1".to_string(),
        port: 0,
        token_mode: token_mode.to_string(),
    })
    .await
    .unwrap()
    {
        StartOutcome::Listening(handle) => handle,
        StartOutcome::AlreadyRunning { .. } => panic!("expected a fresh listener"),
    }
}

fn url(handle: &SidecarHandle, path: &str) -> String {
    format!("http://{}:{}{}", handle.host, handle.port, path)
}

fn seed_corpus(dir: &Path) -> PathBuf {
    let path = dir.join("corpus.txt");
    std::fs::write(&path, "[1] Bonjour le monde.\n[2] Deuxième ligne.\n").unwrap();
    path
}

async fn post_json(
    client: &reqwest::Client,
    handle: &SidecarHandle,
    path: &str,
    body: Value,
    token: Option<&str>,
) -> (u16, Value) {
    let mut request = client.post(url(handle, path)).json(&body);
    if let Some(token) = token {
        request = request.header(TOKEN_HEADER, token);
    }
    let response = request.send().await.unwrap();
    let status = response.status().as_u16();
    let payload: Value = response.json().await.unwrap();
    (status, payload)
}

#[tokio::test(flavor = "multi_thread")]
async fn health_reports_self_description() {
    let tmp = TempDir::new().unwrap();
    let handle = start_sidecar(&tmp.path().join("corpus.db"), "off").await;
    let client = client();

    let payload: Value = client
        .get(url(&handle, "/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(payload["ok"], json!(true));
    assert_eq!(payload["status"], json!("ok"));
    assert_eq!(payload["token_required"], json!(false));
    assert_eq!(payload["pid"], json!(std::process::id()));
    assert!(payload["api_version"].is_string());
    assert!(payload["version"].is_string());
    assert!(payload["started_at"].is_string());

    handle.shutdown();
    handle.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn token_guard_on_write_endpoints() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("corpus.db");
    let handle = start_sidecar(&db_path, "auto").await;
    let token = handle.token.clone().expect("auto mode generates a token");
    let client = client();

    // Import the seed corpus so /index has something to count
    let source = seed_corpus(tmp.path());
    let import_body = json!({
        "mode": "txt_numbered_lines",
        "path": source.display().to_string(),
        "language": "fr",
    });

    // Write without the token: 401 with the envelope
    let (status, payload) =
        post_json(&client, &handle, "/index", json!({}), None).await;
    assert_eq!(status, 401);
    assert_eq!(payload["ok"], json!(false));
    assert_eq!(payload["error_code"], json!("UNAUTHORIZED"));

    // Wrong token is also rejected
    let (status, _) =
        post_json(&client, &handle, "/index", json!({}), Some("wrong")).await;
    assert_eq!(status, 401);

    // Read endpoints never require the token
    let response = client.get(url(&handle, "/documents")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // Correct token: import then rebuild
    let (status, payload) =
        post_json(&client, &handle, "/import", import_body, Some(&token)).await;
    assert_eq!(status, 200, "import failed: {}", payload);
    assert_eq!(payload["units_line"], json!(2));

    let (status, payload) = post_json(&client, &handle, "/index", json!({}), Some(&token)).await;
    assert_eq!(status, 200);
    assert_eq!(payload["units_indexed"], json!(2));

    // Portfile advertises the token for local collaborators
    let portfile_text = std::fs::read_to_string(&handle.portfile).unwrap();
    let portfile: Portfile = serde_json::from_str(&portfile_text).unwrap();
    assert_eq!(portfile.token.as_deref(), Some(token.as_str()));

    handle.shutdown();
    handle.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn query_round_trip_over_http() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("corpus.db");
    let handle = start_sidecar(&db_path, "off").await;
    let client = client();

    let source = seed_corpus(tmp.path());
    post_json(
        &client,
        &handle,
        "/import",
        json!({"mode": "txt_numbered_lines", "path": source.display().to_string(), "language": "fr"}),
        None,
    )
    .await;
    post_json(&client, &handle, "/index", json!({}), None).await;

    let (status, payload) =
        post_json(&client, &handle, "/query", json!({"q": "Bonjour"}), None).await;
    assert_eq!(status, 200);
    assert_eq!(payload["count"], json!(1));
    assert_eq!(payload["hits"][0]["text"], json!("<<Bonjour>> le monde."));
    assert_eq!(payload["fts_stale"], json!(false));
    assert_eq!(payload["total"], Value::Null);
    assert!(payload["run_id"].is_string());

    // Malformed FTS syntax surfaces as a 400 validation error
    let (status, payload) =
        post_json(&client, &handle, "/query", json!({"q": "AND AND ("}), None).await;
    assert_eq!(status, 400);
    assert_eq!(payload["error_code"], json!("VALIDATION_ERROR"));

    // Unknown routes produce the 404 envelope
    let (status, payload) =
        post_json(&client, &handle, "/nonexistent", json!({}), None).await;
    assert_eq!(status, 404);
    assert_eq!(payload["error_code"], json!("NOT_FOUND"));

    handle.shutdown();
    handle.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_portfile_is_replaced_on_restart() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("corpus.db");

    // A dead sidecar left its discovery file behind
    let portfile_path = portfile::portfile_path(&db_path);
    portfile::write_portfile(
        &portfile_path,
        &Portfile {
            host: "127.0.0.1".to_string(),
            port: 9,
            pid: 4_000_000_000,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            db_path: db_path.display().to_string(),
            token: None,
        },
    )
    .unwrap();

    let handle = start_sidecar(&db_path, "off").await;
    assert_ne!(handle.port, 9, "a fresh port was bound");

    // The portfile now describes the live process
    let portfile: Portfile =
        serde_json::from_str(&std::fs::read_to_string(&portfile_path).unwrap()).unwrap();
    assert_eq!(portfile.port, handle.port);
    assert_eq!(portfile.pid, std::process::id());

    let payload: Value = client()
        .get(url(&handle, "/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(payload["status"], json!("ok"));

    handle.shutdown();
    handle.wait().await;
    assert!(!portfile_path.exists(), "portfile removed on shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn second_start_reports_already_running() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("corpus.db");
    let handle = start_sidecar(&db_path, "off").await;

    let outcome = start(SidecarOptions {
        db_path: db_path.clone(),
        host: "127.0.0.1".to_string(),
        port: 0,
        token_mode: "off".to_string(),
    })
    .await
    .unwrap();
    match outcome {
        StartOutcome::AlreadyRunning { port, pid, .. } => {
            assert_eq!(port, handle.port);
            assert_eq!(pid, std::process::id());
        }
        StartOutcome::Listening(second) => {
            second.shutdown();
            second.wait().await;
            panic!("second sidecar must not bind");
        }
    }

    handle.shutdown();
    handle.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_endpoint_stops_the_server() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("corpus.db");
    let handle = start_sidecar(&db_path, "off").await;
    let client = client();

    let (status, payload) = post_json(&client, &handle, "/shutdown", json!({}), None).await;
    assert_eq!(status, 200);
    assert_eq!(payload["shutting_down"], json!(true));

    let portfile_path = handle.portfile.clone();
    handle.wait().await;
    assert!(!portfile_path.exists());
}

async fn wait_for_job(
    client: &reqwest::Client,
    handle: &SidecarHandle,
    job_id: &str,
) -> Value {
    for _ in 0..100 {
        let payload: Value = client
            .get(url(handle, &format!("/jobs/{}", job_id)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let status = payload["job"]["status"].as_str().unwrap_or_default().to_string();
        if status == "done" || status == "error" || status == "canceled" {
            return payload["job"].clone();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {} never reached a terminal state", job_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn job_runtime_runs_fifo_and_reports_progress() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("corpus.db");
    let handle = start_sidecar(&db_path, "off").await;
    let client = client();

    let source = seed_corpus(tmp.path());
    let (status, payload) = post_json(
        &client,
        &handle,
        "/jobs/enqueue",
        json!({
            "kind": "import",
            "params": {
                "mode": "txt_numbered_lines",
                "path": source.display().to_string(),
                "language": "fr",
            },
        }),
        None,
    )
    .await;
    assert_eq!(status, 202);
    assert_eq!(payload["status"], json!("accepted"));
    let import_job = payload["job"]["job_id"].as_str().unwrap().to_string();

    let (status, payload) = post_json(
        &client,
        &handle,
        "/jobs/enqueue",
        json!({"kind": "index", "params": {}}),
        None,
    )
    .await;
    assert_eq!(status, 202);
    let index_job = payload["job"]["job_id"].as_str().unwrap().to_string();

    let import_done = wait_for_job(&client, &handle, &import_job).await;
    assert_eq!(import_done["status"], json!("done"));
    assert_eq!(import_done["progress_pct"], json!(100));
    assert_eq!(import_done["result"]["units_line"], json!(2));

    // FIFO: by the time the second job finishes, the first is long done
    let index_done = wait_for_job(&client, &handle, &index_job).await;
    assert_eq!(index_done["status"], json!("done"));
    assert_eq!(index_done["result"]["units_indexed"], json!(2));

    // Listing supports status filters
    let listing: Value = client
        .get(url(&handle, "/jobs?status=done"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["total"], json!(2));

    handle.shutdown();
    handle.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_job_kind_and_params_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let handle = start_sidecar(&tmp.path().join("corpus.db"), "off").await;
    let client = client();

    let (status, payload) = post_json(
        &client,
        &handle,
        "/jobs/enqueue",
        json!({"kind": "reindex"}),
        None,
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(payload["error_code"], json!("VALIDATION_ERROR"));
    assert!(payload["error_details"]["supported_kinds"].is_array());

    let (status, payload) = post_json(
        &client,
        &handle,
        "/jobs/enqueue",
        json!({"kind": "segment", "params": {}}),
        None,
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(payload["error_code"], json!("VALIDATION_ERROR"));

    handle.shutdown();
    handle.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_is_idempotent_and_terminal() {
    let tmp = TempDir::new().unwrap();
    let handle = start_sidecar(&tmp.path().join("corpus.db"), "off").await;
    let client = client();

    let (_, payload) = post_json(
        &client,
        &handle,
        "/jobs/enqueue",
        json!({"kind": "index", "params": {}}),
        None,
    )
    .await;
    let job_id = payload["job"]["job_id"].as_str().unwrap().to_string();

    // Cancel (possibly racing completion), then cancel again: both succeed
    let (status, first) = post_json(
        &client,
        &handle,
        &format!("/jobs/{}/cancel", job_id),
        json!({}),
        None,
    )
    .await;
    assert_eq!(status, 200);
    let (status, second) = post_json(
        &client,
        &handle,
        &format!("/jobs/{}/cancel", job_id),
        json!({}),
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(first["status"], second["status"], "terminal state is sticky");

    // A canceled job never becomes done
    let terminal = wait_for_job(&client, &handle, &job_id).await;
    if first["status"] == json!("canceled") {
        assert_eq!(terminal["status"], json!("canceled"));
        assert_eq!(terminal["error"], Value::Null);
    }

    // Unknown job ids are 404
    let (status, payload) = post_json(
        &client,
        &handle,
        "/jobs/no-such-job/cancel",
        json!({}),
        None,
    )
    .await;
    assert_eq!(status, 404);
    assert_eq!(payload["error_code"], json!("NOT_FOUND"));

    handle.shutdown();
    handle.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn doc_relations_and_aligned_enrichment_over_http() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("corpus.db");
    let handle = start_sidecar(&db_path, "off").await;
    let client = client();

    let pivot_path = tmp.path().join("fr.txt");
    std::fs::write(&pivot_path, "[1] Bonjour le monde.\n").unwrap();
    let target_path = tmp.path().join("en.txt");
    std::fs::write(&target_path, "[1] Hello the world.\n").unwrap();

    let (_, payload) = post_json(
        &client,
        &handle,
        "/import",
        json!({"mode": "txt_numbered_lines", "path": pivot_path.display().to_string(), "language": "fr"}),
        None,
    )
    .await;
    let pivot = payload["doc_id"].as_i64().unwrap();
    let (_, payload) = post_json(
        &client,
        &handle,
        "/import",
        json!({"mode": "txt_numbered_lines", "path": target_path.display().to_string(), "language": "en"}),
        None,
    )
    .await;
    let target = payload["doc_id"].as_i64().unwrap();

    post_json(&client, &handle, "/index", json!({}), None).await;
    let (status, payload) = post_json(
        &client,
        &handle,
        "/align",
        json!({"pivot_doc_id": pivot, "target_doc_ids": [target]}),
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(payload["total_links_created"], json!(1));

    let (status, payload) = post_json(
        &client,
        &handle,
        "/doc_relations/set",
        json!({"doc_id": target, "relation_type": "translation_of", "target_doc_id": pivot}),
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(payload["action"], json!("created"));

    // Upsert: same key updates instead of duplicating
    let (_, payload) = post_json(
        &client,
        &handle,
        "/doc_relations/set",
        json!({"doc_id": target, "relation_type": "translation_of", "target_doc_id": pivot, "note": "v2"}),
        None,
    )
    .await;
    assert_eq!(payload["action"], json!("updated"));

    let relations: Value = client
        .get(url(&handle, &format!("/doc_relations?doc_id={}", target)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(relations["count"], json!(1));

    let (status, payload) = post_json(
        &client,
        &handle,
        "/query",
        json!({"q": "Bonjour", "include_aligned": true}),
        None,
    )
    .await;
    assert_eq!(status, 200);
    let aligned = &payload["hits"][0]["aligned"];
    assert_eq!(aligned.as_array().unwrap().len(), 1);
    assert_eq!(aligned[0]["language"], json!("en"));
    assert_eq!(aligned[0]["text"], json!("Hello the world."));

    handle.shutdown();
    handle.wait().await;
}
