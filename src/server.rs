//! Loopback HTTP sidecar.
//!
//! Exposes the engine to external collaborators over `127.0.0.1` JSON
//! HTTP. One process, one database; mutating requests serialize behind a
//! single writer lock while reads proceed concurrently under WAL.
//!
//! # Endpoints
//!
//! | Method | Path | Auth | Purpose |
//! |--------|------|------|---------|
//! | `GET`  | `/health` | none | Liveness + self-description |
//! | `GET`  | `/openapi.json` | none | Machine-readable contract |
//! | `GET`  | `/documents` | none | Documents with line-unit counts |
//! | `GET`  | `/doc_relations` | none | Typed relations of one document |
//! | `POST` | `/query` | none | Segment/KWIC search |
//! | `POST` | `/import` | token | Ingest a source file |
//! | `POST` | `/index` | token | Rebuild the FTS index |
//! | `POST` | `/curate` | token | Apply curation rules |
//! | `POST` | `/curate/preview` | none | Dry-run curation |
//! | `POST` | `/segment` | token | Resegment a document |
//! | `POST` | `/align` | token | Run alignment |
//! | `POST` | `/align/audit` | none | Paginated link listing |
//! | `POST` | `/align/quality` | none | Coverage/orphan/collision metrics |
//! | `POST` | `/align/link/*` | token | Link status/delete/retarget |
//! | `POST` | `/documents/update`, `/documents/bulk_update` | token | Metadata edits |
//! | `POST` | `/doc_relations/set`, `/doc_relations/delete` | token | Relation edits |
//! | `POST` | `/validate-meta` | token | Metadata validation report |
//! | `POST` | `/export/*` | token | TEI / CSV / run-report exports |
//! | `GET`  | `/jobs`, `/jobs/{id}` | none | Job listing and status |
//! | `POST` | `/jobs/enqueue`, `/jobs/{id}/cancel` | token | Job control |
//! | `POST` | `/shutdown` | token | Graceful shutdown |
//!
//! # Lifecycle
//!
//! Startup migrates the schema, then runs the portfile two-gate check
//! (recorded PID alive *and* `/health` answering): a live sidecar short-
//! circuits to `already_running`; a stale portfile is removed. The
//! listener binds (`port=0` asks the OS for a free port), a fresh portfile
//! is written, and exactly one JSON object describing the endpoint goes to
//! stdout. Shutdown (via `POST /shutdown` or a termination signal) closes
//! the listener, closes the database, and deletes the portfile.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as UrlPath, Query, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::aligner::{self, AlignParams};
use crate::audit;
use crate::contract::{self, TOKEN_HEADER};
use crate::curation::{self, CurationRule};
use crate::db;
use crate::error::EngineError;
use crate::exporters;
use crate::importers::{self, ImportOptions};
use crate::indexer;
use crate::jobs::{self, JobKind, JobManager, JobQueue, JobStatus, ProgressHandle};
use crate::metadata;
use crate::migrate;
use crate::models::{DocRelation, LinkStatus, RELATION_TYPES};
use crate::portfile::{self, Portfile, SidecarState};
use crate::query::{self, QueryParams};
use crate::runs::{self, RunLog};
use crate::segmenter;

/// Sidecar startup parameters.
#[derive(Debug, Clone)]
pub struct SidecarOptions {
    pub db_path: PathBuf,
    pub host: String,
    /// `0` asks the OS for a free port.
    pub port: u16,
    /// `off`, `auto`, or an explicit token value.
    pub token_mode: String,
}

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pool: SqlitePool,
    /// Mutating requests hold this across their whole execution; reads
    /// rely on WAL shared-reader semantics.
    write_lock: Arc<tokio::sync::Mutex<()>>,
    jobs: JobManager,
    token: Option<String>,
    db_path: PathBuf,
    started_at: String,
    pid: u32,
    host: String,
    port: u16,
    portfile: PathBuf,
    shutdown: watch::Sender<bool>,
}

/// Outcome of [`start`].
pub enum StartOutcome {
    /// A live sidecar already serves this database.
    AlreadyRunning {
        host: String,
        port: u16,
        pid: u32,
        portfile: PathBuf,
    },
    Listening(SidecarHandle),
}

/// Handle on a running sidecar.
pub struct SidecarHandle {
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub portfile: PathBuf,
    pub token: Option<String>,
    shutdown: watch::Sender<bool>,
    serve_task: tokio::task::JoinHandle<()>,
}

impl SidecarHandle {
    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Block until the server exits (after `shutdown()`, `POST /shutdown`,
    /// or a termination signal).
    pub async fn wait(self) {
        let _ = self.serve_task.await;
    }
}

/// Start the sidecar: migrate, run the portfile two-gate check, bind,
/// write the discovery file, and serve in a background task.
pub async fn start(options: SidecarOptions) -> anyhow::Result<StartOutcome> {
    let pool = db::connect(&options.db_path).await?;
    migrate::apply_migrations(&pool).await?;

    let portfile_path = portfile::portfile_path(&options.db_path);
    match portfile::inspect_state(&options.db_path, Duration::from_millis(600)).await {
        SidecarState::Running { host, port, pid, .. } => {
            pool.close().await;
            return Ok(StartOutcome::AlreadyRunning {
                host,
                port,
                pid,
                portfile: portfile_path,
            });
        }
        SidecarState::Stale { reason, .. } => {
            tracing::info!(portfile = %portfile_path.display(), reason, "removing stale sidecar portfile");
            portfile::remove_portfile(&portfile_path);
        }
        SidecarState::Missing { .. } => {}
    }

    let token = contract::resolve_token_mode(&options.token_mode)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let listener =
        tokio::net::TcpListener::bind((options.host.as_str(), options.port)).await?;
    let actual_port = listener.local_addr()?.port();
    let started_at = runs::utcnow_iso();
    let pid = std::process::id();

    let (jobs_manager, job_queue) = JobManager::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = AppState {
        pool: pool.clone(),
        write_lock: Arc::new(tokio::sync::Mutex::new(())),
        jobs: jobs_manager,
        token: token.clone(),
        db_path: options.db_path.clone(),
        started_at,
        pid,
        host: options.host.clone(),
        port: actual_port,
        portfile: portfile_path.clone(),
        shutdown: shutdown_tx.clone(),
    };

    portfile::write_portfile(
        &portfile_path,
        &Portfile {
            host: options.host.clone(),
            port: actual_port,
            pid,
            started_at: state.started_at.clone(),
            db_path: options.db_path.display().to_string(),
            token: token.clone(),
        },
    )?;

    tokio::spawn(job_worker(state.clone(), job_queue));

    let app = build_router(state.clone());
    let mut signal_rx = shutdown_rx.clone();
    let cleanup_portfile = portfile_path.clone();
    let serve_task = tokio::spawn(async move {
        let serve_result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = signal_rx.changed() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            })
            .await;
        if let Err(e) = serve_result {
            tracing::error!(error = %e, "sidecar serve loop failed");
        }
        pool.close().await;
        portfile::remove_portfile(&cleanup_portfile);
        tracing::info!("sidecar stopped");
    });

    tracing::info!(host = %options.host, port = actual_port, db = %options.db_path.display(), "sidecar listening");

    Ok(StartOutcome::Listening(SidecarHandle {
        host: options.host,
        port: actual_port,
        pid,
        portfile: portfile_path,
        token,
        shutdown: shutdown_tx,
        serve_task,
    }))
}

/// Assemble the full route set. Write routes sit behind the token guard.
fn build_router(state: AppState) -> Router {
    let open_routes = Router::new()
        .route("/health", get(handle_health))
        .route("/openapi.json", get(handle_openapi))
        .route("/documents", get(handle_documents))
        .route("/doc_relations", get(handle_doc_relations_get))
        .route("/query", post(handle_query))
        .route("/curate/preview", post(handle_curate_preview))
        .route("/align/audit", post(handle_align_audit))
        .route("/align/quality", post(handle_align_quality))
        .route("/jobs", get(handle_jobs_list))
        .route("/jobs/:id", get(handle_job_get));

    let write_routes = Router::new()
        .route("/import", post(handle_import))
        .route("/index", post(handle_index))
        .route("/curate", post(handle_curate))
        .route("/segment", post(handle_segment))
        .route("/align", post(handle_align))
        .route("/align/link/update_status", post(handle_link_update_status))
        .route("/align/link/delete", post(handle_link_delete))
        .route("/align/link/retarget", post(handle_link_retarget))
        .route("/documents/update", post(handle_documents_update))
        .route("/documents/bulk_update", post(handle_documents_bulk_update))
        .route("/doc_relations/set", post(handle_doc_relations_set))
        .route("/doc_relations/delete", post(handle_doc_relations_delete))
        .route("/validate-meta", post(handle_validate_meta))
        .route("/export/tei", post(handle_export_tei))
        .route("/export/align_csv", post(handle_export_align_csv))
        .route("/export/run_report", post(handle_export_run_report))
        .route("/jobs/enqueue", post(handle_jobs_enqueue))
        .route("/jobs/:id/cancel", post(handle_job_cancel))
        .route("/shutdown", post(handle_shutdown))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .merge(open_routes)
        .merge(write_routes)
        .fallback(handle_unknown_route)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============ Error conversion ============

/// Handler error that renders as the frozen JSON envelope.
struct ApiError {
    error: EngineError,
    details: Option<Value>,
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        ApiError { error, details: None }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(contract::error_payload(&self.error, self.details))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn ok(data: Value) -> ApiResult {
    Ok(Json(contract::success_payload(data, "ok")))
}

/// Parse a JSON request body. An empty body reads as `{}`; a non-JSON
/// content type or malformed JSON is a 400.
fn parse_body<T: serde::de::DeserializeOwned>(
    headers: &HeaderMap,
    body: &str,
) -> Result<T, ApiError> {
    if !body.trim().is_empty() {
        let content_type = headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.contains("json") {
            return Err(EngineError::bad_request(
                "Content-Type: application/json is required for request bodies",
            )
            .into());
        }
    }
    let text = if body.trim().is_empty() { "{}" } else { body };
    serde_json::from_str(text)
        .map_err(|e| EngineError::bad_request(format!("Invalid JSON body: {}", e)).into())
}

// ============ Token guard ============

/// Require `X-Agrafes-Token` on write endpoints when a token is set.
async fn require_token(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if let Some(ref expected) = state.token {
        let provided = request
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return ApiError::from(EngineError::Unauthorized).into_response();
        }
    }
    next.run(request).await
}

async fn handle_unknown_route(request: axum::extract::Request) -> ApiError {
    EngineError::not_found(format!("Unknown route: {}", request.uri().path())).into()
}

// ============ Read endpoints ============

async fn handle_health(State(state): State<AppState>) -> ApiResult {
    ok(json!({
        "pid": state.pid,
        "started_at": state.started_at,
        "host": state.host,
        "port": state.port,
        "portfile": state.portfile.display().to_string(),
        "token_required": state.token.is_some(),
    }))
}

async fn handle_openapi() -> Json<Value> {
    Json(contract::openapi_spec())
}

async fn handle_documents(State(state): State<AppState>) -> ApiResult {
    let rows = sqlx::query(
        r#"
        SELECT d.doc_id, d.title, d.language, d.doc_role, d.resource_type,
               COUNT(u.unit_id) AS unit_count
        FROM documents d
        LEFT JOIN units u ON u.doc_id = d.doc_id AND u.unit_type = 'line'
        GROUP BY d.doc_id
        ORDER BY d.doc_id
        "#,
    )
    .fetch_all(&state.pool)
    .await
    .map_err(EngineError::from)?;

    let documents: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "doc_id": row.get::<i64, _>("doc_id"),
                "title": row.get::<Option<String>, _>("title"),
                "language": row.get::<Option<String>, _>("language"),
                "doc_role": row.get::<String, _>("doc_role"),
                "resource_type": row.get::<Option<String>, _>("resource_type"),
                "unit_count": row.get::<i64, _>("unit_count"),
            })
        })
        .collect();
    let count = documents.len();
    ok(json!({ "documents": documents, "count": count }))
}

#[derive(Deserialize)]
struct DocRelationsQuery {
    doc_id: Option<i64>,
}

async fn handle_doc_relations_get(
    State(state): State<AppState>,
    Query(params): Query<DocRelationsQuery>,
) -> ApiResult {
    let doc_id = params
        .doc_id
        .ok_or_else(|| EngineError::bad_request("doc_id query param is required"))?;
    let rows = sqlx::query(
        "SELECT id, doc_id, relation_type, target_doc_id, note, created_at
         FROM doc_relations WHERE doc_id = ? ORDER BY id",
    )
    .bind(doc_id)
    .fetch_all(&state.pool)
    .await
    .map_err(EngineError::from)?;

    let relations: Vec<DocRelation> = rows
        .iter()
        .map(|row| DocRelation {
            id: row.get("id"),
            doc_id: row.get("doc_id"),
            relation_type: row.get("relation_type"),
            target_doc_id: row.get("target_doc_id"),
            note: row.get("note"),
            created_at: row.get("created_at"),
        })
        .collect();
    let count = relations.len();
    ok(json!({ "doc_id": doc_id, "relations": relations, "count": count }))
}

async fn handle_query(State(state): State<AppState>, headers: HeaderMap, body: String) -> ApiResult {
    let params: QueryParams = parse_body(&headers, &body)?;
    params.validate()?;

    let run_params = json!({
        "q": params.q,
        "mode": params.mode,
        "window": params.window,
        "language": params.language,
        "doc_id": params.doc_id,
        "resource_type": params.resource_type,
        "doc_role": params.doc_role,
        "include_aligned": params.include_aligned,
        "aligned_limit": params.aligned_limit,
        "all_occurrences": params.all_occurrences,
        "limit": params.limit,
        "offset": params.offset,
    });
    let run_id = runs::create_run(&state.pool, crate::models::RunKind::Query, &run_params, None)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;

    let page = query::run_query_page(&state.pool, &params).await?;

    runs::update_run_stats(
        &state.pool,
        &run_id,
        &json!({
            "count": page.hits.len(),
            "offset": page.offset,
            "limit": page.limit,
            "has_more": page.has_more,
            "next_offset": page.next_offset,
        }),
    )
    .await
    .map_err(|e| EngineError::internal(e.to_string()))?;

    ok(json!({
        "run_id": run_id,
        "count": page.hits.len(),
        "hits": page.hits,
        "limit": page.limit,
        "offset": page.offset,
        "next_offset": page.next_offset,
        "has_more": page.has_more,
        "total": page.total,
        "fts_stale": page.fts_stale,
    }))
}

#[derive(Deserialize)]
struct CuratePreviewBody {
    doc_id: Option<i64>,
    #[serde(default)]
    rules: Vec<CurationRule>,
    #[serde(default = "default_limit_examples")]
    limit_examples: usize,
}

fn default_limit_examples() -> usize {
    10
}

async fn handle_curate_preview(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult {
    let body: CuratePreviewBody = parse_body(&headers, &body)?;
    let doc_id = body
        .doc_id
        .ok_or_else(|| EngineError::bad_request("doc_id is required"))?;
    let limit_examples = body.limit_examples.clamp(1, 50);
    let preview = curation::preview_document(&state.pool, doc_id, &body.rules, limit_examples).await?;
    ok(serde_json::to_value(preview).map_err(EngineError::from)?)
}

async fn handle_align_audit(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult {
    let params: audit::AuditParams = parse_body(&headers, &body)?;
    let page = audit::list_links(&state.pool, &params).await?;
    let mut payload = serde_json::to_value(&page).map_err(EngineError::from)?;
    if let Value::Object(ref mut map) = payload {
        map.insert(
            "stats".to_string(),
            json!({"links_returned": page.links.len()}),
        );
    }
    ok(payload)
}

#[derive(Deserialize)]
struct AlignQualityBody {
    pivot_doc_id: Option<i64>,
    target_doc_id: Option<i64>,
    #[serde(default)]
    run_id: Option<String>,
}

async fn handle_align_quality(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult {
    let body: AlignQualityBody = parse_body(&headers, &body)?;
    let (pivot_doc_id, target_doc_id) = match (body.pivot_doc_id, body.target_doc_id) {
        (Some(p), Some(t)) => (p, t),
        _ => {
            return Err(
                EngineError::bad_request("pivot_doc_id and target_doc_id are required").into(),
            )
        }
    };
    let report =
        audit::quality(&state.pool, pivot_doc_id, target_doc_id, body.run_id.as_deref()).await?;
    ok(serde_json::to_value(report).map_err(EngineError::from)?)
}

// ============ Write endpoints ============

#[derive(Deserialize)]
struct ImportBody {
    mode: Option<importers::ImportMode>,
    path: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    doc_role: Option<String>,
    #[serde(default)]
    resource_type: Option<String>,
    #[serde(default)]
    tei_unit: Option<String>,
}

async fn handle_import(State(state): State<AppState>, headers: HeaderMap, body: String) -> ApiResult {
    let body: ImportBody = parse_body(&headers, &body)?;
    let mode = body
        .mode
        .ok_or_else(|| EngineError::validation("mode is required"))?;
    let path = body
        .path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| EngineError::validation("path is required"))?;
    if mode != importers::ImportMode::Tei
        && body.language.as_deref().map_or(true, |l| l.trim().is_empty())
    {
        return Err(EngineError::validation("language is required for non-TEI import modes").into());
    }

    let options = ImportOptions {
        language: body.language.clone(),
        title: body.title.clone(),
        doc_role: body.doc_role.clone().unwrap_or_else(|| "standalone".to_string()),
        resource_type: body.resource_type.clone(),
        tei_unit: body.tei_unit.clone(),
    };

    let _guard = state.write_lock.lock().await;
    let run_params = json!({
        "mode": mode.as_str(),
        "path": path,
        "language": options.language,
        "title": options.title,
        "doc_role": options.doc_role,
        "resource_type": options.resource_type,
        "tei_unit": options.tei_unit,
    });
    let run_id = runs::create_run(&state.pool, crate::models::RunKind::Import, &run_params, None)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;
    if let Ok(log) = RunLog::open(&state.db_path, &run_id) {
        log.info(&format!("Starting import of {} (mode={})", path, mode.as_str()));
    }

    let report = importers::run_import(&state.pool, mode, Path::new(&path), &options).await?;
    indexer::mark_stale(&state.pool)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;

    let stats = serde_json::to_value(&report).map_err(EngineError::from)?;
    runs::update_run_stats(&state.pool, &run_id, &stats)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;
    if let Ok(log) = RunLog::open(&state.db_path, &run_id) {
        log.info(&format!(
            "Import complete: {} units ({} line, {} structure)",
            report.units_total, report.units_line, report.units_structure
        ));
    }

    let mut payload = json!({ "run_id": run_id, "mode": mode.as_str(), "fts_stale": true });
    merge_object(&mut payload, stats);
    ok(payload)
}

async fn handle_index(State(state): State<AppState>) -> ApiResult {
    let _guard = state.write_lock.lock().await;
    let run_id = runs::create_run(&state.pool, crate::models::RunKind::Index, &json!({}), None)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;
    let units_indexed = indexer::build_index(&state.pool)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;
    runs::update_run_stats(&state.pool, &run_id, &json!({"units_indexed": units_indexed}))
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;
    ok(json!({ "run_id": run_id, "units_indexed": units_indexed }))
}

#[derive(Deserialize)]
struct CurateBody {
    #[serde(default)]
    rules: Vec<CurationRule>,
    #[serde(default)]
    doc_id: Option<i64>,
}

async fn handle_curate(State(state): State<AppState>, headers: HeaderMap, body: String) -> ApiResult {
    let body: CurateBody = parse_body(&headers, &body)?;

    let _guard = state.write_lock.lock().await;
    let run_params = json!({"doc_id": body.doc_id, "rules": body.rules.len()});
    let run_id = runs::create_run(&state.pool, crate::models::RunKind::Curate, &run_params, None)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;

    let reports = curation::curate(&state.pool, body.doc_id, &body.rules).await?;
    let units_modified: usize = reports.iter().map(|r| r.units_modified).sum();
    let replacements_total: usize = reports.iter().map(|r| r.replacements_total).sum();
    let fts_stale = units_modified > 0;

    let stats = json!({
        "docs_curated": reports.len(),
        "units_modified": units_modified,
        "replacements_total": replacements_total,
        "fts_stale": fts_stale,
    });
    runs::update_run_stats(&state.pool, &run_id, &stats)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;

    ok(json!({
        "run_id": run_id,
        "docs_curated": reports.len(),
        "units_modified": units_modified,
        "replacements_total": replacements_total,
        "fts_stale": fts_stale,
        "results": reports,
    }))
}

#[derive(Deserialize)]
struct SegmentBody {
    doc_id: Option<i64>,
    #[serde(default)]
    lang: Option<String>,
}

async fn handle_segment(State(state): State<AppState>, headers: HeaderMap, body: String) -> ApiResult {
    let body: SegmentBody = parse_body(&headers, &body)?;
    let doc_id = body
        .doc_id
        .ok_or_else(|| EngineError::bad_request("doc_id is required"))?;
    let lang = body.lang.unwrap_or_else(|| "und".to_string());

    let _guard = state.write_lock.lock().await;
    let run_id = runs::create_run(
        &state.pool,
        crate::models::RunKind::Segment,
        &json!({"doc_id": doc_id, "lang": lang}),
        None,
    )
    .await
    .map_err(|e| EngineError::internal(e.to_string()))?;

    let report = segmenter::resegment_document(&state.pool, doc_id, &lang).await?;
    let stats = serde_json::to_value(&report).map_err(EngineError::from)?;
    runs::update_run_stats(&state.pool, &run_id, &stats)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;

    let mut payload = json!({ "run_id": run_id, "fts_stale": true });
    merge_object(&mut payload, stats);
    ok(payload)
}

async fn handle_align(State(state): State<AppState>, headers: HeaderMap, body: String) -> ApiResult {
    let params: AlignParams = parse_body(&headers, &body)?;
    params.validate()?;

    let _guard = state.write_lock.lock().await;
    let outcome = aligner::run_alignment(&state.pool, &params).await?;
    if let Ok(log) = RunLog::open(&state.db_path, &outcome.run_id) {
        log.info(&format!(
            "Alignment strategy={} pivot={} targets={} links={}",
            outcome.strategy,
            outcome.pivot_doc_id,
            params.target_doc_ids.len(),
            outcome.total_links_created
        ));
    }
    ok(serde_json::to_value(outcome).map_err(EngineError::from)?)
}

async fn handle_link_update_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult {
    let body: Value = parse_body(&headers, &body)?;
    let link_id = body
        .get("link_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| EngineError::bad_request("link_id is required"))?;
    let status_field = body
        .get("status")
        .ok_or_else(|| EngineError::bad_request("status is required (accepted, rejected, or null)"))?;
    let status: Option<LinkStatus> = match status_field {
        Value::Null => None,
        Value::String(_) => Some(
            serde_json::from_value(status_field.clone()).map_err(|_| {
                EngineError::validation("status must be 'accepted', 'rejected', or null")
            })?,
        ),
        _ => {
            return Err(
                EngineError::validation("status must be 'accepted', 'rejected', or null").into(),
            )
        }
    };
    let status = status.map(|s| s.as_str());

    let _guard = state.write_lock.lock().await;
    let link = audit::update_link_status(&state.pool, link_id, status).await?;
    ok(json!({ "link_id": link_id, "status": status, "updated": 1, "link": link }))
}

async fn handle_link_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult {
    let body: Value = parse_body(&headers, &body)?;
    let link_id = body
        .get("link_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| EngineError::bad_request("link_id is required"))?;

    let _guard = state.write_lock.lock().await;
    let deleted = audit::delete_link(&state.pool, link_id).await?;
    ok(json!({ "link_id": link_id, "deleted": deleted }))
}

async fn handle_link_retarget(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult {
    let body: Value = parse_body(&headers, &body)?;
    let link_id = body
        .get("link_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| EngineError::bad_request("link_id is required"))?;
    let new_target_unit_id = body
        .get("new_target_unit_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| EngineError::bad_request("new_target_unit_id is required"))?;

    let _guard = state.write_lock.lock().await;
    audit::retarget_link(&state.pool, link_id, new_target_unit_id).await?;
    ok(json!({ "link_id": link_id, "new_target_unit_id": new_target_unit_id, "updated": 1 }))
}

const DOC_UPDATABLE_FIELDS: &[&str] = &["title", "language", "doc_role", "resource_type"];

async fn apply_document_update(
    pool: &SqlitePool,
    doc_id: i64,
    fields: &serde_json::Map<String, Value>,
) -> Result<u64, EngineError> {
    let updates: Vec<(&str, String)> = DOC_UPDATABLE_FIELDS
        .iter()
        .filter_map(|&field| {
            fields.get(field).and_then(Value::as_str).map(|v| (field, v.to_string()))
        })
        .collect();
    if updates.is_empty() {
        return Ok(0);
    }

    let set_clause: Vec<String> = updates.iter().map(|(field, _)| format!("{} = ?", field)).collect();
    let sql = format!("UPDATE documents SET {} WHERE doc_id = ?", set_clause.join(", "));
    let mut query = sqlx::query(&sql);
    for (_, value) in &updates {
        query = query.bind(value);
    }
    query = query.bind(doc_id);
    Ok(query.execute(pool).await?.rows_affected())
}

async fn handle_documents_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult {
    let body: Value = parse_body(&headers, &body)?;
    let fields = body
        .as_object()
        .ok_or_else(|| EngineError::bad_request("JSON body must be an object"))?;
    let doc_id = fields
        .get("doc_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| EngineError::bad_request("doc_id is required"))?;
    if !DOC_UPDATABLE_FIELDS.iter().any(|&field| fields.contains_key(field)) {
        return Err(EngineError::bad_request(
            "No updatable fields provided (allowed: title, language, doc_role, resource_type)",
        )
        .into());
    }

    let _guard = state.write_lock.lock().await;
    let updated = apply_document_update(&state.pool, doc_id, fields).await?;
    if updated == 0 {
        return Err(EngineError::not_found(format!("Document doc_id={} not found", doc_id)).into());
    }

    let row = sqlx::query(
        "SELECT doc_id, title, language, doc_role, resource_type FROM documents WHERE doc_id = ?",
    )
    .bind(doc_id)
    .fetch_one(&state.pool)
    .await
    .map_err(EngineError::from)?;
    ok(json!({
        "updated": 1,
        "doc": {
            "doc_id": row.get::<i64, _>("doc_id"),
            "title": row.get::<Option<String>, _>("title"),
            "language": row.get::<Option<String>, _>("language"),
            "doc_role": row.get::<String, _>("doc_role"),
            "resource_type": row.get::<Option<String>, _>("resource_type"),
        }
    }))
}

async fn handle_documents_bulk_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult {
    let body: Value = parse_body(&headers, &body)?;
    let updates = body
        .get("updates")
        .and_then(Value::as_array)
        .filter(|list| !list.is_empty())
        .ok_or_else(|| {
            EngineError::bad_request("updates must be a non-empty list of {doc_id, ...fields}")
        })?;

    let _guard = state.write_lock.lock().await;
    let mut total_updated = 0u64;
    for item in updates {
        let fields = match item.as_object() {
            Some(fields) => fields,
            None => continue,
        };
        let doc_id = match fields.get("doc_id").and_then(Value::as_i64) {
            Some(doc_id) => doc_id,
            None => continue,
        };
        total_updated += apply_document_update(&state.pool, doc_id, fields).await?;
    }
    ok(json!({ "updated": total_updated }))
}

async fn handle_doc_relations_set(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult {
    let body: Value = parse_body(&headers, &body)?;
    let doc_id = body
        .get("doc_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| EngineError::bad_request("doc_id is required"))?;
    let target_doc_id = body
        .get("target_doc_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| EngineError::bad_request("target_doc_id is required"))?;
    let relation_type = body
        .get("relation_type")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::bad_request("relation_type is required"))?;
    if !RELATION_TYPES.contains(&relation_type) {
        return Err(EngineError::validation(format!(
            "relation_type must be one of {:?}, got '{}'",
            RELATION_TYPES, relation_type
        ))
        .into());
    }
    let note = body.get("note").and_then(Value::as_str);

    let _guard = state.write_lock.lock().await;
    let existing: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM doc_relations WHERE doc_id = ? AND relation_type = ? AND target_doc_id = ?",
    )
    .bind(doc_id)
    .bind(relation_type)
    .bind(target_doc_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(EngineError::from)?;

    let (id, action) = match existing {
        Some(id) => {
            sqlx::query("UPDATE doc_relations SET note = ? WHERE id = ?")
                .bind(note)
                .bind(id)
                .execute(&state.pool)
                .await
                .map_err(EngineError::from)?;
            (id, "updated")
        }
        None => {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO doc_relations (doc_id, relation_type, target_doc_id, note, created_at)
                 VALUES (?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(doc_id)
            .bind(relation_type)
            .bind(target_doc_id)
            .bind(note)
            .bind(runs::utcnow_iso())
            .fetch_one(&state.pool)
            .await
            .map_err(EngineError::from)?;
            (id, "created")
        }
    };
    ok(json!({
        "action": action,
        "id": id,
        "doc_id": doc_id,
        "relation_type": relation_type,
        "target_doc_id": target_doc_id,
    }))
}

async fn handle_doc_relations_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult {
    let body: Value = parse_body(&headers, &body)?;
    let id = body
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| EngineError::bad_request("id is required"))?;

    let _guard = state.write_lock.lock().await;
    let deleted = sqlx::query("DELETE FROM doc_relations WHERE id = ?")
        .bind(id)
        .execute(&state.pool)
        .await
        .map_err(EngineError::from)?
        .rows_affected();
    ok(json!({ "deleted": deleted }))
}

#[derive(Deserialize)]
struct ValidateMetaBody {
    #[serde(default)]
    doc_id: Option<i64>,
}

async fn handle_validate_meta(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult {
    let body: ValidateMetaBody = parse_body(&headers, &body)?;
    let results = match body.doc_id {
        Some(doc_id) => vec![metadata::validate_document(&state.pool, doc_id).await?],
        None => metadata::validate_all_documents(&state.pool).await?,
    };
    let has_errors = results.iter().any(|r| !r.is_valid);
    let status = if has_errors { "warnings" } else { "ok" };
    Ok(Json(contract::success_payload(
        json!({ "docs_validated": results.len(), "results": results }),
        status,
    )))
}

/// Reject output paths that are not plain local filesystem paths.
fn local_path(value: &str, field: &str) -> Result<PathBuf, EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::bad_request(format!("{} is required", field)));
    }
    if value.contains("://") {
        return Err(EngineError::validation(format!(
            "{} must be a local filesystem path",
            field
        )));
    }
    Ok(PathBuf::from(value))
}

#[derive(Deserialize)]
struct ExportTeiBody {
    out_dir: Option<String>,
    #[serde(default)]
    doc_ids: Option<Vec<i64>>,
    #[serde(default)]
    include_structure: bool,
}

async fn handle_export_tei(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult {
    let body: ExportTeiBody = parse_body(&headers, &body)?;
    let out_dir = local_path(body.out_dir.as_deref().unwrap_or(""), "out_dir")?;

    let _guard = state.write_lock.lock().await;
    let doc_ids: Vec<i64> = match body.doc_ids {
        Some(doc_ids) => doc_ids,
        None => sqlx::query_scalar("SELECT doc_id FROM documents ORDER BY doc_id")
            .fetch_all(&state.pool)
            .await
            .map_err(EngineError::from)?,
    };

    std::fs::create_dir_all(&out_dir).map_err(EngineError::from)?;
    let mut files_created: Vec<String> = Vec::new();
    for doc_id in &doc_ids {
        let out_path = out_dir.join(format!("doc_{}.tei.xml", doc_id));
        match exporters::tei::export_document(&state.pool, *doc_id, &out_path, body.include_structure)
            .await
        {
            Ok(_) => files_created.push(out_path.display().to_string()),
            Err(e) => {
                tracing::warn!(doc_id, error = %e, "TEI export failed for document");
            }
        }
    }
    record_export_run(&state, "tei", json!({"out_dir": out_dir.display().to_string(), "count": files_created.len()})).await?;
    let count = files_created.len();
    ok(json!({ "files_created": files_created, "count": count }))
}

#[derive(Deserialize)]
struct ExportAlignCsvBody {
    out_path: Option<String>,
    #[serde(flatten)]
    filter: exporters::align_csv::AlignCsvParams,
}

async fn handle_export_align_csv(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult {
    let body: ExportAlignCsvBody = parse_body(&headers, &body)?;
    let out_path = local_path(body.out_path.as_deref().unwrap_or(""), "out_path")?;

    let _guard = state.write_lock.lock().await;
    let rows_written =
        exporters::align_csv::export_alignment(&state.pool, &body.filter, &out_path).await?;
    record_export_run(&state, "align_csv", json!({"out_path": out_path.display().to_string(), "rows_written": rows_written})).await?;
    ok(json!({ "out_path": out_path.display().to_string(), "rows_written": rows_written }))
}

#[derive(Deserialize)]
struct ExportRunReportBody {
    out_path: Option<String>,
    #[serde(default)]
    format: Option<exporters::run_report::ReportFormat>,
    #[serde(default)]
    run_id: Option<String>,
}

async fn handle_export_run_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult {
    let body: ExportRunReportBody = parse_body(&headers, &body)?;
    let out_path = local_path(body.out_path.as_deref().unwrap_or(""), "out_path")?;
    let format = body.format.unwrap_or(exporters::run_report::ReportFormat::Jsonl);

    let _guard = state.write_lock.lock().await;
    let runs_exported = exporters::run_report::export_run_report(
        &state.pool,
        body.run_id.as_deref(),
        format,
        &out_path,
    )
    .await?;
    record_export_run(&state, "run_report", json!({"out_path": out_path.display().to_string(), "runs_exported": runs_exported})).await?;
    ok(json!({
        "out_path": out_path.display().to_string(),
        "runs_exported": runs_exported,
        "format": format.as_str(),
    }))
}

async fn record_export_run(state: &AppState, what: &str, stats: Value) -> Result<(), EngineError> {
    let run_id = runs::create_run(
        &state.pool,
        crate::models::RunKind::Export,
        &json!({"export": what}),
        None,
    )
    .await
    .map_err(|e| EngineError::internal(e.to_string()))?;
    runs::update_run_stats(&state.pool, &run_id, &stats)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;
    Ok(())
}

// ============ Jobs ============

#[derive(Deserialize)]
struct JobsListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

async fn handle_jobs_list(
    State(state): State<AppState>,
    Query(params): Query<JobsListQuery>,
) -> ApiResult {
    let status = match params.status.as_deref() {
        None => None,
        Some(raw) => Some(
            serde_json::from_value::<JobStatus>(Value::String(raw.to_string())).map_err(|_| {
                EngineError::validation(format!("Unknown job status filter: '{}'", raw))
            })?,
        ),
    };
    let limit = params.limit.unwrap_or(100).clamp(1, 200);
    let offset = params.offset.unwrap_or(0);
    let page = state.jobs.list(status, limit, offset);
    ok(serde_json::to_value(page).map_err(EngineError::from)?)
}

async fn handle_job_get(State(state): State<AppState>, UrlPath(id): UrlPath<String>) -> ApiResult {
    let job = state
        .jobs
        .get(&id)
        .ok_or_else(|| EngineError::not_found(format!("Unknown job_id: {}", id)))?;
    ok(json!({ "job": job }))
}

#[derive(Deserialize)]
struct EnqueueBody {
    kind: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

async fn handle_jobs_enqueue(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let body: EnqueueBody = parse_body(&headers, &body)?;
    let kind_raw = body
        .kind
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| EngineError::validation("kind is required and must be a string"))?;
    let kind: JobKind = serde_json::from_value(Value::String(kind_raw.clone())).map_err(|_| {
        ApiError {
            error: EngineError::validation(format!("Unsupported job kind: '{}'", kind_raw)),
            details: Some(json!({"supported_kinds": JobKind::ALL})),
        }
    })?;
    let params = match body.params {
        None | Some(Value::Null) => json!({}),
        Some(params) => params,
    };

    let job = state.jobs.submit(kind, params)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(contract::success_payload(json!({ "job": job }), "accepted")),
    ))
}

async fn handle_job_cancel(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> ApiResult {
    let status = state
        .jobs
        .cancel(&id)
        .ok_or_else(|| EngineError::not_found(format!("Unknown job_id: {}", id)))?;
    ok(json!({ "job_id": id, "status": status }))
}

async fn handle_shutdown(State(state): State<AppState>) -> ApiResult {
    let _ = state.shutdown.send(true);
    ok(json!({ "message": "Shutdown requested", "shutting_down": true }))
}

// ============ Job worker ============

/// The single background worker: drains the FIFO queue, executing one job
/// at a time.
async fn job_worker(state: AppState, mut queue: JobQueue) {
    while let Some(job_id) = queue.recv().await {
        let Some((kind, params, progress)) = state.jobs.begin(&job_id) else {
            continue; // canceled while queued
        };
        tracing::info!(job_id = %job_id, kind = kind.as_str(), "job started");
        match execute_job(&state, kind, params, &progress).await {
            Ok(Some(result)) => state.jobs.finish_ok(&job_id, result),
            Ok(None) => {
                tracing::info!(job_id = %job_id, "job canceled at checkpoint");
            }
            Err(ref error) => {
                tracing::warn!(job_id = %job_id, error = %error, "job failed");
                state.jobs.finish_err(&job_id, error);
            }
        }
    }
}

/// Execute one job. `Ok(None)` means the job observed its cancel flag at a
/// checkpoint and aborted.
async fn execute_job(
    state: &AppState,
    kind: JobKind,
    params: Value,
    progress: &ProgressHandle,
) -> Result<Option<Value>, EngineError> {
    match kind {
        JobKind::Index => {
            if !progress.checkpoint(10, "Rebuilding FTS index") {
                return Ok(None);
            }
            let _guard = state.write_lock.lock().await;
            let units_indexed = indexer::build_index(&state.pool)
                .await
                .map_err(|e| EngineError::internal(e.to_string()))?;
            progress.checkpoint(100, "Index rebuilt");
            Ok(Some(json!({ "units_indexed": units_indexed })))
        }
        JobKind::Import => {
            let parsed: jobs::ImportJobParams = serde_json::from_value(params)
                .map_err(|e| EngineError::validation(e.to_string()))?;
            if !progress.checkpoint(5, "Starting import") {
                return Ok(None);
            }
            let options = ImportOptions {
                language: parsed.language,
                title: parsed.title,
                doc_role: parsed.doc_role.unwrap_or_else(|| "standalone".to_string()),
                resource_type: parsed.resource_type,
                tei_unit: parsed.tei_unit,
            };
            let _guard = state.write_lock.lock().await;
            let run_id = runs::create_run(
                &state.pool,
                crate::models::RunKind::Import,
                &json!({"mode": parsed.mode.as_str(), "path": parsed.path}),
                None,
            )
            .await
            .map_err(|e| EngineError::internal(e.to_string()))?;
            let report =
                importers::run_import(&state.pool, parsed.mode, Path::new(&parsed.path), &options)
                    .await?;
            indexer::mark_stale(&state.pool)
                .await
                .map_err(|e| EngineError::internal(e.to_string()))?;
            let stats = serde_json::to_value(&report)?;
            runs::update_run_stats(&state.pool, &run_id, &stats)
                .await
                .map_err(|e| EngineError::internal(e.to_string()))?;
            progress.checkpoint(100, "Import completed");
            let mut payload = json!({"run_id": run_id, "fts_stale": true});
            merge_object(&mut payload, stats);
            Ok(Some(payload))
        }
        JobKind::Curate => {
            let parsed: jobs::CurateJobParams = serde_json::from_value(params)
                .map_err(|e| EngineError::validation(e.to_string()))?;
            if !progress.checkpoint(10, "Applying curation rules") {
                return Ok(None);
            }
            let _guard = state.write_lock.lock().await;
            let reports = curation::curate(&state.pool, parsed.doc_id, &parsed.rules).await?;
            let units_modified: usize = reports.iter().map(|r| r.units_modified).sum();
            progress.checkpoint(100, "Curation completed");
            Ok(Some(json!({
                "docs_curated": reports.len(),
                "units_modified": units_modified,
                "fts_stale": units_modified > 0,
                "results": reports,
            })))
        }
        JobKind::ValidateMeta => {
            let parsed: jobs::ValidateMetaJobParams = serde_json::from_value(params)
                .map_err(|e| EngineError::validation(e.to_string()))?;
            if !progress.checkpoint(20, "Validating metadata") {
                return Ok(None);
            }
            let results = match parsed.doc_id {
                Some(doc_id) => vec![metadata::validate_document(&state.pool, doc_id).await?],
                None => metadata::validate_all_documents(&state.pool).await?,
            };
            let has_errors = results.iter().any(|r| !r.is_valid);
            progress.checkpoint(100, "Validation completed");
            Ok(Some(json!({
                "status": if has_errors { "warnings" } else { "ok" },
                "docs_validated": results.len(),
                "results": results,
            })))
        }
        JobKind::Segment => {
            let parsed: jobs::SegmentJobParams = serde_json::from_value(params)
                .map_err(|e| EngineError::validation(e.to_string()))?;
            if !progress.checkpoint(10, "Resegmenting document") {
                return Ok(None);
            }
            let lang = parsed.lang.unwrap_or_else(|| "und".to_string());
            let _guard = state.write_lock.lock().await;
            let report = segmenter::resegment_document(&state.pool, parsed.doc_id, &lang).await?;
            progress.checkpoint(100, "Segmentation completed");
            let mut payload = json!({"fts_stale": true});
            merge_object(&mut payload, serde_json::to_value(&report)?);
            Ok(Some(payload))
        }
        JobKind::Align => {
            let parsed: AlignParams = serde_json::from_value(params)
                .map_err(|e| EngineError::validation(e.to_string()))?;
            if !progress.checkpoint(10, &format!("Aligning strategy={}", parsed.strategy.as_str()))
            {
                return Ok(None);
            }
            let _guard = state.write_lock.lock().await;
            let outcome = aligner::run_alignment(&state.pool, &parsed).await?;
            progress.checkpoint(100, "Alignment completed");
            Ok(Some(serde_json::to_value(outcome)?))
        }
        JobKind::ExportTei => {
            let parsed: jobs::ExportTeiJobParams = serde_json::from_value(params)
                .map_err(|e| EngineError::validation(e.to_string()))?;
            let out_dir = local_path(&parsed.out_dir, "out_dir")?;
            if !progress.checkpoint(5, "Exporting TEI") {
                return Ok(None);
            }
            let doc_ids: Vec<i64> = match parsed.doc_ids {
                Some(doc_ids) => doc_ids,
                None => {
                    let _guard = state.write_lock.lock().await;
                    sqlx::query_scalar("SELECT doc_id FROM documents ORDER BY doc_id")
                        .fetch_all(&state.pool)
                        .await?
                }
            };
            std::fs::create_dir_all(&out_dir)?;
            let mut files_created: Vec<String> = Vec::new();
            let total = doc_ids.len().max(1);
            for (i, doc_id) in doc_ids.iter().enumerate() {
                let out_path = out_dir.join(format!("doc_{}.tei.xml", doc_id));
                {
                    let _guard = state.write_lock.lock().await;
                    exporters::tei::export_document(
                        &state.pool,
                        *doc_id,
                        &out_path,
                        parsed.include_structure,
                    )
                    .await?;
                }
                files_created.push(out_path.display().to_string());
                let pct = 5 + (90 * (i + 1) / total) as u8;
                if !progress.checkpoint(pct, &format!("Exported {}/{}", i + 1, doc_ids.len())) {
                    return Ok(None);
                }
            }
            progress.checkpoint(100, "TEI export completed");
            let count = files_created.len();
            Ok(Some(json!({ "files_created": files_created, "count": count })))
        }
        JobKind::ExportAlignCsv => {
            let parsed: jobs::ExportAlignCsvJobParams = serde_json::from_value(params)
                .map_err(|e| EngineError::validation(e.to_string()))?;
            let out_path = local_path(&parsed.out_path, "out_path")?;
            if !progress.checkpoint(10, "Querying alignment links") {
                return Ok(None);
            }
            let _guard = state.write_lock.lock().await;
            let rows_written =
                exporters::align_csv::export_alignment(&state.pool, &parsed.filter, &out_path)
                    .await?;
            progress.checkpoint(100, "CSV export completed");
            Ok(Some(json!({
                "out_path": out_path.display().to_string(),
                "rows_written": rows_written,
            })))
        }
        JobKind::ExportRunReport => {
            let parsed: jobs::ExportRunReportJobParams = serde_json::from_value(params)
                .map_err(|e| EngineError::validation(e.to_string()))?;
            let out_path = local_path(&parsed.out_path, "out_path")?;
            if !progress.checkpoint(10, "Fetching run history") {
                return Ok(None);
            }
            let format = parsed
                .format
                .unwrap_or(exporters::run_report::ReportFormat::Jsonl);
            let _guard = state.write_lock.lock().await;
            let runs_exported = exporters::run_report::export_run_report(
                &state.pool,
                parsed.run_id.as_deref(),
                format,
                &out_path,
            )
            .await?;
            progress.checkpoint(100, "Report export completed");
            Ok(Some(json!({
                "out_path": out_path.display().to_string(),
                "runs_exported": runs_exported,
                "format": format.as_str(),
            })))
        }
    }
}

/// Merge `extra`'s keys into `target` (both must be objects).
fn merge_object(target: &mut Value, extra: Value) {
    if let (Value::Object(target), Value::Object(extra)) = (target, extra) {
        for (key, value) in extra {
            target.entry(key).or_insert(value);
        }
    }
}
