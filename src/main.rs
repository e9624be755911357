//! # Agrafes CLI (`agrafes`)
//!
//! Headless entry point for the corpus engine. Every invocation prints
//! exactly one JSON object on stdout and exits `0` on success, `1` on any
//! error; diagnostics go to stderr via `tracing`.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `agrafes init` | Create the database and run schema migrations |
//! | `agrafes import` | Ingest a source file (TXT/DOCX/TEI) |
//! | `agrafes index` | Rebuild the FTS5 index |
//! | `agrafes query "<q>"` | Search (segment or KWIC mode) |
//! | `agrafes curate` | Apply (or preview) curation rules from a JSON file |
//! | `agrafes segment` | Resegment a document into sentences |
//! | `agrafes align` | Align a pivot document against targets |
//! | `agrafes validate-meta` | Report per-document metadata validation |
//! | `agrafes diagnostics` | Operational health report for the database |
//! | `agrafes export-tei` | XML export to a directory |
//! | `agrafes export-align-csv` | Alignment CSV/TSV dump |
//! | `agrafes export-run-report` | Run report (JSONL or HTML) |
//! | `agrafes serve` | Start the localhost HTTP sidecar |
//! | `agrafes status` | Inspect sidecar state via the portfile |
//! | `agrafes shutdown` | Stop a running sidecar |

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use agrafes::aligner::{AlignParams, AlignStrategy};
use agrafes::curation::CurationRule;
use agrafes::diagnostics;
use agrafes::exporters;
use agrafes::importers::{self, ImportMode, ImportOptions};
use agrafes::indexer;
use agrafes::metadata;
use agrafes::models::RunKind;
use agrafes::portfile::{self, SidecarState};
use agrafes::query::{QueryMode, QueryParams};
use agrafes::runs;
use agrafes::segmenter;
use agrafes::server::{self, SidecarOptions, StartOutcome};
use agrafes::{curation, db, migrate};

/// Agrafes — a local multilingual corpus search and alignment engine for
/// concordance work.
#[derive(Parser)]
#[command(
    name = "agrafes",
    about = "Local multilingual corpus search and alignment engine",
    version
)]
struct Cli {
    /// Path to the corpus database file.
    #[arg(long, global = true, default_value = "./corpus.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema (idempotent).
    Init,

    /// Import a source file.
    Import {
        /// Import mode: txt_numbered_lines, docx_numbered_lines,
        /// docx_paragraphs, or tei.
        #[arg(long)]
        mode: String,
        /// Path to the source file.
        #[arg(long)]
        path: PathBuf,
        /// Language tag (required for non-TEI modes).
        #[arg(long)]
        language: Option<String>,
        /// Document title (defaults to the file stem).
        #[arg(long)]
        title: Option<String>,
        /// Document role: standalone, original, translation, excerpt, unknown.
        #[arg(long, default_value = "standalone")]
        doc_role: String,
        /// Free-form resource type tag.
        #[arg(long)]
        resource_type: Option<String>,
        /// TEI unit element: p or s.
        #[arg(long, default_value = "p")]
        tei_unit: String,
    },

    /// Rebuild the full-text index.
    Index,

    /// Search the corpus.
    Query {
        /// Query string (FTS5 syntax: phrase, boolean, NEAR).
        q: String,
        /// segment or kwic.
        #[arg(long, default_value = "segment")]
        mode: String,
        /// KWIC context width in tokens (3..=25).
        #[arg(long, default_value_t = 10)]
        window: i64,
        #[arg(long)]
        language: Option<String>,
        #[arg(long)]
        doc_id: Option<i64>,
        #[arg(long)]
        doc_role: Option<String>,
        #[arg(long)]
        resource_type: Option<String>,
        /// Attach aligned sibling units to each hit.
        #[arg(long)]
        include_aligned: bool,
        /// Cap on attached siblings per hit.
        #[arg(long, default_value_t = 20)]
        aligned_limit: i64,
        /// KWIC only: one hit per match occurrence.
        #[arg(long)]
        all_occurrences: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Apply (or preview) curation rules over normalized text.
    Curate {
        /// Path to a JSON file holding an array of rules
        /// `{pattern, replacement, flags?, description?}`.
        #[arg(long)]
        rules: PathBuf,
        /// Restrict to one document (default: all documents).
        #[arg(long)]
        doc_id: Option<i64>,
        /// Dry-run: report counts and samples without writing.
        #[arg(long)]
        preview: bool,
    },

    /// Resegment a document into sentence-level units.
    Segment {
        #[arg(long)]
        doc_id: i64,
        #[arg(long, default_value = "und")]
        lang: String,
    },

    /// Align a pivot document against one or more targets.
    Align {
        #[arg(long)]
        pivot_doc_id: i64,
        /// Target document ids (repeatable).
        #[arg(long = "target-doc-id", required = true)]
        target_doc_ids: Vec<i64>,
        /// external_id, external_id_then_position, position, or similarity.
        #[arg(long, default_value = "external_id")]
        strategy: String,
        /// Similarity threshold in [0, 1].
        #[arg(long, default_value_t = 0.8)]
        sim_threshold: f64,
        /// Include the per-phase debug payload in the report.
        #[arg(long)]
        debug_align: bool,
    },

    /// Validate document metadata.
    ValidateMeta {
        #[arg(long)]
        doc_id: Option<i64>,
    },

    /// Collect operational diagnostics for the database.
    ///
    /// Reports SQLite integrity, applied schema versions, table counts,
    /// FTS consistency, alignment-link referential checks, and document
    /// metadata gaps. Read-only.
    Diagnostics {
        /// Exit with code 1 when the overall status is not `ok`.
        #[arg(long)]
        strict: bool,
    },

    /// Export documents as structured XML.
    ExportTei {
        #[arg(long)]
        out_dir: PathBuf,
        /// Document ids to export (default: all).
        #[arg(long = "doc-id")]
        doc_ids: Vec<i64>,
        /// Include structure units in the export.
        #[arg(long)]
        include_structure: bool,
    },

    /// Export alignment links as CSV or TSV.
    ExportAlignCsv {
        #[arg(long)]
        out_path: PathBuf,
        #[arg(long)]
        pivot_doc_id: Option<i64>,
        #[arg(long)]
        target_doc_id: Option<i64>,
        #[arg(long)]
        external_id: Option<i64>,
        /// Use tab as delimiter instead of comma.
        #[arg(long)]
        tsv: bool,
    },

    /// Export the run log as JSONL or HTML.
    ExportRunReport {
        #[arg(long)]
        out_path: PathBuf,
        /// jsonl or html.
        #[arg(long, default_value = "jsonl")]
        format: String,
        /// Restrict to one run.
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Start the localhost HTTP sidecar.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// 0 asks the OS for a free port.
        #[arg(long, default_value_t = 8765)]
        port: u16,
        /// Token policy: off, auto, or an explicit token value.
        #[arg(long, default_value = "auto")]
        token: String,
    },

    /// Inspect sidecar lifecycle state (running / stale / missing).
    Status,

    /// Stop a running sidecar discovered via the portfile.
    Shutdown,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(payload) => {
            println!("{}", payload);
        }
        Err(e) => {
            println!(
                "{}",
                json!({ "status": "error", "error": e.to_string() })
            );
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<Value> {
    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cli.db).await?;
            let applied = migrate::apply_migrations(&pool).await?;
            let run_id = runs::create_run(&pool, RunKind::Init, &json!({}), None).await?;
            runs::update_run_stats(&pool, &run_id, &json!({"migrations_applied": applied})).await?;
            pool.close().await;
            Ok(json!({
                "status": "ok",
                "run_id": run_id,
                "db_path": cli.db.display().to_string(),
                "migrations_applied": applied,
            }))
        }

        Commands::Import {
            mode,
            path,
            language,
            title,
            doc_role,
            resource_type,
            tei_unit,
        } => {
            let mode: ImportMode = serde_json::from_value(Value::String(mode.clone()))
                .map_err(|_| anyhow::anyhow!("Unsupported import mode: {}", mode))?;
            let pool = open(&cli.db).await?;
            let options = ImportOptions {
                language,
                title,
                doc_role,
                resource_type,
                tei_unit: Some(tei_unit),
            };
            let run_id = runs::create_run(
                &pool,
                RunKind::Import,
                &json!({"mode": mode.as_str(), "path": path.display().to_string()}),
                None,
            )
            .await?;
            let report = importers::run_import(&pool, mode, &path, &options).await?;
            indexer::mark_stale(&pool).await?;
            runs::update_run_stats(&pool, &run_id, &serde_json::to_value(&report)?).await?;
            pool.close().await;
            let mut payload = json!({"status": "ok", "run_id": run_id, "mode": mode.as_str(), "fts_stale": true});
            merge(&mut payload, serde_json::to_value(&report)?);
            Ok(payload)
        }

        Commands::Index => {
            let pool = open(&cli.db).await?;
            let run_id = runs::create_run(&pool, RunKind::Index, &json!({}), None).await?;
            let units_indexed = indexer::build_index(&pool).await?;
            runs::update_run_stats(&pool, &run_id, &json!({"units_indexed": units_indexed})).await?;
            pool.close().await;
            Ok(json!({"status": "ok", "run_id": run_id, "units_indexed": units_indexed}))
        }

        Commands::Query {
            q,
            mode,
            window,
            language,
            doc_id,
            doc_role,
            resource_type,
            include_aligned,
            aligned_limit,
            all_occurrences,
            limit,
            offset,
        } => {
            let mode: QueryMode = serde_json::from_value(Value::String(mode.clone()))
                .map_err(|_| anyhow::anyhow!("Unknown query mode: {} (use segment or kwic)", mode))?;
            let pool = open(&cli.db).await?;
            let params = QueryParams {
                q,
                mode,
                window,
                language,
                doc_id,
                resource_type,
                doc_role,
                include_aligned,
                aligned_limit: Some(aligned_limit),
                all_occurrences,
                limit,
                offset,
            };
            let run_id = runs::create_run(&pool, RunKind::Query, &json!({"q": params.q}), None).await?;
            let page = agrafes::query::run_query_page(&pool, &params).await?;
            runs::update_run_stats(&pool, &run_id, &json!({"count": page.hits.len()})).await?;
            pool.close().await;
            let mut payload = json!({"status": "ok", "run_id": run_id, "count": page.hits.len()});
            merge(&mut payload, serde_json::to_value(&page)?);
            Ok(payload)
        }

        Commands::Curate {
            rules,
            doc_id,
            preview,
        } => {
            let rules_text = std::fs::read_to_string(&rules)?;
            let rules: Vec<CurationRule> = serde_json::from_str(&rules_text)?;
            let pool = open(&cli.db).await?;
            if preview {
                let doc_id = doc_id
                    .ok_or_else(|| anyhow::anyhow!("--doc-id is required with --preview"))?;
                let preview = curation::preview_document(&pool, doc_id, &rules, 10).await?;
                pool.close().await;
                let mut payload = json!({"status": "ok"});
                merge(&mut payload, serde_json::to_value(&preview)?);
                return Ok(payload);
            }
            let run_id = runs::create_run(
                &pool,
                RunKind::Curate,
                &json!({"doc_id": doc_id, "rules": rules.len()}),
                None,
            )
            .await?;
            let reports = curation::curate(&pool, doc_id, &rules).await?;
            let units_modified: usize = reports.iter().map(|r| r.units_modified).sum();
            runs::update_run_stats(
                &pool,
                &run_id,
                &json!({"docs_curated": reports.len(), "units_modified": units_modified}),
            )
            .await?;
            pool.close().await;
            Ok(json!({
                "status": "ok",
                "run_id": run_id,
                "docs_curated": reports.len(),
                "units_modified": units_modified,
                "fts_stale": units_modified > 0,
                "results": reports,
            }))
        }

        Commands::Segment { doc_id, lang } => {
            let pool = open(&cli.db).await?;
            let run_id = runs::create_run(
                &pool,
                RunKind::Segment,
                &json!({"doc_id": doc_id, "lang": lang}),
                None,
            )
            .await?;
            let report = segmenter::resegment_document(&pool, doc_id, &lang).await?;
            runs::update_run_stats(&pool, &run_id, &serde_json::to_value(&report)?).await?;
            pool.close().await;
            let mut payload = json!({"status": "ok", "run_id": run_id, "fts_stale": true});
            merge(&mut payload, serde_json::to_value(&report)?);
            Ok(payload)
        }

        Commands::Align {
            pivot_doc_id,
            target_doc_ids,
            strategy,
            sim_threshold,
            debug_align,
        } => {
            let strategy: AlignStrategy = serde_json::from_value(Value::String(strategy.clone()))
                .map_err(|_| anyhow::anyhow!("Unsupported align strategy: {}", strategy))?;
            let pool = open(&cli.db).await?;
            let params = AlignParams {
                pivot_doc_id,
                target_doc_ids,
                strategy,
                sim_threshold,
                debug_align,
                run_id: None,
            };
            let outcome = agrafes::aligner::run_alignment(&pool, &params).await?;
            pool.close().await;
            let mut payload = json!({"status": "ok"});
            merge(&mut payload, serde_json::to_value(&outcome)?);
            Ok(payload)
        }

        Commands::ValidateMeta { doc_id } => {
            let pool = open(&cli.db).await?;
            let results = match doc_id {
                Some(doc_id) => vec![metadata::validate_document(&pool, doc_id).await?],
                None => metadata::validate_all_documents(&pool).await?,
            };
            pool.close().await;
            let has_errors = results.iter().any(|r| !r.is_valid);
            Ok(json!({
                "status": if has_errors { "warnings" } else { "ok" },
                "docs_validated": results.len(),
                "results": results,
            }))
        }

        Commands::Diagnostics { strict } => {
            let pool = open(&cli.db).await?;
            let report = diagnostics::collect_diagnostics(&pool).await?;
            pool.close().await;
            let payload = serde_json::to_value(&report)?;
            if strict && report.status != "ok" {
                println!("{}", payload);
                std::process::exit(1);
            }
            Ok(payload)
        }

        Commands::ExportTei {
            out_dir,
            doc_ids,
            include_structure,
        } => {
            let pool = open(&cli.db).await?;
            let doc_ids: Vec<i64> = if doc_ids.is_empty() {
                sqlx::query_scalar("SELECT doc_id FROM documents ORDER BY doc_id")
                    .fetch_all(&pool)
                    .await?
            } else {
                doc_ids
            };
            std::fs::create_dir_all(&out_dir)?;
            let mut files_created = Vec::new();
            for doc_id in &doc_ids {
                let out_path = out_dir.join(format!("doc_{}.tei.xml", doc_id));
                exporters::tei::export_document(&pool, *doc_id, &out_path, include_structure).await?;
                files_created.push(out_path.display().to_string());
            }
            pool.close().await;
            Ok(json!({"status": "ok", "files_created": files_created, "count": doc_ids.len()}))
        }

        Commands::ExportAlignCsv {
            out_path,
            pivot_doc_id,
            target_doc_id,
            external_id,
            tsv,
        } => {
            let pool = open(&cli.db).await?;
            let params = exporters::align_csv::AlignCsvParams {
                pivot_doc_id,
                target_doc_id,
                external_id,
                delimiter: if tsv { Some("\t".to_string()) } else { None },
            };
            let rows_written =
                exporters::align_csv::export_alignment(&pool, &params, &out_path).await?;
            pool.close().await;
            Ok(json!({
                "status": "ok",
                "out_path": out_path.display().to_string(),
                "rows_written": rows_written,
            }))
        }

        Commands::ExportRunReport {
            out_path,
            format,
            run_id,
        } => {
            let format: exporters::run_report::ReportFormat =
                serde_json::from_value(Value::String(format.clone()))
                    .map_err(|_| anyhow::anyhow!("format must be jsonl or html, got {}", format))?;
            let pool = open(&cli.db).await?;
            let runs_exported = exporters::run_report::export_run_report(
                &pool,
                run_id.as_deref(),
                format,
                &out_path,
            )
            .await?;
            pool.close().await;
            Ok(json!({
                "status": "ok",
                "out_path": out_path.display().to_string(),
                "runs_exported": runs_exported,
                "format": format.as_str(),
            }))
        }

        Commands::Serve { host, port, token } => {
            let outcome = server::start(SidecarOptions {
                db_path: cli.db.clone(),
                host,
                port,
                token_mode: token,
            })
            .await?;
            match outcome {
                StartOutcome::AlreadyRunning {
                    host,
                    port,
                    pid,
                    portfile,
                } => Ok(json!({
                    "status": "already_running",
                    "host": host,
                    "port": port,
                    "pid": pid,
                    "portfile": portfile.display().to_string(),
                })),
                StartOutcome::Listening(handle) => {
                    // The startup record is the only stdout line until exit.
                    println!(
                        "{}",
                        json!({
                            "status": "listening",
                            "host": handle.host,
                            "port": handle.port,
                            "pid": handle.pid,
                            "portfile": handle.portfile.display().to_string(),
                        })
                    );
                    handle.wait().await;
                    std::process::exit(0);
                }
            }
        }

        Commands::Status => {
            let state = portfile::inspect_state(&cli.db, Duration::from_millis(600)).await;
            Ok(serde_json::to_value(&state)?)
        }

        Commands::Shutdown => {
            let state = portfile::inspect_state(&cli.db, Duration::from_millis(600)).await;
            match state {
                SidecarState::Running {
                    host, port, token, ..
                } => {
                    let client = reqwest::Client::builder()
                        .timeout(Duration::from_secs(3))
                        .build()?;
                    let mut request =
                        client.post(format!("http://{}:{}/shutdown", host, port));
                    if let Some(ref token) = token {
                        request = request.header("X-Agrafes-Token", token);
                    }
                    let response = request.send().await?;
                    let status = response.status().as_u16();
                    let body: Value = response.json().await.unwrap_or_else(|_| json!({}));
                    Ok(json!({
                        "status": "ok",
                        "http_status": status,
                        "response": body,
                    }))
                }
                other => Err(anyhow::anyhow!(
                    "Sidecar is not running: {}",
                    serde_json::to_value(&other)?["state"]
                        .as_str()
                        .unwrap_or("unknown")
                )),
            }
        }
    }
}

async fn open(db_path: &Path) -> Result<sqlx::SqlitePool> {
    let pool = db::connect(db_path).await?;
    migrate::apply_migrations(&pool).await?;
    Ok(pool)
}

fn merge(target: &mut Value, extra: Value) {
    if let (Value::Object(target), Value::Object(extra)) = (target, extra) {
        for (key, value) in extra {
            target.entry(key).or_insert(value);
        }
    }
}
