//! Run management — create, log, and finalize runs.
//!
//! Every operation (init/import/index/query/curate/segment/align/export) is
//! a run: it gets an opaque id, is persisted append-only in the `runs`
//! table, and may write free-form log lines to a sibling
//! `runs/<run_id>/run.log` file next to the database.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::models::RunKind;

pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn utcnow_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Insert a new run record and return its id. A caller-supplied `run_id`
/// (e.g. from a job) is honored; otherwise a fresh UUID is assigned.
pub async fn create_run(
    pool: &SqlitePool,
    kind: RunKind,
    params: &serde_json::Value,
    run_id: Option<String>,
) -> Result<String> {
    let run_id = run_id.unwrap_or_else(new_run_id);
    sqlx::query(
        "INSERT INTO runs (run_id, kind, params_json, stats_json, created_at) VALUES (?, ?, ?, NULL, ?)",
    )
    .bind(&run_id)
    .bind(kind.as_str())
    .bind(serde_json::to_string(params)?)
    .bind(utcnow_iso())
    .execute(pool)
    .await?;
    Ok(run_id)
}

/// Update the stats of an existing run.
pub async fn update_run_stats(
    pool: &SqlitePool,
    run_id: &str,
    stats: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE runs SET stats_json = ? WHERE run_id = ?")
        .bind(serde_json::to_string(stats)?)
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Fetch runs, optionally filtered to one id, newest first.
pub async fn list_runs(
    pool: &SqlitePool,
    run_id: Option<&str>,
) -> Result<Vec<crate::models::RunRecord>> {
    use sqlx::Row;

    let rows = if let Some(id) = run_id {
        sqlx::query(
            "SELECT run_id, kind, params_json, stats_json, created_at FROM runs WHERE run_id = ? ORDER BY created_at DESC",
        )
        .bind(id)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query(
            "SELECT run_id, kind, params_json, stats_json, created_at FROM runs ORDER BY created_at DESC",
        )
        .fetch_all(pool)
        .await?
    };

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let params_json: Option<String> = row.get("params_json");
        let stats_json: Option<String> = row.get("stats_json");
        records.push(crate::models::RunRecord {
            run_id: row.get("run_id"),
            kind: row.get("kind"),
            params: params_json.and_then(|s| serde_json::from_str(&s).ok()),
            stats: stats_json.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: row.get("created_at"),
        });
    }
    Ok(records)
}

/// Per-run free-form log file. Only the JSON envelope on stdout is part of
/// the contract; these lines are diagnostics.
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    /// Open (creating) `runs/<run_id>/run.log` next to the database.
    pub fn open(db_path: &Path, run_id: &str) -> Result<Self> {
        let dir = db_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("runs")
            .join(run_id);
        std::fs::create_dir_all(&dir)?;
        Ok(RunLog {
            path: dir.join("run.log"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line. Failures are swallowed; run logs are
    /// best-effort diagnostics, not part of the contract.
    pub fn line(&self, level: &str, message: &str) {
        let entry = format!("{} [{}] {}\n", utcnow_iso(), level, message);
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(entry.as_bytes()));
        if result.is_err() {
            tracing::warn!(path = %self.path.display(), "failed to append run log line");
        }
    }

    pub fn info(&self, message: &str) {
        self.line("INFO", message);
    }

    pub fn warn(&self, message: &str) {
        self.line("WARNING", message);
    }
}
