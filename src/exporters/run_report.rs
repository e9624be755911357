//! Run report export: serializes `runs` entries as JSONL or an HTML table.
//!
//! The HTML rendition escapes every dynamic value, so a run whose params
//! contain markup cannot inject script into the report.

use std::io::Write;
use std::path::Path;

use sqlx::SqlitePool;

use crate::error::EngineError;
use crate::runs;

use super::html_escape;

/// Report output format — a closed tagged set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    Jsonl,
    Html,
}

impl ReportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportFormat::Jsonl => "jsonl",
            ReportFormat::Html => "html",
        }
    }
}

/// Write the run report to `out_path`, optionally filtered to one run id.
/// Returns the number of runs exported.
pub async fn export_run_report(
    pool: &SqlitePool,
    run_id: Option<&str>,
    format: ReportFormat,
    out_path: &Path,
) -> Result<usize, EngineError> {
    let records = runs::list_runs(pool, run_id)
        .await
        .map_err(|e| EngineError::internal(e.to_string()))?;

    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = std::fs::File::create(out_path)?;

    match format {
        ReportFormat::Jsonl => {
            for record in &records {
                writeln!(file, "{}", serde_json::to_string(record)?)?;
            }
        }
        ReportFormat::Html => {
            let mut rows_html = String::new();
            for record in &records {
                let stats = record
                    .stats
                    .as_ref()
                    .map(|stats| serde_json::to_string_pretty(stats).unwrap_or_default())
                    .unwrap_or_default();
                rows_html.push_str(&format!(
                    "<tr><td>{}</td><td>{}</td><td>{}</td><td><pre>{}</pre></td></tr>\n",
                    html_escape(&record.run_id),
                    html_escape(&record.kind),
                    html_escape(&record.created_at),
                    html_escape(&stats),
                ));
            }
            write!(
                file,
                "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Run Report</title></head><body>\n\
                 <h1>Run report</h1>\n\
                 <table border=\"1\">\n\
                 <tr><th>run_id</th><th>kind</th><th>created_at</th><th>stats</th></tr>\n\
                 {}</table></body></html>\n",
                rows_html
            )?;
        }
    }

    Ok(records.len())
}
