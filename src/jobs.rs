//! Async job runtime: FIFO queue, single worker, progress, cancellation.
//!
//! One background worker per sidecar process executes jobs serially in
//! FIFO order — the storage layer serializes writers anyway, so parallel
//! workers would only contend on the same lock and complicate cancellation.
//!
//! States: `queued → running → (done | error | canceled)`. Terminal states
//! are immutable. Cancellation is immediate for queued jobs and
//! cooperative for running ones: the worker observes a shared flag at each
//! progress checkpoint, aborts its current chunk, and the job stays
//! `canceled` (a canceled job is not an error; its result is discarded).
//!
//! Retention keeps all non-terminal jobs plus the most recent 100 terminal
//! ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::aligner::AlignParams;
use crate::curation::CurationRule;
use crate::error::EngineError;
use crate::exporters::align_csv::AlignCsvParams;
use crate::exporters::run_report::ReportFormat;
use crate::importers::ImportMode;
use crate::runs::utcnow_iso;

/// How many terminal jobs the runtime keeps for history.
pub const TERMINAL_RETENTION: usize = 100;

/// Supported job kinds — a closed tagged set; unknown tags are validation
/// errors at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "import")]
    Import,
    #[serde(rename = "index")]
    Index,
    #[serde(rename = "curate")]
    Curate,
    #[serde(rename = "validate-meta")]
    ValidateMeta,
    #[serde(rename = "segment")]
    Segment,
    #[serde(rename = "align")]
    Align,
    #[serde(rename = "export_tei")]
    ExportTei,
    #[serde(rename = "export_align_csv")]
    ExportAlignCsv,
    #[serde(rename = "export_run_report")]
    ExportRunReport,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Import => "import",
            JobKind::Index => "index",
            JobKind::Curate => "curate",
            JobKind::ValidateMeta => "validate-meta",
            JobKind::Segment => "segment",
            JobKind::Align => "align",
            JobKind::ExportTei => "export_tei",
            JobKind::ExportAlignCsv => "export_align_csv",
            JobKind::ExportRunReport => "export_run_report",
        }
    }

    pub const ALL: &'static [&'static str] = &[
        "import",
        "index",
        "curate",
        "validate-meta",
        "segment",
        "align",
        "export_tei",
        "export_align_csv",
        "export_run_report",
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
        }
    }
}

/// In-memory record of one async job.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub kind: String,
    pub status: JobStatus,
    pub progress_pct: u8,
    pub progress_message: Option<String>,
    pub params: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

struct JobEntry {
    record: JobRecord,
    cancel: Arc<AtomicBool>,
    seq: u64,
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, JobEntry>,
    next_seq: u64,
}

impl JobTable {
    /// Drop the oldest terminal jobs beyond the retention window.
    fn prune(&mut self) {
        let mut terminal: Vec<(u64, String)> = self
            .jobs
            .values()
            .filter(|entry| entry.record.status.is_terminal())
            .map(|entry| (entry.seq, entry.record.job_id.clone()))
            .collect();
        if terminal.len() <= TERMINAL_RETENTION {
            return;
        }
        terminal.sort_by_key(|&(seq, _)| seq);
        let excess = terminal.len() - TERMINAL_RETENTION;
        for (_, job_id) in terminal.into_iter().take(excess) {
            self.jobs.remove(&job_id);
        }
    }
}

/// Paginated job listing.
#[derive(Debug, Clone, Serialize)]
pub struct JobListPage {
    pub jobs: Vec<JobRecord>,
    /// Exact: the job table is in memory.
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
    pub next_offset: Option<usize>,
}

/// Handle given to the worker for one job execution. Progress checkpoints
/// double as cancellation observation points.
pub struct ProgressHandle {
    manager: JobManager,
    job_id: String,
    cancel: Arc<AtomicBool>,
}

impl ProgressHandle {
    /// Record progress and observe the cancel flag. Returns `false` when
    /// the job was canceled — the worker must abort its current chunk.
    pub fn checkpoint(&self, pct: u8, message: &str) -> bool {
        if self.cancel.load(Ordering::SeqCst) {
            return false;
        }
        self.manager.set_progress(&self.job_id, pct, Some(message));
        true
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Receiver half of the FIFO queue, consumed by the single worker.
pub type JobQueue = mpsc::UnboundedReceiver<String>;

/// Thread-safe job table + FIFO queue sender. Cheap to clone.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Mutex<JobTable>>,
    tx: mpsc::UnboundedSender<String>,
}

impl JobManager {
    pub fn new() -> (Self, JobQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            JobManager {
                inner: Arc::new(Mutex::new(JobTable::default())),
                tx,
            },
            rx,
        )
    }

    /// Validate and enqueue a job. Returns the queued record.
    pub fn submit(&self, kind: JobKind, params: Value) -> Result<JobRecord, EngineError> {
        validate_params(kind, &params)?;

        let job_id = Uuid::new_v4().to_string();
        let record = JobRecord {
            job_id: job_id.clone(),
            kind: kind.as_str().to_string(),
            status: JobStatus::Queued,
            progress_pct: 0,
            progress_message: None,
            params,
            result: None,
            error: None,
            error_code: None,
            created_at: utcnow_iso(),
            started_at: None,
            finished_at: None,
        };

        {
            let mut table = self.inner.lock();
            let seq = table.next_seq;
            table.next_seq += 1;
            table.jobs.insert(
                job_id.clone(),
                JobEntry {
                    record: record.clone(),
                    cancel: Arc::new(AtomicBool::new(false)),
                    seq,
                },
            );
            table.prune();
        }

        // The receiver lives as long as the sidecar; a closed queue means
        // shutdown, in which case the job simply stays queued.
        let _ = self.tx.send(job_id);
        Ok(record)
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.inner.lock().jobs.get(job_id).map(|entry| entry.record.clone())
    }

    /// List jobs in submission order, optionally filtered by status.
    pub fn list(&self, status: Option<JobStatus>, limit: usize, offset: usize) -> JobListPage {
        let table = self.inner.lock();
        let mut entries: Vec<(u64, JobRecord)> = table
            .jobs
            .values()
            .filter(|entry| status.map_or(true, |s| entry.record.status == s))
            .map(|entry| (entry.seq, entry.record.clone()))
            .collect();
        entries.sort_by_key(|&(seq, _)| seq);

        let total = entries.len();
        let jobs: Vec<JobRecord> = entries
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, record)| record)
            .collect();
        let has_more = offset + limit < total;
        JobListPage {
            jobs,
            total,
            limit,
            offset,
            has_more,
            next_offset: has_more.then_some(offset + limit),
        }
    }

    /// Cancel a job. Queued → immediately canceled; running → best-effort
    /// via the shared flag; terminal → no-op returning the current status.
    /// Returns `None` for an unknown id.
    pub fn cancel(&self, job_id: &str) -> Option<JobStatus> {
        let mut table = self.inner.lock();
        let entry = table.jobs.get_mut(job_id)?;
        if entry.record.status.is_terminal() {
            return Some(entry.record.status);
        }
        entry.cancel.store(true, Ordering::SeqCst);
        entry.record.status = JobStatus::Canceled;
        entry.record.finished_at = Some(utcnow_iso());
        if entry.record.progress_message.is_none() {
            entry.record.progress_message = Some("Canceled".to_string());
        }
        Some(JobStatus::Canceled)
    }

    /// Worker side: transition a dequeued job to `running`. Returns `None`
    /// when the job was canceled while queued (the worker skips it).
    pub fn begin(&self, job_id: &str) -> Option<(JobKind, Value, ProgressHandle)> {
        let (kind, params, cancel) = {
            let mut table = self.inner.lock();
            let entry = table.jobs.get_mut(job_id)?;
            if entry.record.status != JobStatus::Queued {
                return None;
            }
            entry.record.status = JobStatus::Running;
            entry.record.started_at = Some(utcnow_iso());
            entry.record.progress_pct = 1;
            entry.record.progress_message = Some("Job started".to_string());
            let kind: JobKind =
                serde_json::from_value(Value::String(entry.record.kind.clone())).ok()?;
            (kind, entry.record.params.clone(), entry.cancel.clone())
        };
        Some((
            kind,
            params,
            ProgressHandle {
                manager: self.clone(),
                job_id: job_id.to_string(),
                cancel,
            },
        ))
    }

    /// Monotonic progress update within one execution.
    fn set_progress(&self, job_id: &str, pct: u8, message: Option<&str>) {
        let mut table = self.inner.lock();
        if let Some(entry) = table.jobs.get_mut(job_id) {
            if entry.record.status != JobStatus::Running {
                return;
            }
            entry.record.progress_pct = pct.min(100).max(entry.record.progress_pct);
            if let Some(message) = message {
                entry.record.progress_message = Some(message.to_string());
            }
        }
    }

    /// Worker side: record a successful result — unless a cancel arrived
    /// during execution, in which case the result is discarded and the
    /// status stays `canceled`.
    pub fn finish_ok(&self, job_id: &str, result: Value) {
        let mut table = self.inner.lock();
        if let Some(entry) = table.jobs.get_mut(job_id) {
            if entry.record.status != JobStatus::Running {
                return;
            }
            entry.record.status = JobStatus::Done;
            entry.record.progress_pct = 100;
            if entry.record.progress_message.is_none() {
                entry.record.progress_message = Some("Completed".to_string());
            }
            entry.record.result = Some(result);
            entry.record.finished_at = Some(utcnow_iso());
        }
        table.prune();
    }

    /// Worker side: record a failure — unless the job was canceled.
    pub fn finish_err(&self, job_id: &str, error: &EngineError) {
        let mut table = self.inner.lock();
        if let Some(entry) = table.jobs.get_mut(job_id) {
            if entry.record.status != JobStatus::Running {
                return;
            }
            entry.record.status = JobStatus::Error;
            entry.record.error = Some(error.to_string());
            entry.record.error_code = Some(error.code().to_string());
            entry.record.finished_at = Some(utcnow_iso());
            if entry.record.progress_message.is_none() {
                entry.record.progress_message = Some("Failed".to_string());
            }
        }
        table.prune();
    }
}

// ---------------------------------------------------------------------------
// Per-kind parameter shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ImportJobParams {
    pub mode: ImportMode,
    pub path: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub doc_role: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub tei_unit: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurateJobParams {
    pub rules: Vec<CurationRule>,
    #[serde(default)]
    pub doc_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidateMetaJobParams {
    #[serde(default)]
    pub doc_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentJobParams {
    pub doc_id: i64,
    #[serde(default)]
    pub lang: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportTeiJobParams {
    pub out_dir: String,
    #[serde(default)]
    pub doc_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub include_structure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportAlignCsvJobParams {
    pub out_path: String,
    #[serde(flatten)]
    pub filter: AlignCsvParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportRunReportJobParams {
    pub out_path: String,
    #[serde(default)]
    pub format: Option<ReportFormat>,
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Validate a job's parameter object against its kind's shape. Called at
/// enqueue time so malformed jobs are rejected synchronously.
pub fn validate_params(kind: JobKind, params: &Value) -> Result<(), EngineError> {
    if !params.is_object() {
        return Err(EngineError::validation("params must be a JSON object"));
    }
    let invalid = |e: serde_json::Error| {
        EngineError::validation(format!("{} job params invalid: {}", kind.as_str(), e))
    };
    match kind {
        JobKind::Import => {
            let parsed: ImportJobParams =
                serde_json::from_value(params.clone()).map_err(invalid)?;
            if parsed.path.trim().is_empty() {
                return Err(EngineError::validation("import job requires params.path"));
            }
            if parsed.mode != ImportMode::Tei
                && parsed.language.as_deref().map_or(true, |l| l.trim().is_empty())
            {
                return Err(EngineError::validation(
                    "import job requires params.language for non-TEI modes",
                ));
            }
            if let Some(ref tei_unit) = parsed.tei_unit {
                if tei_unit != "p" && tei_unit != "s" {
                    return Err(EngineError::validation("tei_unit must be 'p' or 's'"));
                }
            }
        }
        JobKind::Index => {}
        JobKind::Curate => {
            let parsed: CurateJobParams =
                serde_json::from_value(params.clone()).map_err(invalid)?;
            crate::curation::compile_rules(&parsed.rules)?;
        }
        JobKind::ValidateMeta => {
            let _: ValidateMetaJobParams =
                serde_json::from_value(params.clone()).map_err(invalid)?;
        }
        JobKind::Segment => {
            let _: SegmentJobParams = serde_json::from_value(params.clone()).map_err(invalid)?;
        }
        JobKind::Align => {
            let parsed: AlignParams = serde_json::from_value(params.clone()).map_err(invalid)?;
            parsed.validate()?;
        }
        JobKind::ExportTei => {
            let parsed: ExportTeiJobParams =
                serde_json::from_value(params.clone()).map_err(invalid)?;
            if parsed.out_dir.trim().is_empty() {
                return Err(EngineError::validation("export_tei job requires params.out_dir"));
            }
        }
        JobKind::ExportAlignCsv => {
            let parsed: ExportAlignCsvJobParams =
                serde_json::from_value(params.clone()).map_err(invalid)?;
            if parsed.out_path.trim().is_empty() {
                return Err(EngineError::validation(
                    "export_align_csv job requires params.out_path",
                ));
            }
        }
        JobKind::ExportRunReport => {
            let parsed: ExportRunReportJobParams =
                serde_json::from_value(params.clone()).map_err(invalid)?;
            if parsed.out_path.trim().is_empty() {
                return Err(EngineError::validation(
                    "export_run_report job requires params.out_path",
                ));
            }
        }
    }
    Ok(())
}
