/// Evaluation audit trail
///
/// Structured JSON events for every job and run transition, correlated by
/// job, submission and run id. Events always go to the `evalbox::audit` log
/// target; when an audit file is configured they are also appended there, one
/// JSON object per line.
use crate::config::types::{EvalError, JobId, Result, SubmissionId};
use crate::verdict::result::now_micros;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

pub const AUDIT_TARGET: &str = "evalbox::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    // Job lifecycle
    JobQueued,
    JobStarted,
    JobSucceeded,
    JobFailed,
    JobRequeued,
    JobDeadLettered,
    DuplicateDelivery,

    // Run lifecycle
    SubmissionRejected,
    SandboxUnavailable,
    RunStarted,
    RunTimedOut,
    RunFinished,
    OutputTruncated,
    CleanupFailure,

    // Leaderboard
    LeaderboardUpdated,
    CacheDisabled,
}

impl AuditEventKind {
    pub fn default_severity(self) -> AuditSeverity {
        match self {
            AuditEventKind::JobQueued
            | AuditEventKind::JobStarted
            | AuditEventKind::JobSucceeded
            | AuditEventKind::RunStarted
            | AuditEventKind::RunFinished
            | AuditEventKind::LeaderboardUpdated
            | AuditEventKind::DuplicateDelivery => AuditSeverity::Low,

            AuditEventKind::JobFailed
            | AuditEventKind::SubmissionRejected
            | AuditEventKind::OutputTruncated
            | AuditEventKind::JobRequeued => AuditSeverity::Medium,

            AuditEventKind::RunTimedOut
            | AuditEventKind::SandboxUnavailable
            | AuditEventKind::CacheDisabled => AuditSeverity::High,

            AuditEventKind::JobDeadLettered | AuditEventKind::CleanupFailure => {
                AuditSeverity::Critical
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditEventKind,
    pub severity: AuditSeverity,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, detail: impl Into<String>) -> Self {
        Self {
            timestamp: now_micros(),
            kind,
            severity: kind.default_severity(),
            detail: detail.into(),
            job_id: None,
            submission_id: None,
            run_id: None,
            attempt: None,
        }
    }

    pub fn with_job(mut self, job_id: &JobId) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }

    pub fn with_submission(mut self, submission_id: &SubmissionId) -> Self {
        self.submission_id = Some(submission_id.to_string());
        self
    }

    pub fn with_run(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"kind\":\"{:?}\",\"detail\":\"unserializable\"}}", self.kind)
        })
    }

    /// Log and, if a sink is installed, append to the audit file
    pub fn emit(self) {
        let line = self.to_json();
        match self.severity {
            AuditSeverity::Critical | AuditSeverity::High => {
                log::warn!(target: AUDIT_TARGET, "{}", line)
            }
            AuditSeverity::Medium | AuditSeverity::Low => {
                log::info!(target: AUDIT_TARGET, "{}", line)
            }
        }
        if let Some(sink) = AUDIT_SINK.get() {
            sink.append(&line);
        }
    }
}

/// Append-only JSONL audit file
pub struct AuditSink {
    file: Mutex<File>,
    path: PathBuf,
}

impl AuditSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EvalError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| EvalError::Config(format!("Failed to open audit log: {}", e)))?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) {
        match self.file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                    log::error!("Failed to write audit log {}: {}", self.path.display(), e);
                }
            }
            Err(_) => log::error!("Audit log lock poisoned"),
        }
    }
}

static AUDIT_SINK: OnceLock<AuditSink> = OnceLock::new();

/// Install the process-wide audit file. A second call keeps the first sink.
pub fn init_audit_file(path: &Path) -> Result<()> {
    let sink = AuditSink::open(path)?;
    if AUDIT_SINK.set(sink).is_err() {
        log::warn!("Audit log already initialized, ignoring {}", path.display());
    } else {
        log::info!("Audit log at {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_event_json_carries_correlation_ids() {
        let job = JobId::from("job-1");
        let sub = SubmissionId::from("sub-1");
        let event = AuditEvent::new(AuditEventKind::RunStarted, "launching")
            .with_job(&job)
            .with_submission(&sub)
            .with_run("run-1")
            .with_attempt(2);

        let value: serde_json::Value = serde_json::from_str(&event.to_json()).expect("json");
        assert_eq!(value["kind"], "run_started");
        assert_eq!(value["severity"], "low");
        assert_eq!(value["job_id"], "job-1");
        assert_eq!(value["submission_id"], "sub-1");
        assert_eq!(value["run_id"], "run-1");
        assert_eq!(value["attempt"], 2);
    }

    #[test]
    fn test_absent_ids_are_omitted() {
        let event = AuditEvent::new(AuditEventKind::CacheDisabled, "poisoned");
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).expect("json");
        assert!(value.get("job_id").is_none());
        assert_eq!(value["severity"], "high");
    }

    #[test]
    fn test_severity_override() {
        let event = AuditEvent::new(AuditEventKind::JobFailed, "x")
            .with_severity(AuditSeverity::Critical);
        assert_eq!(event.severity, AuditSeverity::Critical);
        assert_eq!(
            AuditEventKind::JobDeadLettered.default_severity(),
            AuditSeverity::Critical
        );
    }

    #[test]
    fn test_sink_appends_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit").join("events.jsonl");
        let sink = AuditSink::open(&path).expect("open");
        sink.append("{\"a\":1}");
        sink.append("{\"b\":2}");

        let mut contents = String::new();
        File::open(sink.path())
            .expect("open")
            .read_to_string(&mut contents)
            .expect("read");
        assert_eq!(contents.lines().count(), 2);
    }
}
