/// SQLite durable store
///
/// One connection behind a mutex. Leaderboard compare-and-update runs inside a
/// `BEGIN IMMEDIATE` transaction so concurrent writers, in this process or
/// another one sharing the file, serialise per database.
use crate::config::types::{EvalError, JobId, JobState, Result, SubmissionId};
use crate::store::durable::{DurableStore, LeaderboardEntry};
use crate::verdict::result::{now_micros, EvaluationResult};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path).map_err(|e| {
            EvalError::Persistence(format!("open sqlite db {}: {}", db_path.display(), e))
        })?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("sqlite journal_mode={} for {}", mode, db_path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let init_sql = include_str!("../../migrations/0001_init.sql");
        conn.execute_batch(init_sql)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EvalError::Persistence("sqlite connection lock poisoned".to_string()))
    }

    fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LeaderboardEntry> {
        Ok(LeaderboardEntry {
            environment_id: row.get(0)?,
            submitter_id: row.get(1)?,
            score: row.get(2)?,
            algorithm: row.get(3)?,
            achieved_at: from_micros(row.get(4)?),
            submission_id: SubmissionId::from(row.get::<_, String>(5)?),
            job_id: JobId::from(row.get::<_, String>(6)?),
        })
    }
}

const ENTRY_COLUMNS: &str =
    "environment_id, submitter_id, score, algorithm, achieved_at_us, submission_id, job_id";

fn from_micros(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros)
        .single()
        .unwrap_or_default()
}

impl DurableStore for SqliteStore {
    fn job_state(&self, job_id: &JobId) -> Result<Option<JobState>> {
        let conn = self.lock()?;
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM jobs WHERE job_id = ?1",
                params![job_id.as_str()],
                |r| r.get(0),
            )
            .optional()?;

        match state {
            None => Ok(None),
            Some(raw) => JobState::parse(&raw).map(Some).ok_or_else(|| {
                EvalError::Persistence(format!("job {} has unknown state '{}'", job_id, raw))
            }),
        }
    }

    fn set_job_state(
        &self,
        job_id: &JobId,
        submission_id: &SubmissionId,
        state: JobState,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "INSERT INTO jobs (job_id, submission_id, state, attempts, updated_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (job_id) DO UPDATE SET
                 state = excluded.state,
                 attempts = jobs.attempts + excluded.attempts,
                 updated_at_us = excluded.updated_at_us
             WHERE jobs.state NOT IN ('succeeded', 'failed')",
            params![
                job_id.as_str(),
                submission_id.as_str(),
                state.as_str(),
                (state == JobState::Running) as i64,
                now_micros().timestamp_micros(),
            ],
        )?;
        Ok(changed > 0)
    }

    fn save_result(
        &self,
        job_id: &JobId,
        submission_id: &SubmissionId,
        result: &EvaluationResult,
    ) -> Result<bool> {
        let result_json = serde_json::to_string(result)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO evaluation_results
                 (job_id, submission_id, status, score, failure_reason,
                  entry_fingerprint, completed_at_us, result_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job_id.as_str(),
                submission_id.as_str(),
                result.status().as_str(),
                result.score(),
                result.failure_reason().map(|r| r.as_str()),
                result.entry_fingerprint(),
                result.completed_at().timestamp_micros(),
                result_json,
            ],
        )?;

        if inserted > 0 {
            if let Some(metrics) = result.metrics() {
                let mut stmt = tx.prepare(
                    "INSERT INTO evaluation_metrics (job_id, step, value) VALUES (?1, ?2, ?3)",
                )?;
                for (step, value) in metrics.iter().enumerate() {
                    stmt.execute(params![job_id.as_str(), step as i64, value])?;
                }
            }
        }

        tx.commit()?;
        Ok(inserted > 0)
    }

    fn load_result(&self, job_id: &JobId) -> Result<Option<EvaluationResult>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT result_json FROM evaluation_results WHERE job_id = ?1",
                params![job_id.as_str()],
                |r| r.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json).map_err(|e| {
                EvalError::Persistence(format!("corrupt result for job {}: {}", job_id, e))
            })?)),
            None => Ok(None),
        }
    }

    fn compare_and_update(&self, entry: &LeaderboardEntry) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let seen: Option<i64> = tx
            .query_row(
                "SELECT applied FROM leaderboard_submissions WHERE job_id = ?1",
                params![entry.job_id.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        if seen.is_some() {
            tx.commit()?;
            return Ok(false);
        }

        let changed = tx.execute(
            "INSERT INTO leaderboard_entries
                 (environment_id, submitter_id, score, algorithm,
                  achieved_at_us, submission_id, job_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (environment_id, submitter_id) DO UPDATE SET
                 score = excluded.score,
                 algorithm = excluded.algorithm,
                 achieved_at_us = excluded.achieved_at_us,
                 submission_id = excluded.submission_id,
                 job_id = excluded.job_id
             WHERE excluded.score > leaderboard_entries.score",
            params![
                entry.environment_id,
                entry.submitter_id,
                entry.score,
                entry.algorithm,
                entry.achieved_at.timestamp_micros(),
                entry.submission_id.as_str(),
                entry.job_id.as_str(),
            ],
        )?;

        tx.execute(
            "INSERT INTO leaderboard_submissions
                 (job_id, environment_id, submitter_id, score, applied, recorded_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.job_id.as_str(),
                entry.environment_id,
                entry.submitter_id,
                entry.score,
                (changed > 0) as i64,
                now_micros().timestamp_micros(),
            ],
        )?;

        tx.commit()?;
        Ok(changed > 0)
    }

    fn ranking(&self, environment_id: &str, limit: Option<usize>) -> Result<Vec<LeaderboardEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM leaderboard_entries
             WHERE environment_id = ?1
             ORDER BY score DESC, achieved_at_us ASC, submitter_id ASC
             LIMIT ?2",
            ENTRY_COLUMNS
        );
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![environment_id, limit], Self::entry_from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn leaderboard_entry(
        &self,
        environment_id: &str,
        submitter_id: &str,
    ) -> Result<Option<LeaderboardEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM leaderboard_entries WHERE environment_id = ?1 AND submitter_id = ?2",
            ENTRY_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![environment_id, submitter_id], Self::entry_from_row)
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::result::{FailureReason, RunEvidence};

    fn entry(submitter: &str, score: f64, job: &str) -> LeaderboardEntry {
        LeaderboardEntry {
            environment_id: "CartPole-v1".to_string(),
            submitter_id: submitter.to_string(),
            score,
            algorithm: "ppo".to_string(),
            achieved_at: now_micros(),
            submission_id: SubmissionId::new(),
            job_id: JobId::from(job),
        }
    }

    #[test]
    fn test_job_state_upsert_and_terminal_lock() {
        let store = SqliteStore::open_in_memory().expect("open");
        let job = JobId::new();
        let sub = SubmissionId::new();

        assert_eq!(store.job_state(&job).expect("state"), None);
        assert!(store.set_job_state(&job, &sub, JobState::Queued).expect("queued"));
        assert!(store.set_job_state(&job, &sub, JobState::Running).expect("running"));
        assert!(store.set_job_state(&job, &sub, JobState::Succeeded).expect("done"));
        assert!(!store.set_job_state(&job, &sub, JobState::Running).expect("locked"));
        assert_eq!(store.job_state(&job).expect("state"), Some(JobState::Succeeded));
    }

    #[test]
    fn test_result_saved_once() {
        let store = SqliteStore::open_in_memory().expect("open");
        let job = JobId::new();
        let sub = SubmissionId::new();
        let first = EvaluationResult::succeeded(1.5, Some(vec![0.5, 1.0]), RunEvidence::default());
        let second =
            EvaluationResult::failed(FailureReason::Timeout, "late", RunEvidence::default());

        assert!(store.save_result(&job, &sub, &first).expect("save"));
        assert!(!store.save_result(&job, &sub, &second).expect("second save"));
        assert_eq!(store.load_result(&job).expect("load"), Some(first));
        assert_eq!(store.load_result(&JobId::new()).expect("load"), None);
    }

    #[test]
    fn test_compare_and_update_rules() {
        let store = SqliteStore::open_in_memory().expect("open");

        assert!(store.compare_and_update(&entry("alice", 5.0, "j1")).expect("insert"));
        assert!(!store.compare_and_update(&entry("alice", 4.0, "j2")).expect("lower"));
        assert!(!store.compare_and_update(&entry("alice", 5.0, "j3")).expect("tie"));
        assert!(store.compare_and_update(&entry("alice", 6.0, "j4")).expect("higher"));
        // Same job id again is a no-op even with a better score
        assert!(!store.compare_and_update(&entry("alice", 99.0, "j4")).expect("replay"));

        let current = store
            .leaderboard_entry("CartPole-v1", "alice")
            .expect("read")
            .expect("present");
        assert_eq!(current.score, 6.0);
        assert_eq!(current.job_id.as_str(), "j4");
    }

    #[test]
    fn test_ranking_order_and_limit() {
        let store = SqliteStore::open_in_memory().expect("open");
        store.compare_and_update(&entry("alice", 3.0, "a")).expect("a");
        store.compare_and_update(&entry("bob", 7.0, "b")).expect("b");
        store.compare_and_update(&entry("carol", 5.0, "c")).expect("c");

        let all = store.ranking("CartPole-v1", None).expect("ranking");
        let names: Vec<&str> = all.iter().map(|e| e.submitter_id.as_str()).collect();
        assert_eq!(names, vec!["bob", "carol", "alice"]);

        let top = store.ranking("CartPole-v1", Some(1)).expect("top");
        assert_eq!(top.len(), 1);
        assert!(store.ranking("Pong", None).expect("empty").is_empty());
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("evalbox.db");
        {
            let store = SqliteStore::open(&path).expect("open");
            store.compare_and_update(&entry("alice", 2.0, "j")).expect("cas");
        }
        let store = SqliteStore::open(&path).expect("reopen");
        assert_eq!(store.ranking("CartPole-v1", None).expect("ranking").len(), 1);
    }
}
