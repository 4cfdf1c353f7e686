//! Durable storage contract
//!
//! Everything the worker and the leaderboard need to survive a restart:
//! job states, immutable results, and the authoritative leaderboard with its
//! compare-and-update primitive.

use crate::config::types::{JobId, JobState, Result, SubmissionId};
use crate::verdict::result::EvaluationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A score offered to the leaderboard
#[derive(Debug, Clone, PartialEq)]
pub struct LeaderboardCandidate {
    pub environment_id: String,
    pub submitter_id: String,
    pub score: f64,
    pub algorithm: String,
    pub submission_id: SubmissionId,
    pub achieved_at: DateTime<Utc>,
}

impl LeaderboardCandidate {
    pub fn into_entry(self, job_id: JobId) -> LeaderboardEntry {
        LeaderboardEntry {
            environment_id: self.environment_id,
            submitter_id: self.submitter_id,
            score: self.score,
            algorithm: self.algorithm,
            achieved_at: self.achieved_at,
            submission_id: self.submission_id,
            job_id,
        }
    }
}

/// Best score of one submitter in one environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub environment_id: String,
    pub submitter_id: String,
    pub score: f64,
    pub algorithm: String,
    pub achieved_at: DateTime<Utc>,
    pub submission_id: SubmissionId,
    /// Job that applied this score
    pub job_id: JobId,
}

impl LeaderboardEntry {
    /// Compare-and-update rule: strictly higher score replaces, ties keep the incumbent
    pub fn improves_on(&self, current: &LeaderboardEntry) -> bool {
        self.score > current.score
    }
}

/// Ranking order shared by every read path:
/// score descending, then earlier achievement, then submitter id.
pub fn rank_order(a: &LeaderboardEntry, b: &LeaderboardEntry) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.achieved_at.cmp(&b.achieved_at))
        .then_with(|| a.submitter_id.cmp(&b.submitter_id))
}

/// Durable storage keyed by job id, plus the authoritative leaderboard
pub trait DurableStore: Send + Sync {
    fn job_state(&self, job_id: &JobId) -> Result<Option<JobState>>;

    /// Upsert a job's state. Terminal states are never overwritten; returns
    /// false when the stored state was already terminal.
    fn set_job_state(
        &self,
        job_id: &JobId,
        submission_id: &SubmissionId,
        state: JobState,
    ) -> Result<bool>;

    /// Insert once. Returns false when a result for the job already exists.
    fn save_result(
        &self,
        job_id: &JobId,
        submission_id: &SubmissionId,
        result: &EvaluationResult,
    ) -> Result<bool>;

    fn load_result(&self, job_id: &JobId) -> Result<Option<EvaluationResult>>;

    /// Atomic per key: insert when absent, replace on strictly higher score.
    /// A job id already seen is a no-op. Returns whether the entry changed.
    fn compare_and_update(&self, entry: &LeaderboardEntry) -> Result<bool>;

    /// Entries of one environment in `rank_order`
    fn ranking(&self, environment_id: &str, limit: Option<usize>) -> Result<Vec<LeaderboardEntry>>;

    fn leaderboard_entry(
        &self,
        environment_id: &str,
        submitter_id: &str,
    ) -> Result<Option<LeaderboardEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(submitter: &str, score: f64, at_secs: i64) -> LeaderboardEntry {
        LeaderboardEntry {
            environment_id: "Pong".to_string(),
            submitter_id: submitter.to_string(),
            score,
            algorithm: "ppo".to_string(),
            achieved_at: Utc.timestamp_opt(at_secs, 0).single().expect("timestamp"),
            submission_id: SubmissionId::new(),
            job_id: JobId::new(),
        }
    }

    #[test]
    fn test_rank_order_score_then_time_then_submitter() {
        let mut entries = vec![
            entry("carol", 5.0, 30),
            entry("bob", 9.0, 20),
            entry("alice", 9.0, 20),
            entry("dave", 9.0, 10),
        ];
        entries.sort_by(rank_order);
        let order: Vec<&str> = entries.iter().map(|e| e.submitter_id.as_str()).collect();
        assert_eq!(order, vec!["dave", "alice", "bob", "carol"]);
    }

    #[test]
    fn test_tie_does_not_improve() {
        let current = entry("alice", 9.0, 10);
        assert!(!entry("alice", 9.0, 20).improves_on(&current));
        assert!(entry("alice", 9.5, 20).improves_on(&current));
        assert!(!entry("alice", 1.0, 20).improves_on(&current));
    }
}
