//! Leaderboard store
//!
//! Durable store first, cache second. The durable compare-and-update is the
//! only arbiter; the cache mirrors accepted entries and serves reads when it
//! can, otherwise reads go to the durable ranking with the same ordering.

use crate::config::types::{EvalError, JobId, Result};
use crate::store::cache::RankCache;
use crate::store::durable::{DurableStore, LeaderboardCandidate, LeaderboardEntry};
use std::sync::Arc;

pub struct LeaderboardStore {
    durable: Arc<dyn DurableStore>,
    cache: RankCache,
}

impl LeaderboardStore {
    pub fn new(durable: Arc<dyn DurableStore>, cache_enabled: bool) -> Self {
        Self {
            durable,
            cache: RankCache::new(cache_enabled),
        }
    }

    /// Offer a score. Returns true when the submitter's entry changed.
    pub fn submit(&self, candidate: &LeaderboardCandidate, job_id: &JobId) -> Result<bool> {
        if !candidate.score.is_finite() {
            return Err(EvalError::InvalidScore(candidate.score));
        }

        let mut entry = candidate.clone().into_entry(job_id.clone());
        // -0.0 and 0.0 must rank identically in SQLite and in memory
        entry.score += 0.0;

        let applied = self.durable.compare_and_update(&entry)?;
        if applied {
            self.cache.apply(&entry);
            log::info!(
                "Leaderboard {} updated: {} -> {} (job {})",
                entry.environment_id,
                entry.submitter_id,
                entry.score,
                job_id
            );
        } else {
            log::debug!(
                "Leaderboard {} unchanged for {} (job {}, score {})",
                entry.environment_id,
                entry.submitter_id,
                job_id,
                entry.score
            );
        }
        Ok(applied)
    }

    /// Ranked entries, best first. `limit` of `None` returns the whole board.
    pub fn query(&self, environment_id: &str, limit: Option<usize>) -> Result<Vec<LeaderboardEntry>> {
        if let Some(hit) = self.cache.top(environment_id, limit) {
            return Ok(hit);
        }

        let durable = Arc::clone(&self.durable);
        match self
            .cache
            .hydrate(environment_id, || durable.ranking(environment_id, None))?
        {
            Some(mut board) => {
                if let Some(limit) = limit {
                    board.truncate(limit);
                }
                Ok(board)
            }
            None => self.durable.ranking(environment_id, limit),
        }
    }

    /// Ranking straight from durable storage, bypassing the cache
    pub fn query_durable(
        &self,
        environment_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<LeaderboardEntry>> {
        self.durable.ranking(environment_id, limit)
    }

    pub fn entry(&self, environment_id: &str, submitter_id: &str) -> Result<Option<LeaderboardEntry>> {
        self.durable.leaderboard_entry(environment_id, submitter_id)
    }

    /// Rebuild one cached board from durable storage
    pub fn reconcile(&self, environment_id: &str) -> Result<usize> {
        let durable = Arc::clone(&self.durable);
        let count = self
            .cache
            .reconcile(environment_id, || durable.ranking(environment_id, None))?;
        log::info!("Reconciled leaderboard cache for {} ({} entries)", environment_id, count);
        Ok(count)
    }

    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache.set_available(enabled);
        log::info!("Leaderboard cache {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::SubmissionId;
    use crate::store::sqlite::SqliteStore;
    use crate::verdict::result::now_micros;

    fn store(cache: bool) -> LeaderboardStore {
        LeaderboardStore::new(Arc::new(SqliteStore::open_in_memory().expect("open")), cache)
    }

    fn candidate(submitter: &str, score: f64) -> LeaderboardCandidate {
        LeaderboardCandidate {
            environment_id: "LunarLander-v2".to_string(),
            submitter_id: submitter.to_string(),
            score,
            algorithm: "sac".to_string(),
            submission_id: SubmissionId::new(),
            achieved_at: now_micros(),
        }
    }

    #[test]
    fn test_submit_rejects_non_finite_scores() {
        let board = store(true);
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = board.submit(&candidate("a", bad), &JobId::new()).unwrap_err();
            assert!(matches!(err, EvalError::InvalidScore(_)));
        }
    }

    #[test]
    fn test_cache_tracks_writes_after_hydration() {
        let board = store(true);
        board.submit(&candidate("alice", 1.0), &JobId::new()).expect("submit");
        assert_eq!(board.query("LunarLander-v2", None).expect("query").len(), 1);

        board.submit(&candidate("bob", 2.0), &JobId::new()).expect("submit");
        let ranked = board.query("LunarLander-v2", None).expect("query");
        assert_eq!(ranked[0].submitter_id, "bob");
        assert_eq!(ranked, board.query_durable("LunarLander-v2", None).expect("durable"));
    }

    #[test]
    fn test_negative_zero_normalised() {
        let board = store(true);
        board.submit(&candidate("alice", -0.0), &JobId::new()).expect("submit");
        let entry = board.entry("LunarLander-v2", "alice").expect("read").expect("present");
        assert!(entry.score.is_sign_positive());
        assert!(!board.submit(&candidate("alice", 0.0), &JobId::new()).expect("tie"));
    }

    #[test]
    fn test_limit_applies_to_cold_and_warm_reads() {
        let board = store(true);
        for (i, who) in ["a", "b", "c"].iter().enumerate() {
            board.submit(&candidate(who, i as f64), &JobId::new()).expect("submit");
        }
        assert_eq!(board.query("LunarLander-v2", Some(2)).expect("cold").len(), 2);
        assert_eq!(board.query("LunarLander-v2", Some(2)).expect("warm").len(), 2);
    }

    #[test]
    fn test_toggle_cache() {
        let board = store(true);
        board.submit(&candidate("a", 3.0), &JobId::new()).expect("submit");
        board.set_cache_enabled(false);
        assert!(!board.cache_enabled());
        assert_eq!(board.query("LunarLander-v2", None).expect("query").len(), 1);
        board.set_cache_enabled(true);
        assert_eq!(board.reconcile("LunarLander-v2").expect("reconcile"), 1);
    }
}
