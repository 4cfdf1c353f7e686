//! In-memory rank cache
//!
//! A derived view of the durable leaderboard. Each environment board keeps a
//! sorted set of rank keys plus the best entry per submitter. The cache never
//! decides anything: durable writes happen first and the cache only mirrors
//! entries the durable store accepted. Any doubt (lock poisoned, board not
//! hydrated, cache switched off) is reported as a miss so callers fall back
//! to the durable ranking.

use crate::config::types::Result;
use crate::observability::audit::{AuditEvent, AuditEventKind};
use crate::store::durable::{rank_order, LeaderboardEntry};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::RwLock;

/// Sort key with the same ordering as `rank_order`
#[derive(Debug, Clone)]
struct RankKey(LeaderboardEntry);

impl PartialEq for RankKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RankKey {}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        rank_order(&self.0, &other.0)
    }
}

#[derive(Debug, Default)]
struct Board {
    ranked: BTreeSet<RankKey>,
    entries: HashMap<String, LeaderboardEntry>,
}

impl Board {
    fn from_entries(entries: Vec<LeaderboardEntry>) -> Self {
        let mut board = Board::default();
        for entry in entries {
            board.merge(entry);
        }
        board
    }

    /// Keep the better of the stored and the offered entry for the submitter
    fn merge(&mut self, entry: LeaderboardEntry) -> bool {
        if let Some(current) = self.entries.get(&entry.submitter_id) {
            if !entry.improves_on(current) {
                return false;
            }
            let stale = RankKey(current.clone());
            self.ranked.remove(&stale);
        }
        self.ranked.insert(RankKey(entry.clone()));
        self.entries.insert(entry.submitter_id.clone(), entry);
        true
    }

    fn top(&self, limit: Option<usize>) -> Vec<LeaderboardEntry> {
        let take = limit.unwrap_or(usize::MAX);
        self.ranked.iter().take(take).map(|k| k.0.clone()).collect()
    }
}

pub struct RankCache {
    boards: RwLock<HashMap<String, Board>>,
    available: AtomicBool,
}

impl RankCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            boards: RwLock::new(HashMap::new()),
            available: AtomicBool::new(enabled),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(AtomicOrdering::Acquire)
    }

    /// Disabling drops every board; re-enabling starts cold.
    pub fn set_available(&self, available: bool) {
        if !available {
            if let Ok(mut boards) = self.boards.write() {
                boards.clear();
            }
        }
        self.available.store(available, AtomicOrdering::Release);
    }

    /// Mirror an entry the durable store accepted. Only boards that were
    /// already hydrated are touched; a cold board is loaded on the next read.
    pub fn apply(&self, entry: &LeaderboardEntry) -> bool {
        if !self.is_available() {
            return false;
        }
        let mut boards = match self.boards.write() {
            Ok(boards) => boards,
            Err(_) => {
                log::warn!("rank cache lock poisoned, disabling cache");
                AuditEvent::new(AuditEventKind::CacheDisabled, "rank cache lock poisoned").emit();
                self.available.store(false, AtomicOrdering::Release);
                return false;
            }
        };
        match boards.get_mut(&entry.environment_id) {
            Some(board) => board.merge(entry.clone()),
            None => false,
        }
    }

    /// Ranked entries for an environment, or `None` on a miss
    pub fn top(&self, environment_id: &str, limit: Option<usize>) -> Option<Vec<LeaderboardEntry>> {
        if !self.is_available() {
            return None;
        }
        let boards = self.boards.read().ok()?;
        boards.get(environment_id).map(|b| b.top(limit))
    }

    /// Load a board from the durable ranking. Runs under the write lock so a
    /// concurrent `apply` lands either before the load (and is in the loaded
    /// rows) or after it (and merges on top).
    pub fn hydrate<F>(&self, environment_id: &str, loader: F) -> Result<Option<Vec<LeaderboardEntry>>>
    where
        F: FnOnce() -> Result<Vec<LeaderboardEntry>>,
    {
        if !self.is_available() {
            return Ok(None);
        }
        let mut boards = match self.boards.write() {
            Ok(boards) => boards,
            Err(_) => return Ok(None),
        };
        if !boards.contains_key(environment_id) {
            let entries = loader()?;
            log::debug!(
                "hydrated rank cache for {} with {} entries",
                environment_id,
                entries.len()
            );
            boards.insert(environment_id.to_string(), Board::from_entries(entries));
        }
        Ok(boards.get(environment_id).map(|b| b.top(None)))
    }

    /// Drop one board so the next read reloads it from durable storage
    pub fn invalidate(&self, environment_id: &str) {
        if let Ok(mut boards) = self.boards.write() {
            boards.remove(environment_id);
        }
    }

    /// Replace a board with a fresh durable snapshot
    pub fn reconcile<F>(&self, environment_id: &str, loader: F) -> Result<usize>
    where
        F: FnOnce() -> Result<Vec<LeaderboardEntry>>,
    {
        if !self.is_available() {
            return loader().map(|entries| entries.len());
        }
        let mut boards = match self.boards.write() {
            Ok(boards) => boards,
            Err(poisoned) => {
                // The map is rebuilt wholesale, so a poisoned guard is safe to reuse
                let mut boards = poisoned.into_inner();
                boards.clear();
                boards
            }
        };
        let entries = loader()?;
        let count = entries.len();
        boards.insert(environment_id.to_string(), Board::from_entries(entries));
        Ok(count)
    }

    pub fn hydrated_environments(&self) -> Vec<String> {
        match self.boards.read() {
            Ok(boards) => {
                let mut envs: Vec<String> = boards.keys().cloned().collect();
                envs.sort();
                envs
            }
            Err(_) => Vec::new(),
        }
    }
}

impl Default for RankCache {
    fn default() -> Self {
        Self::new(true)
    }
}
