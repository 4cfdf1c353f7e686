//! Leaderboard consistency under repeated and concurrent writes

use chrono::{DateTime, Duration, TimeZone, Utc};
use evalbox::config::types::{JobId, SubmissionId};
use evalbox::store::durable::{DurableStore, LeaderboardCandidate, LeaderboardEntry};
use evalbox::store::{LeaderboardStore, SqliteStore};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

const ENV: &str = "LunarLander-v2";

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn candidate(submitter: &str, score: f64, offset_us: i64) -> LeaderboardCandidate {
    LeaderboardCandidate {
        environment_id: ENV.to_string(),
        submitter_id: submitter.to_string(),
        score,
        algorithm: "dqn".to_string(),
        submission_id: SubmissionId::new(),
        achieved_at: base_time() + Duration::microseconds(offset_us),
    }
}

fn file_store(dir: &TempDir) -> Arc<dyn DurableStore> {
    Arc::new(SqliteStore::open(&dir.path().join("board.db")).expect("open db"))
}

fn scores(entries: &[LeaderboardEntry]) -> Vec<(String, f64)> {
    entries
        .iter()
        .map(|e| (e.submitter_id.clone(), e.score))
        .collect()
}

#[test]
fn test_replayed_job_is_a_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let board = LeaderboardStore::new(file_store(&dir), true);
    let job = JobId::new();

    assert!(board.submit(&candidate("alice", 10.0, 0), &job).expect("submit"));
    let before = board.query(ENV, None).expect("query");

    for _ in 0..3 {
        assert!(!board.submit(&candidate("alice", 10.0, 5), &job).expect("replay"));
    }
    assert_eq!(board.query(ENV, None).expect("query"), before);
    assert_eq!(board.query_durable(ENV, None).expect("query"), before);
}

#[test]
fn test_replay_cannot_raise_score() {
    let dir = tempfile::tempdir().expect("tempdir");
    let board = LeaderboardStore::new(file_store(&dir), true);
    let job = JobId::new();

    board.submit(&candidate("alice", 10.0, 0), &job).expect("submit");
    // Same job id, different payload: the ledger already holds the job
    assert!(!board.submit(&candidate("alice", 99.0, 1), &job).expect("replay"));

    let entry = board.entry(ENV, "alice").expect("entry").expect("present");
    assert_eq!(entry.score, 10.0);
    assert_eq!(entry.job_id, job);
}

#[test]
fn test_tie_keeps_incumbent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let board = LeaderboardStore::new(file_store(&dir), true);
    let first = JobId::new();

    board.submit(&candidate("alice", 7.0, 0), &first).expect("submit");
    assert!(!board.submit(&candidate("alice", 7.0, 100), &JobId::new()).expect("tie"));
    assert!(!board.submit(&candidate("alice", 6.0, 200), &JobId::new()).expect("lower"));

    let entry = board.entry(ENV, "alice").expect("entry").expect("present");
    assert_eq!(entry.job_id, first);
    assert_eq!(entry.achieved_at, base_time());
}

#[test]
fn test_ranking_order_and_tiebreaks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let board = LeaderboardStore::new(file_store(&dir), true);

    board.submit(&candidate("carol", 50.0, 30), &JobId::new()).expect("submit");
    board.submit(&candidate("bob", 50.0, 10), &JobId::new()).expect("submit");
    board.submit(&candidate("alice", 80.0, 40), &JobId::new()).expect("submit");
    board.submit(&candidate("dave", 50.0, 10), &JobId::new()).expect("submit");
    board.submit(&candidate("erin", -5.0, 0), &JobId::new()).expect("submit");

    let expected = vec![
        ("alice".to_string(), 80.0),
        ("bob".to_string(), 50.0),
        ("dave".to_string(), 50.0),
        ("carol".to_string(), 50.0),
        ("erin".to_string(), -5.0),
    ];
    assert_eq!(scores(&board.query(ENV, None).expect("query")), expected);
    assert_eq!(scores(&board.query_durable(ENV, None).expect("query")), expected);
    assert_eq!(
        scores(&board.query(ENV, Some(2)).expect("query")),
        expected[..2].to_vec()
    );
}

#[test]
fn test_concurrent_writers_keep_the_maximum() {
    let dir = tempfile::tempdir().expect("tempdir");
    let board = Arc::new(LeaderboardStore::new(file_store(&dir), true));
    // Warm the cache so concurrent writes go through both layers
    assert!(board.query(ENV, None).expect("query").is_empty());

    let writers = 8;
    let barrier = Arc::new(Barrier::new(writers));
    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let board = Arc::clone(&board);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..25 {
                    // Interleaved so every writer sees both higher and lower scores
                    let score = ((i * writers + w) % 97) as f64;
                    let offset = (w * 1000 + i) as i64;
                    board
                        .submit(&candidate("shared", score, offset), &JobId::new())
                        .expect("submit");
                    board
                        .submit(&candidate(&format!("solo-{}", w), score, offset), &JobId::new())
                        .expect("submit");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer");
    }

    let all_scores: Vec<f64> = (0..writers)
        .flat_map(|w| (0..25).map(move |i| ((i * writers + w) % 97) as f64))
        .collect();
    let best = all_scores.iter().cloned().fold(f64::MIN, f64::max);

    let shared = board.entry(ENV, "shared").expect("entry").expect("present");
    assert_eq!(shared.score, best);

    for w in 0..writers {
        let own_best = (0..25)
            .map(|i| ((i * writers + w) % 97) as f64)
            .fold(f64::MIN, f64::max);
        let solo = board
            .entry(ENV, &format!("solo-{}", w))
            .expect("entry")
            .expect("present");
        assert_eq!(solo.score, own_best);
    }

    assert_eq!(
        board.query(ENV, None).expect("cached"),
        board.query_durable(ENV, None).expect("durable")
    );
}

#[test]
fn test_readers_never_see_a_score_go_down() {
    let dir = tempfile::tempdir().expect("tempdir");
    let board = Arc::new(LeaderboardStore::new(file_store(&dir), true));
    board.submit(&candidate("alice", 0.0, 0), &JobId::new()).expect("seed");

    let writer = {
        let board = Arc::clone(&board);
        thread::spawn(move || {
            for i in 0..200 {
                // Alternating high and low offers
                let score = if i % 2 == 0 { i as f64 } else { (i / 4) as f64 };
                board
                    .submit(&candidate("alice", score, i), &JobId::new())
                    .expect("submit");
            }
        })
    };

    let mut last = f64::MIN;
    while !writer.is_finished() {
        let rows = board.query(ENV, None).expect("query");
        let score = rows[0].score;
        assert!(score >= last, "score went from {} to {}", last, score);
        last = score;
    }
    writer.join().expect("writer");
    assert_eq!(board.entry(ENV, "alice").expect("entry").expect("present").score, 198.0);
}

#[test]
fn test_cached_and_uncached_reads_agree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let durable = file_store(&dir);
    let cached = LeaderboardStore::new(Arc::clone(&durable), true);
    let uncached = LeaderboardStore::new(Arc::clone(&durable), false);
    assert!(!uncached.cache_enabled());

    cached.submit(&candidate("alice", 3.0, 0), &JobId::new()).expect("submit");
    cached.query(ENV, None).expect("hydrate");
    cached.submit(&candidate("bob", 9.0, 1), &JobId::new()).expect("submit");
    cached.submit(&candidate("alice", 12.0, 2), &JobId::new()).expect("submit");

    assert_eq!(
        cached.query(ENV, None).expect("cached"),
        uncached.query(ENV, None).expect("uncached")
    );

    cached.set_cache_enabled(false);
    let disabled = cached.query(ENV, None).expect("after disable");
    cached.set_cache_enabled(true);
    assert_eq!(disabled, cached.query(ENV, None).expect("rehydrated"));
}

#[test]
fn test_second_process_writes_and_reconcile() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ours = LeaderboardStore::new(file_store(&dir), true);
    // Separate connection to the same database, as another worker process would have
    let theirs = LeaderboardStore::new(file_store(&dir), true);

    ours.submit(&candidate("alice", 5.0, 0), &JobId::new()).expect("submit");
    ours.query(ENV, None).expect("hydrate");

    theirs.submit(&candidate("alice", 20.0, 1), &JobId::new()).expect("submit");
    theirs.submit(&candidate("bob", 15.0, 2), &JobId::new()).expect("submit");

    assert_eq!(ours.reconcile(ENV).expect("reconcile"), 2);
    assert_eq!(
        scores(&ours.query(ENV, None).expect("query")),
        vec![("alice".to_string(), 20.0), ("bob".to_string(), 15.0)]
    );
}

#[test]
fn test_concurrent_connections_apply_compare_and_update_atomically() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("board.db");
    SqliteStore::open(&path).expect("create");

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|w| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = SqliteStore::open(&path).expect("open");
                barrier.wait();
                for i in 0..20 {
                    let entry = candidate("alice", (w * 20 + i) as f64, i as i64)
                        .into_entry(JobId::new());
                    store.compare_and_update(&entry).expect("cas");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer");
    }

    let store = SqliteStore::open(&path).expect("reopen");
    let entry = store
        .leaderboard_entry(ENV, "alice")
        .expect("entry")
        .expect("present");
    assert_eq!(entry.score, 79.0);
}

#[test]
fn test_durable_board_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let before = {
        let board = LeaderboardStore::new(file_store(&dir), true);
        board.submit(&candidate("alice", 4.5, 0), &JobId::new()).expect("submit");
        board.submit(&candidate("bob", 6.5, 1), &JobId::new()).expect("submit");
        board.query(ENV, None).expect("query")
    };

    let reopened = LeaderboardStore::new(file_store(&dir), true);
    assert_eq!(reopened.query(ENV, None).expect("query"), before);
}
