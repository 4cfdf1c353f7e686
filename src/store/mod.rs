pub mod cache;
pub mod durable;
pub mod leaderboard;
pub mod sqlite;

pub use durable::{rank_order, DurableStore, LeaderboardCandidate, LeaderboardEntry};
pub use leaderboard::LeaderboardStore;
pub use sqlite::SqliteStore;
