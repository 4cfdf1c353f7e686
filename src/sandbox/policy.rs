//! Declarative execution constraints applied to every submission.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sandbox policy
///
/// One value per process, owned by the harness. There is no per-submission
/// override path: a submission cannot raise its own limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    /// Wall-clock budget enforced by the harness, not the child
    pub wall_timeout_ms: u64,
    /// Memory ceiling in bytes (swap included)
    pub memory_limit_bytes: u64,
    /// Fraction of one CPU (0.5 = half a core)
    pub cpu_share: f64,
    /// Process and thread ceiling
    pub max_processes: u32,
    /// Network access; off for every shipped preset
    pub network_enabled: bool,
    /// Scheduling priority hint, applied as a nice increment
    pub nice: i32,
    /// Open file descriptor ceiling
    pub max_open_files: u64,
    /// Largest file the submission may write, in bytes
    pub max_file_size_bytes: u64,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            wall_timeout_ms: 300_000,
            memory_limit_bytes: 512 * 1024 * 1024,
            cpu_share: 0.5,
            max_processes: 50,
            network_enabled: false,
            nice: 10,
            max_open_files: 256,
            max_file_size_bytes: 64 * 1024 * 1024,
        }
    }
}

impl SandboxPolicy {
    /// Tight envelope for tests and smoke runs
    pub fn strict() -> Self {
        Self {
            wall_timeout_ms: 10_000,
            memory_limit_bytes: 256 * 1024 * 1024,
            cpu_share: 0.5,
            max_processes: 16,
            network_enabled: false,
            nice: 10,
            max_open_files: 64,
            max_file_size_bytes: 8 * 1024 * 1024,
        }
    }

    pub fn wall_timeout(&self) -> Duration {
        Duration::from_millis(self.wall_timeout_ms)
    }

    /// RLIMIT_CPU soft limit for backends without a cgroup.
    /// One second past the wall budget, so the wall deadline normally fires
    /// first. The CPU share is left to cgroup and container backends.
    pub fn cpu_backstop_secs(&self) -> u64 {
        let secs = (self.wall_timeout_ms as f64 / 1000.0).ceil() as u64;
        secs.max(1) + 1
    }

    /// `cpu.max` quota/period pair for cgroup v2
    pub fn cpu_max(&self) -> (u64, u64) {
        const PERIOD_USEC: u64 = 100_000;
        let quota = (PERIOD_USEC as f64 * self.cpu_share).round().max(1_000.0) as u64;
        (quota, PERIOD_USEC)
    }

    /// Value for `docker run --cpus`
    pub fn docker_cpus(&self) -> String {
        format!("{:.2}", self.cpu_share)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_matches_evaluator_limits() {
        let policy = SandboxPolicy::default();
        assert_eq!(policy.memory_limit_bytes, 512 * 1024 * 1024);
        assert_eq!(policy.max_processes, 50);
        assert!(!policy.network_enabled);
        assert_eq!(policy.cpu_max(), (50_000, 100_000));
    }

    #[test]
    fn test_cpu_backstop_covers_the_wall_budget() {
        let mut policy = SandboxPolicy::strict();
        policy.wall_timeout_ms = 10_000;
        policy.cpu_share = 0.25;
        assert_eq!(policy.cpu_backstop_secs(), 11);

        policy.cpu_share = 1.0;
        assert_eq!(policy.cpu_backstop_secs(), 11);

        policy.wall_timeout_ms = 100;
        assert_eq!(policy.cpu_backstop_secs(), 2);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let policy: SandboxPolicy =
            serde_json::from_str(r#"{"wall_timeout_ms": 1000}"#).expect("parse policy");
        assert_eq!(policy.wall_timeout(), Duration::from_secs(1));
        assert_eq!(policy.max_processes, SandboxPolicy::default().max_processes);
    }
}
