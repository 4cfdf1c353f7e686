//! evalbox: sandboxed evaluation of untrusted agents with a consistent leaderboard
//!
//! Runs a submitted program under a fixed resource and isolation policy, turns
//! its output into a score or a classified failure, and folds successful scores
//! into a per-environment ranking that stays correct under concurrent and
//! repeated deliveries.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::namespace`]: user, network, IPC and mount namespaces
//! - [`kernel::cgroup`]: cgroup v2 run groups (memory, pids, cpu)
//! - [`kernel::rlimit`]: per-process resource limits and niceness
//! - [`kernel::capabilities`]: bounding set, ambient set, no_new_privs, parent-death signal
//! - [`kernel::signal`]: process-group kill and shutdown signal handling
//!
//! ## Sandbox ([`sandbox`])
//! - [`sandbox::policy`]: the process-wide resource and isolation policy
//! - [`sandbox::boundary`]: the backend seam and per-run boundary lifecycle
//! - [`sandbox::backends`]: cgroup, rootless and container enforcement
//!
//! ## Execution Control ([`exec`])
//! - [`exec::workspace`]: per-run staging root with verified, read-only sources
//! - [`exec::output`]: bounded stdout/stderr collection
//! - [`exec::harness`]: launch, wall-clock supervision and teardown
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::extractor`]: score-line scanning and failure classification
//! - [`verdict::result`]: the immutable evaluation result
//!
//! ## Jobs ([`worker`])
//! - [`worker::worker`]: idempotent per-job state machine
//! - [`worker::pool`]: slot threads, redelivery and dead-lettering
//!
//! ## Leaderboard ([`store`])
//! - [`store::durable`]: storage contract and ranking order
//! - [`store::sqlite`]: SQLite implementation with atomic compare-and-update
//! - [`store::cache`]: in-memory rank cache
//! - [`store::leaderboard`]: durable-first writes, cached reads
//!
//! ## Supporting modules
//! - [`artifact`]: submission descriptors and content-addressed objects
//! - [`config`]: config loading, validation, runtime presets, shared types
//! - [`observability`]: structured audit events
//! - [`service`]: wiring and the downstream read interface

// Kernel Primitives
pub mod kernel;

// Sandbox policy and enforcement
pub mod sandbox;

// Execution Control
pub mod exec;

// Verdict
pub mod verdict;

// Jobs
pub mod worker;

// Leaderboard
pub mod store;

// Submissions
pub mod artifact;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Service facade
pub mod service;

// CLI entrypoint for the evalbox binary
pub mod cli;

pub use config::types::*;
pub use service::EvaluationService;
