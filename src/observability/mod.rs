//! Observability
//!
//! Structured audit events for job, run and leaderboard transitions.

pub mod audit;

pub use audit::{init_audit_file, AuditEvent, AuditEventKind, AuditSeverity};
