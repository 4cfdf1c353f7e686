//! Execution control
//!
//! Staging, launching, supervising and collecting one sandboxed run.

pub mod harness;
pub mod output;
pub mod workspace;

pub use harness::{ExecutionHarness, ExecutionOutcome, Termination};
