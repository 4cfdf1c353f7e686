//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Functions that run between fork and exec return `io::Result` and never allocate.

pub mod capabilities;
pub mod cgroup;
pub mod namespace;
pub mod rlimit;
pub mod signal;
