//! Evaluation job processing

pub mod job;
pub mod pool;
#[allow(clippy::module_inception)]
pub mod worker;

pub use job::{EvaluationRequest, JobOutcome, JobReport, JobSpec};
pub use pool::{PoolConfig, WorkerPool};
pub use worker::EvaluationWorker;
