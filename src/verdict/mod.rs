//! Result extraction and the evaluation result record
//!
//! Derives a score-or-failure as a pure function over one execution outcome.

pub mod extractor;
pub mod result;

pub use extractor::{ExtractorLimits, ResultExtractor, ScoreScanner};
pub use result::{EvaluationResult, EvaluationStatus, FailureReason, RunEvidence};
