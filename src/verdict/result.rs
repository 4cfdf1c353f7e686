/// Evaluation result
///
/// The one record the rest of the system sees for a finished job. Built only
/// through `succeeded`/`failed`, so a score and a failure reason never coexist.
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Succeeded,
    Failed,
}

impl EvaluationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationStatus::Succeeded => "succeeded",
            EvaluationStatus::Failed => "failed",
        }
    }
}

/// Closed failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Killed at the wall-clock deadline
    Timeout,
    /// Exited non-zero or died from a signal; any printed score is ignored
    NonZeroExit,
    /// No score line survived and stdout hit its ceiling
    OutputTruncatedNoScore,
    /// Clean exit without a qualifying score line
    NoScoreFound,
    /// Rejected before launch
    InvalidSubmission,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::NonZeroExit => "non_zero_exit",
            FailureReason::OutputTruncatedNoScore => "output_truncated_no_score",
            FailureReason::NoScoreFound => "no_score_found",
            FailureReason::InvalidSubmission => "invalid_submission",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run evidence attached to either kind of result
#[derive(Debug, Clone, Default)]
pub struct RunEvidence {
    pub diagnostic_tail: String,
    pub entry_fingerprint: Option<String>,
    pub wall_time_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    status: EvaluationStatus,
    score: Option<f64>,
    metrics: Option<Vec<f64>>,
    failure_reason: Option<FailureReason>,
    failure_detail: Option<String>,
    diagnostic_tail: String,
    entry_fingerprint: Option<String>,
    wall_time_ms: Option<u64>,
    completed_at: DateTime<Utc>,
}

impl EvaluationResult {
    pub fn succeeded(score: f64, metrics: Option<Vec<f64>>, evidence: RunEvidence) -> Self {
        Self {
            status: EvaluationStatus::Succeeded,
            score: Some(score),
            metrics,
            failure_reason: None,
            failure_detail: None,
            diagnostic_tail: evidence.diagnostic_tail,
            entry_fingerprint: evidence.entry_fingerprint,
            wall_time_ms: evidence.wall_time_ms,
            completed_at: now_micros(),
        }
    }

    pub fn failed(reason: FailureReason, detail: impl Into<String>, evidence: RunEvidence) -> Self {
        Self {
            status: EvaluationStatus::Failed,
            score: None,
            metrics: None,
            failure_reason: Some(reason),
            failure_detail: Some(detail.into()),
            diagnostic_tail: evidence.diagnostic_tail,
            entry_fingerprint: evidence.entry_fingerprint,
            wall_time_ms: evidence.wall_time_ms,
            completed_at: now_micros(),
        }
    }

    pub fn status(&self) -> EvaluationStatus {
        self.status
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == EvaluationStatus::Succeeded
    }

    pub fn score(&self) -> Option<f64> {
        self.score
    }

    pub fn metrics(&self) -> Option<&[f64]> {
        self.metrics.as_deref()
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.failure_reason
    }

    pub fn failure_detail(&self) -> Option<&str> {
        self.failure_detail.as_deref()
    }

    pub fn diagnostic_tail(&self) -> &str {
        &self.diagnostic_tail
    }

    pub fn entry_fingerprint(&self) -> Option<&str> {
        self.entry_fingerprint.as_deref()
    }

    pub fn wall_time_ms(&self) -> Option<u64> {
        self.wall_time_ms
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }
}

/// Current time at the precision the durable store keeps
pub fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_micros(now.timestamp_micros())
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeded_carries_score_only() {
        let result = EvaluationResult::succeeded(42.0, Some(vec![1.0, 2.0]), RunEvidence::default());
        assert!(result.is_succeeded());
        assert_eq!(result.score(), Some(42.0));
        assert_eq!(result.metrics(), Some(&[1.0, 2.0][..]));
        assert!(result.failure_reason().is_none());
    }

    #[test]
    fn test_failed_carries_reason_only() {
        let result =
            EvaluationResult::failed(FailureReason::Timeout, "killed", RunEvidence::default());
        assert_eq!(result.status(), EvaluationStatus::Failed);
        assert!(result.score().is_none());
        assert_eq!(result.failure_reason(), Some(FailureReason::Timeout));
    }

    #[test]
    fn test_json_round_trip_is_lossless() {
        let result = EvaluationResult::succeeded(
            9.5,
            None,
            RunEvidence {
                diagnostic_tail: "tail".to_string(),
                entry_fingerprint: Some("ab".repeat(32)),
                wall_time_ms: Some(12),
            },
        );
        let json = serde_json::to_string(&result).expect("serialize");
        let back: EvaluationResult = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, result);
    }

    #[test]
    fn test_failure_reason_wire_names() {
        let json = serde_json::to_string(&FailureReason::OutputTruncatedNoScore).expect("ser");
        assert_eq!(json, "\"output_truncated_no_score\"");
        assert_eq!(FailureReason::NonZeroExit.as_str(), "non_zero_exit");
    }

    #[test]
    fn test_completed_at_has_micro_precision() {
        let ts = now_micros();
        assert_eq!(ts.timestamp_subsec_nanos() % 1000, 0);
    }
}
