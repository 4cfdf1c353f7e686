//! Evaluation jobs
//!
//! A request pairs a job id with the artifact to evaluate. The job id is the
//! idempotency key: every redelivery carries the same id with a higher attempt.

use crate::artifact::{SubmissionArtifact, SubmissionShape};
use crate::config::types::{JobId, SubmissionId};
use crate::verdict::result::{now_micros, EvaluationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub job_id: JobId,
    pub artifact: SubmissionArtifact,
    /// 1 on first delivery
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl EvaluationRequest {
    pub fn new(artifact: SubmissionArtifact) -> Self {
        Self::with_job_id(JobId::new(), artifact)
    }

    pub fn with_job_id(job_id: JobId, artifact: SubmissionArtifact) -> Self {
        Self {
            job_id,
            artifact,
            attempt: 1,
            enqueued_at: now_micros(),
        }
    }

    /// Same job, next attempt
    pub fn redelivery(&self) -> Self {
        Self {
            job_id: self.job_id.clone(),
            artifact: self.artifact.clone(),
            attempt: self.attempt + 1,
            enqueued_at: now_micros(),
        }
    }
}

/// Job description as it arrives on the wire (one JSON object per line in
/// batch files). Ids are generated when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub submission_id: Option<SubmissionId>,
    pub environment_id: String,
    #[serde(default)]
    pub algorithm: String,
    pub submitter_id: String,
    #[serde(flatten)]
    pub shape: SubmissionShape,
}

impl JobSpec {
    pub fn into_request(self) -> EvaluationRequest {
        let artifact = SubmissionArtifact::from_shape(
            self.submission_id.unwrap_or_default(),
            self.shape,
            self.environment_id,
            self.algorithm,
            self.submitter_id,
        );
        EvaluationRequest::with_job_id(self.job_id.unwrap_or_default(), artifact)
    }
}

/// How one delivery of a job ended
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Terminal result recorded (or found already recorded)
    Completed(EvaluationResult),
    /// Infrastructure failure; another delivery follows after a backoff
    Requeued { error: String, class: &'static str },
    /// Gave up after the last allowed delivery, or the error was not retryable
    DeadLettered { error: String, class: &'static str },
}

/// One report per delivery, sent on the pool's report channel
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: JobId,
    pub submission_id: SubmissionId,
    pub attempt: u32,
    pub outcome: JobOutcome,
}

impl JobReport {
    /// Whether no further delivery of this job will follow
    pub fn is_final(&self) -> bool {
        !matches!(self.outcome, JobOutcome::Requeued { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redelivery_keeps_job_id() {
        let spec: JobSpec = serde_json::from_str(
            r#"{"job_id":"job-7","environment_id":"CartPole-v1","submitter_id":"alice",
                "shape":"single_script",
                "file":{"name":"agent.py","content_hash":"00","size":0}}"#,
        )
        .expect("parse");
        let first = spec.into_request();
        assert_eq!(first.job_id.as_str(), "job-7");
        assert_eq!(first.attempt, 1);
        assert_eq!(first.artifact.entry(), "agent.py");

        let second = first.redelivery();
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.attempt, 2);
    }

    #[test]
    fn test_missing_ids_are_generated() {
        let spec: JobSpec = serde_json::from_str(
            r#"{"environment_id":"Pong","submitter_id":"bob","algorithm":"dqn",
                "shape":"bundle","entry":"main.py",
                "files":[{"name":"main.py","content_hash":"00","size":0}]}"#,
        )
        .expect("parse");
        let request = spec.into_request();
        assert!(!request.job_id.as_str().is_empty());
        assert!(!request.artifact.id().as_str().is_empty());
        assert_eq!(request.artifact.algorithm(), "dqn");
    }
}
