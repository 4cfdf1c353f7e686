//! Evaluation worker
//!
//! Drives one job from `queued` to a terminal state. The harness runs at most
//! once per recorded result: a delivery that finds a stored result only
//! re-publishes it and returns it.

use crate::config::types::{EvalError, JobState, Result};
use crate::exec::harness::{ExecutionHarness, ExecutionOutcome};
use crate::observability::audit::{AuditEvent, AuditEventKind};
use crate::store::durable::{DurableStore, LeaderboardCandidate};
use crate::store::leaderboard::LeaderboardStore;
use crate::verdict::extractor::ResultExtractor;
use crate::verdict::result::{EvaluationResult, FailureReason, RunEvidence};
use crate::worker::job::EvaluationRequest;
use std::sync::Arc;

pub struct EvaluationWorker {
    harness: Arc<ExecutionHarness>,
    extractor: ResultExtractor,
    durable: Arc<dyn DurableStore>,
    leaderboard: Arc<LeaderboardStore>,
}

impl EvaluationWorker {
    pub fn new(
        harness: Arc<ExecutionHarness>,
        extractor: ResultExtractor,
        durable: Arc<dyn DurableStore>,
        leaderboard: Arc<LeaderboardStore>,
    ) -> Self {
        Self {
            harness,
            extractor,
            durable,
            leaderboard,
        }
    }

    pub fn harness(&self) -> &ExecutionHarness {
        &self.harness
    }

    /// Process one delivery of a job.
    ///
    /// Errors are infrastructure trouble only; the job is left in `queued`
    /// so a redelivery can pick it up.
    pub fn process(&self, request: &EvaluationRequest) -> Result<EvaluationResult> {
        let job_id = &request.job_id;
        let artifact = &request.artifact;

        if let Some(existing) = self.durable.load_result(job_id)? {
            log::info!(
                "Job {}: result already recorded, re-publishing (attempt {})",
                job_id,
                request.attempt
            );
            AuditEvent::new(AuditEventKind::DuplicateDelivery, "result already recorded")
                .with_job(job_id)
                .with_submission(artifact.id())
                .with_attempt(request.attempt)
                .emit();
            self.publish(request, &existing)?;
            self.finalize(request, &existing)?;
            return Ok(existing);
        }

        if self.durable.job_state(job_id)?.is_none() {
            self.durable
                .set_job_state(job_id, artifact.id(), JobState::Queued)?;
            AuditEvent::new(AuditEventKind::JobQueued, artifact.environment_id())
                .with_job(job_id)
                .with_submission(artifact.id())
                .emit();
        }

        if let Err(e) = self.harness.preflight(artifact) {
            return self.reject_or_propagate(request, e);
        }

        self.durable
            .set_job_state(job_id, artifact.id(), JobState::Running)?;
        AuditEvent::new(
            AuditEventKind::JobStarted,
            format!("backend {}", self.harness.backend_name()),
        )
        .with_job(job_id)
        .with_submission(artifact.id())
        .with_attempt(request.attempt)
        .emit();

        let outcome = match self.harness.execute(artifact) {
            Ok(outcome) => outcome,
            Err(e) => return self.reject_or_propagate(request, e),
        };
        self.audit_run(request, &outcome);

        let result = self.extractor.extract(&outcome);
        let result = match self.record(request, result) {
            Ok(result) => result,
            Err(e) => return self.reject_or_propagate(request, e),
        };
        // A stored result is re-published by the next delivery
        if let Err(e) = self
            .publish(request, &result)
            .and_then(|()| self.finalize(request, &result))
        {
            return self.reject_or_propagate(request, e);
        }
        Ok(result)
    }

    /// Submitter-caused validation failures become a terminal result;
    /// everything else goes back to the caller with the job re-queued.
    fn reject_or_propagate(
        &self,
        request: &EvaluationRequest,
        err: EvalError,
    ) -> Result<EvaluationResult> {
        let job_id = &request.job_id;
        let artifact = &request.artifact;

        match err {
            EvalError::Validation(failure) if !failure.is_infrastructure() => {
                log::warn!("Job {}: submission rejected: {}", job_id, failure);
                AuditEvent::new(AuditEventKind::SubmissionRejected, failure.to_string())
                    .with_job(job_id)
                    .with_submission(artifact.id())
                    .emit();
                let result = EvaluationResult::failed(
                    FailureReason::InvalidSubmission,
                    failure.to_string(),
                    RunEvidence::default(),
                );
                let result = self.record(request, result)?;
                self.finalize(request, &result)?;
                Ok(result)
            }
            err => {
                log::warn!(
                    "Job {}: {} failure on attempt {}: {}",
                    job_id,
                    err.class(),
                    request.attempt,
                    err
                );
                if let EvalError::Validation(_) = &err {
                    AuditEvent::new(AuditEventKind::SandboxUnavailable, err.to_string())
                        .with_job(job_id)
                        .emit();
                }
                if let Err(state_err) =
                    self.durable
                        .set_job_state(job_id, artifact.id(), JobState::Queued)
                {
                    log::error!("Job {}: could not re-queue: {}", job_id, state_err);
                }
                Err(err)
            }
        }
    }

    /// Store the result once. A concurrent delivery that got there first wins.
    fn record(
        &self,
        request: &EvaluationRequest,
        result: EvaluationResult,
    ) -> Result<EvaluationResult> {
        if self
            .durable
            .save_result(&request.job_id, request.artifact.id(), &result)?
        {
            return Ok(result);
        }
        log::warn!(
            "Job {}: result recorded concurrently, keeping the stored one",
            request.job_id
        );
        self.durable.load_result(&request.job_id)?.ok_or_else(|| {
            EvalError::Persistence(format!(
                "result for job {} vanished after insert conflict",
                request.job_id
            ))
        })
    }

    /// Offer a succeeded result to the leaderboard. A no-op for a job id
    /// the leaderboard has already seen.
    fn publish(&self, request: &EvaluationRequest, result: &EvaluationResult) -> Result<()> {
        let score = match result.score() {
            Some(score) if result.is_succeeded() => score,
            _ => return Ok(()),
        };
        let artifact = &request.artifact;
        let candidate = LeaderboardCandidate {
            environment_id: artifact.environment_id().to_string(),
            submitter_id: artifact.submitter_id().to_string(),
            score,
            algorithm: artifact.algorithm().to_string(),
            submission_id: artifact.id().clone(),
            achieved_at: result.completed_at(),
        };
        match self.leaderboard.submit(&candidate, &request.job_id) {
            Ok(true) => {
                AuditEvent::new(
                    AuditEventKind::LeaderboardUpdated,
                    format!(
                        "{} / {} -> {}",
                        candidate.environment_id, candidate.submitter_id, score
                    ),
                )
                .with_job(&request.job_id)
                .with_submission(artifact.id())
                .emit();
                Ok(())
            }
            Ok(false) => Ok(()),
            // A stored non-finite score can never be published; do not retry it
            Err(EvalError::InvalidScore(score)) => {
                log::error!(
                    "Job {}: refusing to publish non-finite score {}",
                    request.job_id,
                    score
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn finalize(&self, request: &EvaluationRequest, result: &EvaluationResult) -> Result<()> {
        let state = if result.is_succeeded() {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        if self
            .durable
            .set_job_state(&request.job_id, request.artifact.id(), state)?
        {
            let (kind, detail) = match result.failure_reason() {
                None => (
                    AuditEventKind::JobSucceeded,
                    format!("score {}", result.score().unwrap_or_default()),
                ),
                Some(reason) => (AuditEventKind::JobFailed, reason.to_string()),
            };
            AuditEvent::new(kind, detail)
                .with_job(&request.job_id)
                .with_submission(request.artifact.id())
                .with_attempt(request.attempt)
                .emit();
            log::info!("Job {}: {}", request.job_id, state);
        }
        Ok(())
    }

    fn audit_run(&self, request: &EvaluationRequest, outcome: &ExecutionOutcome) {
        let base = |kind, detail: String| {
            AuditEvent::new(kind, detail)
                .with_job(&request.job_id)
                .with_submission(request.artifact.id())
                .with_run(&outcome.run_id)
        };
        if outcome.timed_out() {
            base(
                AuditEventKind::RunTimedOut,
                format!("killed after {}ms", outcome.wall_time.as_millis()),
            )
            .emit();
        }
        if outcome.stdout_truncated || outcome.stderr_truncated {
            base(
                AuditEventKind::OutputTruncated,
                format!(
                    "stdout truncated: {}, stderr truncated: {}",
                    outcome.stdout_truncated, outcome.stderr_truncated
                ),
            )
            .emit();
        }
        base(
            AuditEventKind::RunFinished,
            format!("{:?} via {}", outcome.termination, outcome.backend),
        )
        .emit();
    }
}
