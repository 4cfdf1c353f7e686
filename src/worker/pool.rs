//! Worker pool
//!
//! N slot threads pull requests from one bounded queue. A slot owns a job
//! until it reaches a final report: retryable failures are redelivered by the
//! same slot after a linear backoff, up to `max_deliveries`.

use crate::config::types::{EvalError, Result};
use crate::observability::audit::{AuditEvent, AuditEventKind};
use crate::worker::job::{EvaluationRequest, JobOutcome, JobReport};
use crate::worker::worker::EvaluationWorker;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Concurrent evaluations
    pub slots: usize,
    pub queue_capacity: usize,
    /// Deliveries per job including the first
    pub max_deliveries: u32,
    /// Backoff before delivery n+1 is n times this
    pub redelivery_backoff_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slots: 2,
            queue_capacity: 64,
            max_deliveries: 3,
            redelivery_backoff_ms: 500,
        }
    }
}

impl PoolConfig {
    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.redelivery_backoff_ms.saturating_mul(attempt as u64))
    }
}

pub struct WorkerPool {
    jobs: Option<Sender<EvaluationRequest>>,
    reports: Receiver<JobReport>,
    shutdown: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(worker: Arc<EvaluationWorker>, config: PoolConfig) -> Self {
        let (jobs_tx, jobs_rx) = bounded::<EvaluationRequest>(config.queue_capacity.max(1));
        let (reports_tx, reports_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let slots = config.slots.max(1);

        let handles = (0..slots)
            .map(|slot| {
                let worker = Arc::clone(&worker);
                let jobs_rx = jobs_rx.clone();
                let reports_tx = reports_tx.clone();
                let shutdown_rx = shutdown_rx.clone();
                let config = config.clone();
                thread::Builder::new()
                    .name(format!("evalbox-slot-{}", slot))
                    .spawn(move || {
                        slot_loop(slot, &worker, &config, &jobs_rx, &shutdown_rx, &reports_tx)
                    })
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::error!("Failed to spawn worker slot: {}", e);
                    None
                }
            })
            .collect::<Vec<_>>();

        log::info!(
            "Worker pool started with {} slots (queue {}, max deliveries {})",
            handles.len(),
            config.queue_capacity,
            config.max_deliveries
        );

        Self {
            jobs: Some(jobs_tx),
            reports: reports_rx,
            shutdown: Some(shutdown_tx),
            handles,
        }
    }

    /// Enqueue a request; blocks while the queue is full
    pub fn submit(&self, request: EvaluationRequest) -> Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| EvalError::Config("worker pool is shut down".to_string()))?;
        jobs.send(request)
            .map_err(|_| EvalError::Config("worker pool has no running slots".to_string()))
    }

    pub fn reports(&self) -> &Receiver<JobReport> {
        &self.reports
    }

    pub fn slots(&self) -> usize {
        self.handles.len()
    }

    /// Stop taking new jobs, let in-flight ones finish, join every slot
    pub fn shutdown(&mut self) {
        self.jobs.take();
        if self.shutdown.take().is_none() {
            return;
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("Worker slot panicked");
            }
        }
        log::info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stopping(shutdown_rx: &Receiver<()>) -> bool {
    !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty))
}

fn slot_loop(
    slot: usize,
    worker: &EvaluationWorker,
    config: &PoolConfig,
    jobs_rx: &Receiver<EvaluationRequest>,
    shutdown_rx: &Receiver<()>,
    reports_tx: &Sender<JobReport>,
) {
    log::debug!("Worker slot {} ready", slot);
    loop {
        if stopping(shutdown_rx) {
            break;
        }
        let request = select! {
            recv(jobs_rx) -> msg => match msg {
                Ok(request) => request,
                Err(_) => break,
            },
            recv(shutdown_rx) -> _ => break,
        };
        deliver(worker, config, request, shutdown_rx, reports_tx);
    }
    log::debug!("Worker slot {} exiting", slot);
}

/// Run deliveries of one job until a final report
fn deliver(
    worker: &EvaluationWorker,
    config: &PoolConfig,
    mut request: EvaluationRequest,
    shutdown_rx: &Receiver<()>,
    reports_tx: &Sender<JobReport>,
) {
    loop {
        let outcome = match worker.process(&request) {
            Ok(result) => JobOutcome::Completed(result),
            Err(e) if e.is_retryable() && request.attempt < config.max_deliveries => {
                JobOutcome::Requeued {
                    error: e.to_string(),
                    class: e.class(),
                }
            }
            Err(e) => {
                log::error!(
                    "Job {}: dead-lettered after {} deliveries: {}",
                    request.job_id,
                    request.attempt,
                    e
                );
                AuditEvent::new(AuditEventKind::JobDeadLettered, e.to_string())
                    .with_job(&request.job_id)
                    .with_submission(request.artifact.id())
                    .with_attempt(request.attempt)
                    .emit();
                JobOutcome::DeadLettered {
                    error: e.to_string(),
                    class: e.class(),
                }
            }
        };

        let report = JobReport {
            job_id: request.job_id.clone(),
            submission_id: request.artifact.id().clone(),
            attempt: request.attempt,
            outcome,
        };
        let last = report.is_final();
        // Nobody listening is fine; results are durable
        let _ = reports_tx.send(report);
        if last {
            return;
        }

        let backoff = config.backoff(request.attempt);
        AuditEvent::new(
            AuditEventKind::JobRequeued,
            format!("redelivery in {}ms", backoff.as_millis()),
        )
        .with_job(&request.job_id)
        .with_attempt(request.attempt)
        .emit();

        // Wakes early only when the pool shuts down
        if shutdown_rx.recv_timeout(backoff).is_ok() || stopping(shutdown_rx) {
            log::warn!(
                "Job {}: shutdown before redelivery, left queued",
                request.job_id
            );
            return;
        }
        request = request.redelivery();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let config = PoolConfig {
            redelivery_backoff_ms: 100,
            ..PoolConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(3), Duration::from_millis(300));
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: PoolConfig = serde_json::from_str(r#"{"slots": 8}"#).expect("parse");
        assert_eq!(config.slots, 8);
        assert_eq!(config.max_deliveries, 3);
        assert_eq!(config.queue_capacity, 64);
    }
}
