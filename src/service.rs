//! Evaluation service
//!
//! Wires configuration into a ready engine and exposes the read side that
//! downstream consumers use: results by job id and ranked leaderboards.

use crate::artifact::objects::{FsObjectStore, ObjectStore};
use crate::config::loader::EvalboxConfig;
use crate::config::presets::RuntimeEnvelope;
use crate::config::types::{JobId, JobState, Result};
use crate::config::validator::validate_config;
use crate::exec::harness::ExecutionHarness;
use crate::sandbox::boundary::{select_backend, IsolationBackend};
use crate::store::durable::{DurableStore, LeaderboardEntry};
use crate::store::leaderboard::LeaderboardStore;
use crate::store::sqlite::SqliteStore;
use crate::verdict::extractor::ResultExtractor;
use crate::verdict::result::EvaluationResult;
use crate::worker::job::EvaluationRequest;
use crate::worker::pool::{PoolConfig, WorkerPool};
use crate::worker::worker::EvaluationWorker;
use std::sync::Arc;

pub struct EvaluationService {
    worker: Arc<EvaluationWorker>,
    durable: Arc<dyn DurableStore>,
    leaderboard: Arc<LeaderboardStore>,
    objects: Arc<dyn ObjectStore>,
    pool_config: PoolConfig,
}

impl EvaluationService {
    /// Validate the config, pick a backend and open local storage
    pub fn from_config(config: &EvalboxConfig) -> Result<Self> {
        validate_config(config)?;
        let runtime = config.runtime_envelope()?;
        let backend = select_backend(&config.sandbox, &runtime)?;
        let objects: Arc<dyn ObjectStore> =
            Arc::new(FsObjectStore::open(&config.storage.object_root)?);
        let durable: Arc<dyn DurableStore> =
            Arc::new(SqliteStore::open(&config.storage.database_path)?);

        log::info!(
            "Evaluation service ready: backend {}, runtime {}, db {}",
            backend.name(),
            runtime.id,
            config.storage.database_path.display()
        );
        Ok(Self::assemble(config, runtime, backend, objects, durable))
    }

    /// Build from explicit collaborators. `config` supplies the policy,
    /// limits and pool settings.
    pub fn assemble(
        config: &EvalboxConfig,
        runtime: RuntimeEnvelope,
        backend: Arc<dyn IsolationBackend>,
        objects: Arc<dyn ObjectStore>,
        durable: Arc<dyn DurableStore>,
    ) -> Self {
        let harness = Arc::new(ExecutionHarness::new(
            config.sandbox.policy.clone(),
            runtime,
            backend,
            Arc::clone(&objects),
            config.storage.workspace_root.clone(),
            config.output.clone(),
        )
        .with_score_line_limit(config.extractor.max_line_bytes));
        let leaderboard = Arc::new(LeaderboardStore::new(
            Arc::clone(&durable),
            config.storage.cache_enabled,
        ));
        let worker = Arc::new(EvaluationWorker::new(
            harness,
            ResultExtractor::new(config.extractor.clone()),
            Arc::clone(&durable),
            Arc::clone(&leaderboard),
        ));

        Self {
            worker,
            durable,
            leaderboard,
            objects,
            pool_config: config.worker.clone(),
        }
    }

    /// Run one job on the calling thread
    pub fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResult> {
        self.worker.process(request)
    }

    pub fn start_pool(&self) -> WorkerPool {
        WorkerPool::start(Arc::clone(&self.worker), self.pool_config.clone())
    }

    pub fn get_evaluation_result(&self, job_id: &JobId) -> Result<Option<EvaluationResult>> {
        self.durable.load_result(job_id)
    }

    pub fn job_state(&self, job_id: &JobId) -> Result<Option<JobState>> {
        self.durable.job_state(job_id)
    }

    pub fn query_leaderboard(
        &self,
        environment_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<LeaderboardEntry>> {
        self.leaderboard.query(environment_id, limit)
    }

    pub fn leaderboard(&self) -> &LeaderboardStore {
        &self.leaderboard
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub fn worker(&self) -> &Arc<EvaluationWorker> {
        &self.worker
    }

    pub fn backend_name(&self) -> &'static str {
        self.worker.harness().backend_name()
    }
}
