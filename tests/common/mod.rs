//! Shared fixtures for integration tests
//!
//! Pipeline tests run submissions as POSIX shell scripts through a test-only
//! backend: a new session and file rlimits, no namespaces. That keeps them
//! runnable without root, user namespaces or python on the host.

#![allow(dead_code)]

use evalbox::artifact::objects::{MemoryObjectStore, ObjectStore};
use evalbox::artifact::{ArtifactFile, SubmissionArtifact};
use evalbox::config::loader::EvalboxConfig;
use evalbox::config::presets::RuntimeEnvelope;
use evalbox::config::types::{EvalError, JobId, JobState, Result, SubmissionId};
use evalbox::kernel::rlimit::RlimitPlan;
use evalbox::kernel::signal::{kill_process_group, new_session};
use evalbox::sandbox::boundary::{
    BoundaryRequest, IsolationBackend, IsolationBoundary, LaunchSpec,
};
use evalbox::store::durable::{DurableStore, LeaderboardEntry};
use evalbox::store::sqlite::SqliteStore;
use evalbox::verdict::result::EvaluationResult;
use evalbox::worker::job::EvaluationRequest;
use evalbox::EvaluationService;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub fn shell_runtime() -> RuntimeEnvelope {
    RuntimeEnvelope {
        id: "sh-test".to_string(),
        interpreter: "/bin/sh".to_string(),
        args: Vec::new(),
        script_extension: "py".to_string(),
        canonical_entry: "submission.py".to_string(),
        env: Vec::new(),
    }
}

/// Process-group sandbox for tests; counts how many boundaries it built
#[derive(Default)]
pub struct ShellBackend {
    pub builds: Arc<AtomicUsize>,
}

impl IsolationBackend for ShellBackend {
    fn name(&self) -> &'static str {
        "shell-test"
    }

    fn probe(&self, runtime: &RuntimeEnvelope) -> Result<()> {
        if Path::new(&runtime.interpreter).is_file() {
            Ok(())
        } else {
            Err(EvalError::SandboxConstruction(format!(
                "{} missing",
                runtime.interpreter
            )))
        }
    }

    fn build(&self, request: &BoundaryRequest<'_>) -> Result<Box<dyn IsolationBoundary>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ShellBoundary {
            rlimits: RlimitPlan::file_only(request.policy),
        }))
    }
}

struct ShellBoundary {
    rlimits: RlimitPlan,
}

impl IsolationBoundary for ShellBoundary {
    fn command(&self, launch: &LaunchSpec<'_>) -> Result<Command> {
        let mut cmd = Command::new(launch.program);
        cmd.args(launch.args)
            .current_dir(launch.workdir)
            .env_clear()
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        let rlimits = self.rlimits;
        // SAFETY: setsid and setrlimit only
        unsafe {
            cmd.pre_exec(move || {
                new_session()?;
                rlimits.apply()
            });
        }
        Ok(cmd)
    }

    fn kill_tree(&self, pid: u32) {
        kill_process_group(pid);
    }

    fn teardown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Backend whose probe always fails, as on a host without sandbox tooling
pub struct MissingBackend;

impl IsolationBackend for MissingBackend {
    fn name(&self) -> &'static str {
        "missing"
    }

    fn probe(&self, _runtime: &RuntimeEnvelope) -> Result<()> {
        Err(EvalError::SandboxConstruction(
            "isolation tooling not installed".to_string(),
        ))
    }

    fn build(&self, _request: &BoundaryRequest<'_>) -> Result<Box<dyn IsolationBoundary>> {
        Err(EvalError::SandboxConstruction("unreachable".to_string()))
    }
}

/// Object store that fails the first `failures` fetches
pub struct FlakyObjectStore {
    inner: MemoryObjectStore,
    failures: AtomicUsize,
}

impl FlakyObjectStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: MemoryObjectStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

impl ObjectStore for FlakyObjectStore {
    fn fetch(&self, content_hash: &str) -> Result<Vec<u8>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EvalError::Retrieval("object store unreachable".to_string()));
        }
        self.inner.fetch(content_hash)
    }

    fn put(&self, bytes: &[u8]) -> Result<String> {
        self.inner.put(bytes)
    }
}

/// Durable store whose result writes always fail
pub struct BrokenResultStore {
    pub inner: SqliteStore,
}

impl DurableStore for BrokenResultStore {
    fn job_state(&self, job_id: &JobId) -> Result<Option<JobState>> {
        self.inner.job_state(job_id)
    }

    fn set_job_state(
        &self,
        job_id: &JobId,
        submission_id: &SubmissionId,
        state: JobState,
    ) -> Result<bool> {
        self.inner.set_job_state(job_id, submission_id, state)
    }

    fn save_result(
        &self,
        _job_id: &JobId,
        _submission_id: &SubmissionId,
        _result: &EvaluationResult,
    ) -> Result<bool> {
        Err(EvalError::Persistence("database is locked".to_string()))
    }

    fn load_result(&self, job_id: &JobId) -> Result<Option<EvaluationResult>> {
        self.inner.load_result(job_id)
    }

    fn compare_and_update(&self, entry: &LeaderboardEntry) -> Result<bool> {
        self.inner.compare_and_update(entry)
    }

    fn ranking(&self, environment_id: &str, limit: Option<usize>) -> Result<Vec<LeaderboardEntry>> {
        self.inner.ranking(environment_id, limit)
    }

    fn leaderboard_entry(
        &self,
        environment_id: &str,
        submitter_id: &str,
    ) -> Result<Option<LeaderboardEntry>> {
        self.inner.leaderboard_entry(environment_id, submitter_id)
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub config: EvalboxConfig,
    pub objects: Arc<dyn ObjectStore>,
    pub builds: Arc<AtomicUsize>,
    pub service: EvaluationService,
}

pub fn test_config(dir: &TempDir) -> EvalboxConfig {
    let mut config = EvalboxConfig::default();
    config.sandbox.policy.wall_timeout_ms = 10_000;
    config.storage.workspace_root = dir.path().join("runs");
    config.storage.database_path = dir.path().join("evalbox.db");
    config.storage.object_root = dir.path().join("objects");
    config.worker.redelivery_backoff_ms = 10;
    config
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(|_| {}, Arc::new(MemoryObjectStore::new()), None)
    }

    pub fn with_config<F: FnOnce(&mut EvalboxConfig)>(tweak: F) -> Self {
        Self::with(tweak, Arc::new(MemoryObjectStore::new()), None)
    }

    pub fn with<F: FnOnce(&mut EvalboxConfig)>(
        tweak: F,
        objects: Arc<dyn ObjectStore>,
        durable: Option<Arc<dyn DurableStore>>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(&dir);
        tweak(&mut config);

        let durable = durable.unwrap_or_else(|| -> Arc<dyn DurableStore> {
            Arc::new(SqliteStore::open(&config.storage.database_path).expect("open db"))
        });
        let backend = ShellBackend::default();
        let builds = Arc::clone(&backend.builds);
        let service = EvaluationService::assemble(
            &config,
            shell_runtime(),
            Arc::new(backend),
            Arc::clone(&objects),
            durable,
        );

        Self {
            dir,
            config,
            objects,
            builds,
            service,
        }
    }

    /// Upload a script and describe it as a single-file submission
    pub fn script(&self, environment_id: &str, submitter: &str, body: &str) -> EvaluationRequest {
        let file = self.upload("agent.py", body);
        EvaluationRequest::new(SubmissionArtifact::single(
            SubmissionId::new(),
            file,
            environment_id,
            "ppo",
            submitter,
        ))
    }

    pub fn upload(&self, name: &str, body: &str) -> ArtifactFile {
        let content_hash = self.objects.put(body.as_bytes()).expect("put object");
        ArtifactFile {
            name: name.to_string(),
            content_hash,
            size: body.len() as u64,
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Entries left under the workspace root
    pub fn leftover_runs(&self) -> usize {
        match std::fs::read_dir(&self.config.storage.workspace_root) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

/// Score line followed by exit 0
pub fn scoring_script(score: f64) -> String {
    format!("echo '{{\"score\": {}}}'\n", score)
}
