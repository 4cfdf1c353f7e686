/// Execution harness
///
/// Runs one submission under the process-wide policy and reports what happened.
/// The harness owns the wall-clock timer; isolation is delegated to the backend.
use crate::artifact::objects::ObjectStore;
use crate::artifact::SubmissionArtifact;
use crate::config::presets::RuntimeEnvelope;
use crate::config::types::{EvalError, Result};
use crate::exec::output::{OutputCollector, OutputLimits};
use crate::exec::workspace::Workspace;
use crate::observability::audit::{AuditEvent, AuditEventKind};
use crate::sandbox::boundary::{
    unavailable, BoundaryGuard, BoundaryRequest, IsolationBackend, LaunchSpec,
};
use crate::sandbox::policy::SandboxPolicy;
use crate::verdict::extractor::{ExtractorLimits, ScoreRecord};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How the submission process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    /// Killed by the harness at the wall-clock deadline, or by the
    /// CPU-time backstop (SIGXCPU)
    TimedOut,
}

/// Raw result of one sandboxed run. Consumed by the extractor, never persisted.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub run_id: String,
    pub backend: String,
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Last score line over the whole stdout stream, including bytes past the ceiling
    pub stdout_score: Option<ScoreRecord>,
    pub wall_time: Duration,
    /// SHA-256 of the canonical entry that was executed
    pub entry_fingerprint: String,
}

impl ExecutionOutcome {
    /// Shell-style exit code; a signal death maps to 128 + signal
    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited(code) => Some(code),
            Termination::Signaled(sig) => Some(128 + sig),
            Termination::TimedOut => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.termination == Termination::TimedOut
    }
}

pub struct ExecutionHarness {
    policy: SandboxPolicy,
    runtime: RuntimeEnvelope,
    backend: Arc<dyn IsolationBackend>,
    objects: Arc<dyn ObjectStore>,
    workspace_root: PathBuf,
    output: OutputLimits,
    score_line_limit: usize,
}

impl ExecutionHarness {
    pub fn new(
        policy: SandboxPolicy,
        runtime: RuntimeEnvelope,
        backend: Arc<dyn IsolationBackend>,
        objects: Arc<dyn ObjectStore>,
        workspace_root: PathBuf,
        output: OutputLimits,
    ) -> Self {
        Self {
            policy,
            runtime,
            backend,
            objects,
            workspace_root,
            output,
            score_line_limit: ExtractorLimits::default().max_line_bytes,
        }
    }

    /// Longest stdout line considered when scanning for the score
    pub fn with_score_line_limit(mut self, max_line_bytes: usize) -> Self {
        self.score_line_limit = max_line_bytes;
        self
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Everything that can reject a run before any process starts
    pub fn preflight(&self, artifact: &SubmissionArtifact) -> Result<()> {
        artifact.validate(&self.runtime)?;
        self.backend
            .probe(&self.runtime)
            .map_err(|e| unavailable(self.backend.name(), e))
    }

    /// Run the artifact once. The per-run root is gone when this returns.
    pub fn execute(&self, artifact: &SubmissionArtifact) -> Result<ExecutionOutcome> {
        self.preflight(artifact)?;

        let run_id = Uuid::new_v4().to_string();
        let mut workspace = Workspace::stage(
            &self.workspace_root,
            &run_id,
            artifact,
            self.objects.as_ref(),
            &self.runtime,
        )?;

        let result = self.run_staged(&workspace, artifact);

        if let Err(e) = workspace.cleanup() {
            log::error!("Run {}: workspace removal failed: {}", run_id, e);
            AuditEvent::new(AuditEventKind::CleanupFailure, e.to_string())
                .with_submission(artifact.id())
                .with_run(&run_id)
                .emit();
        }

        result
    }

    fn run_staged(
        &self,
        workspace: &Workspace,
        artifact: &SubmissionArtifact,
    ) -> Result<ExecutionOutcome> {
        let run_id = workspace.run_id();
        let boundary = self.backend.build(&BoundaryRequest {
            run_id,
            policy: &self.policy,
            root: workspace.root(),
        })?;
        let guard = BoundaryGuard::new(boundary);

        let env = self.launch_env(workspace, artifact);
        let argv = self.runtime.argv(artifact.environment_id());
        let launch = LaunchSpec {
            program: &self.runtime.interpreter,
            args: &argv,
            workdir: workspace.root(),
            env: &env,
        };

        let mut cmd = guard.command(&launch)?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        log::info!(
            "Run {}: launching submission {} in {} ({} backend, timeout {}ms)",
            run_id,
            artifact.id(),
            artifact.environment_id(),
            self.backend.name(),
            self.policy.wall_timeout_ms
        );

        AuditEvent::new(AuditEventKind::RunStarted, self.backend.name())
            .with_submission(artifact.id())
            .with_run(run_id)
            .emit();

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            EvalError::SandboxConstruction(format!("failed to launch sandboxed process: {}", e))
        })?;
        let pid = child.id();

        let pending = OutputCollector::new(self.output.clone())
            .scanning_stdout(self.score_line_limit)
            .start(child.stdout.take(), child.stderr.take());

        let deadline = started + self.policy.wall_timeout();
        let supervised = supervise(&mut child, deadline, || guard.kill_tree(pid));
        let wall_time = started.elapsed();

        // Stragglers in the group would hold the pipes open
        guard.kill_tree(pid);
        let output = pending.finish();
        guard.finish()?;

        let termination = supervised?;
        log::info!(
            "Run {}: {:?} after {}ms (stdout {}B{}, stderr {}B{})",
            run_id,
            termination,
            wall_time.as_millis(),
            output.stdout.bytes.len(),
            if output.stdout.truncated { ", truncated" } else { "" },
            output.stderr.bytes.len(),
            if output.stderr.truncated { ", truncated" } else { "" },
        );

        Ok(ExecutionOutcome {
            run_id: run_id.to_string(),
            backend: self.backend.name().to_string(),
            termination,
            stdout: output.stdout.bytes,
            stderr: output.stderr.bytes,
            stdout_truncated: output.stdout.truncated,
            stderr_truncated: output.stderr.truncated,
            stdout_score: output.stdout.score,
            wall_time,
            entry_fingerprint: workspace.entry_fingerprint().to_string(),
        })
    }

    /// Fixed allow-list; nothing is inherited from the host
    fn launch_env(
        &self,
        workspace: &Workspace,
        artifact: &SubmissionArtifact,
    ) -> Vec<(String, String)> {
        let scratch = workspace.scratch_dir().to_string_lossy().into_owned();
        let mut env = vec![
            ("PATH".to_string(), SANDBOX_PATH.to_string()),
            ("HOME".to_string(), scratch.clone()),
            ("TMPDIR".to_string(), scratch),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ];
        env.extend(self.runtime.env.iter().cloned());
        env.push(("ENV_ID".to_string(), artifact.environment_id().to_string()));
        env.push(("SUBMISSION_ID".to_string(), artifact.id().to_string()));
        env
    }
}

/// Poll the child until it exits or the deadline passes
fn supervise<F: Fn()>(child: &mut Child, deadline: Instant, kill_tree: F) -> Result<Termination> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(classify(status)),
            Ok(None) if Instant::now() >= deadline => {
                kill_tree();
                let _ = child.kill();
                let _ = child.wait();
                return Ok(Termination::TimedOut);
            }
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                kill_tree();
                let _ = child.kill();
                let _ = child.wait();
                return Err(EvalError::SandboxConstruction(format!(
                    "failed to wait for sandboxed process: {}",
                    e
                )));
            }
        }
    }
}

fn classify(status: ExitStatus) -> Termination {
    match (status.code(), status.signal()) {
        (Some(code), _) => Termination::Exited(code),
        (None, Some(libc::SIGXCPU)) => Termination::TimedOut,
        (None, Some(sig)) => Termination::Signaled(sig),
        (None, None) => Termination::Exited(-1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(termination: Termination) -> ExecutionOutcome {
        ExecutionOutcome {
            run_id: "r".to_string(),
            backend: "test".to_string(),
            termination,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            stdout_score: None,
            wall_time: Duration::ZERO,
            entry_fingerprint: String::new(),
        }
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(outcome(Termination::Exited(3)).exit_code(), Some(3));
        assert_eq!(outcome(Termination::Signaled(9)).exit_code(), Some(137));
        assert_eq!(outcome(Termination::TimedOut).exit_code(), None);
        assert!(outcome(Termination::TimedOut).timed_out());
    }

    #[test]
    fn test_classify_real_statuses() {
        let status = std::process::Command::new("/bin/sh")
            .args(["-c", "exit 7"])
            .status()
            .expect("run sh");
        assert_eq!(classify(status), Termination::Exited(7));

        let status = std::process::Command::new("/bin/sh")
            .args(["-c", "kill -9 $$"])
            .status()
            .expect("run sh");
        assert_eq!(classify(status), Termination::Signaled(9));
    }

    #[test]
    fn test_cpu_limit_signal_counts_as_timeout() {
        let status = std::process::Command::new("/bin/sh")
            .args(["-c", "kill -s XCPU $$"])
            .status()
            .expect("run sh");
        assert_eq!(classify(status), Termination::TimedOut);
    }

    #[test]
    fn test_supervise_times_out_and_kills() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "while :; do :; done"])
            .spawn()
            .expect("spawn");
        let deadline = Instant::now() + Duration::from_millis(100);
        let termination = supervise(&mut child, deadline, || {}).expect("supervise");
        assert_eq!(termination, Termination::TimedOut);
    }
}
