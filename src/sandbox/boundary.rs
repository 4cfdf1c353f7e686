//! Policy-to-enforcement seam.
//!
//! An [`IsolationBackend`] turns the process-wide [`SandboxPolicy`] into an
//! [`IsolationBoundary`] for one run. The harness only ever talks to these two
//! traits; every mechanism (cgroups, user namespaces, containers) lives behind them.

use crate::config::loader::SandboxSection;
use crate::config::presets::RuntimeEnvelope;
use crate::config::types::{EvalError, Result, ValidationFailure};
use crate::sandbox::backends::{CgroupBackend, ContainerBackend, RootlessBackend};
use crate::sandbox::policy::SandboxPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::process::Command;
use std::str::FromStr;
use std::sync::Arc;

/// Configured isolation mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// cgroup when usable, else rootless
    Auto,
    Cgroup,
    Rootless,
    Container,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "cgroup" => Ok(BackendKind::Cgroup),
            "rootless" => Ok(BackendKind::Rootless),
            "container" | "docker" => Ok(BackendKind::Container),
            other => Err(format!(
                "unknown backend '{}' (expected auto, cgroup, rootless or container)",
                other
            )),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Auto => "auto",
            BackendKind::Cgroup => "cgroup",
            BackendKind::Rootless => "rootless",
            BackendKind::Container => "container",
        };
        f.write_str(name)
    }
}

/// Inputs for building one boundary
pub struct BoundaryRequest<'a> {
    pub run_id: &'a str,
    pub policy: &'a SandboxPolicy,
    /// Staged per-run root
    pub root: &'a Path,
}

/// What to launch inside a boundary
pub struct LaunchSpec<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    /// Staged per-run root, used as working directory
    pub workdir: &'a Path,
    /// Complete environment; nothing from the host is inherited
    pub env: &'a [(String, String)],
}

/// Factory for per-run boundaries
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fail fast when host tooling is missing. Never degrade to an unsandboxed run.
    fn probe(&self, runtime: &RuntimeEnvelope) -> Result<()>;

    fn build(&self, request: &BoundaryRequest<'_>) -> Result<Box<dyn IsolationBoundary>>;
}

/// One built sandbox for a single run
pub trait IsolationBoundary: Send {
    /// Command configured to run inside the boundary. Stdio is set by the caller.
    fn command(&self, launch: &LaunchSpec<'_>) -> Result<Command>;

    /// Kill every process the run started. Safe to call more than once.
    fn kill_tree(&self, pid: u32);

    /// Release kernel or container resources. Idempotent.
    fn teardown(&mut self) -> Result<()>;
}

/// Tears the boundary down on every exit path, including unwinding
pub struct BoundaryGuard {
    boundary: Option<Box<dyn IsolationBoundary>>,
}

impl BoundaryGuard {
    pub fn new(boundary: Box<dyn IsolationBoundary>) -> Self {
        Self {
            boundary: Some(boundary),
        }
    }

    pub fn command(&self, launch: &LaunchSpec<'_>) -> Result<Command> {
        match &self.boundary {
            Some(boundary) => boundary.command(launch),
            None => Err(EvalError::SandboxConstruction(
                "boundary already torn down".to_string(),
            )),
        }
    }

    pub fn kill_tree(&self, pid: u32) {
        if let Some(boundary) = &self.boundary {
            boundary.kill_tree(pid);
        }
    }

    /// Explicit teardown that reports failure
    pub fn finish(mut self) -> Result<()> {
        match self.boundary.take() {
            Some(mut boundary) => boundary.teardown(),
            None => Ok(()),
        }
    }
}

impl Drop for BoundaryGuard {
    fn drop(&mut self) {
        if let Some(mut boundary) = self.boundary.take() {
            if let Err(e) = boundary.teardown() {
                log::warn!("Boundary teardown during unwind failed: {}", e);
            }
        }
    }
}

/// Turn a probe failure into the validation error the harness reports
pub fn unavailable(backend: &str, err: EvalError) -> EvalError {
    let detail = match err {
        EvalError::SandboxConstruction(detail) => detail,
        EvalError::Validation(ValidationFailure::SandboxUnavailable { detail, .. }) => detail,
        other => other.to_string(),
    };
    EvalError::Validation(ValidationFailure::SandboxUnavailable {
        backend: backend.to_string(),
        detail,
    })
}

/// Resolve the configured backend. `auto` probes cgroup first, then rootless.
pub fn select_backend(
    section: &SandboxSection,
    runtime: &RuntimeEnvelope,
) -> Result<Arc<dyn IsolationBackend>> {
    let cgroup = || {
        Arc::new(CgroupBackend::new(
            section.cgroup_root.clone(),
            section.sandbox_uid,
            section.sandbox_gid,
        ))
    };

    match section.backend {
        BackendKind::Cgroup => Ok(cgroup()),
        BackendKind::Rootless => Ok(Arc::new(RootlessBackend::new())),
        BackendKind::Container => Ok(Arc::new(ContainerBackend::new(
            section.container_image.clone(),
            section.sandbox_uid,
            section.sandbox_gid,
        ))),
        BackendKind::Auto => {
            let cgroup = cgroup();
            let cgroup_err = match cgroup.probe(runtime) {
                Ok(()) => {
                    log::info!("Auto-selected isolation backend: cgroup");
                    return Ok(cgroup);
                }
                Err(e) => e,
            };

            let rootless = Arc::new(RootlessBackend::new());
            match rootless.probe(runtime) {
                Ok(()) => {
                    log::info!(
                        "Auto-selected isolation backend: rootless (cgroup unavailable: {})",
                        cgroup_err
                    );
                    Ok(rootless)
                }
                Err(rootless_err) => Err(unavailable(
                    "auto",
                    EvalError::SandboxConstruction(format!(
                        "cgroup: {}; rootless: {}",
                        cgroup_err, rootless_err
                    )),
                )),
            }
        }
    }
}

/// Shared probe step: the interpreter must exist on the host
pub(crate) fn probe_interpreter(runtime: &RuntimeEnvelope) -> Result<()> {
    let path = Path::new(&runtime.interpreter);
    if !path.is_file() {
        return Err(EvalError::SandboxConstruction(format!(
            "interpreter {} not found",
            runtime.interpreter
        )));
    }
    Ok(())
}
