/// Unprivileged backend: user + network + ipc namespaces with rlimits
///
/// `RLIMIT_NPROC` is accounted per host uid, so on a busy account the process
/// ceiling also counts the operator's own processes. Use the cgroup backend
/// where exact process accounting matters.
use crate::config::presets::RuntimeEnvelope;
use crate::config::types::{EvalError, Result};
use crate::kernel::namespace::{self, NamespaceSet};
use crate::kernel::rlimit::{self, RlimitPlan};
use crate::kernel::{capabilities, signal};
use crate::sandbox::backends::host_command;
use crate::sandbox::boundary::{
    probe_interpreter, BoundaryRequest, IsolationBackend, IsolationBoundary, LaunchSpec,
};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

pub struct RootlessBackend {
    userns_probe: OnceLock<std::result::Result<(), String>>,
}

impl RootlessBackend {
    pub fn new() -> Self {
        Self {
            userns_probe: OnceLock::new(),
        }
    }

    /// Actually unshare in a throwaway child; sysctls alone miss LSM denials
    fn probe_user_namespaces() -> std::result::Result<(), String> {
        if let Some(reason) = namespace::unprivileged_userns_blocker() {
            return Err(format!("user namespaces disabled: {}", reason));
        }

        let namespaces = NamespaceSet::rootless(false);
        let mut cmd = Command::new("true");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: unshare is a single syscall.
        unsafe {
            cmd.pre_exec(move || namespaces.apply());
        }

        match cmd.status() {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(format!("namespace probe exited with {}", status)),
            Err(e) => Err(format!("cannot create user namespace: {}", e)),
        }
    }
}

impl Default for RootlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IsolationBackend for RootlessBackend {
    fn name(&self) -> &'static str {
        "rootless"
    }

    fn probe(&self, runtime: &RuntimeEnvelope) -> Result<()> {
        self.userns_probe
            .get_or_init(Self::probe_user_namespaces)
            .clone()
            .map_err(EvalError::SandboxConstruction)?;
        probe_interpreter(runtime)
    }

    fn build(&self, request: &BoundaryRequest<'_>) -> Result<Box<dyn IsolationBoundary>> {
        let namespaces = NamespaceSet::rootless(request.policy.network_enabled);
        log::info!(
            "rootless boundary for run {} (namespaces: {})",
            request.run_id,
            namespaces.names().join(",")
        );

        Ok(Box::new(RootlessBoundary {
            namespaces,
            rlimits: RlimitPlan::full(request.policy),
            nice: request.policy.nice,
        }))
    }
}

struct RootlessBoundary {
    namespaces: NamespaceSet,
    rlimits: RlimitPlan,
    nice: i32,
}

impl IsolationBoundary for RootlessBoundary {
    fn command(&self, launch: &LaunchSpec<'_>) -> Result<Command> {
        let mut cmd = host_command(launch);

        let namespaces = self.namespaces;
        let rlimits = self.rlimits;
        let nice = self.nice;

        // SAFETY: raw syscalls on copied values only.
        // The user namespace is entered first; the bounding-set drop relies on it.
        unsafe {
            cmd.pre_exec(move || {
                signal::new_session()?;
                namespaces.apply()?;
                rlimits.apply()?;
                rlimit::apply_nice(nice)?;
                capabilities::drop_bounding_set()?;
                capabilities::clear_ambient()?;
                capabilities::set_no_new_privs()?;
                capabilities::set_parent_death_signal()?;
                Ok(())
            });
        }

        Ok(cmd)
    }

    fn kill_tree(&self, pid: u32) {
        signal::kill_process_group(pid);
    }

    fn teardown(&mut self) -> Result<()> {
        Ok(())
    }
}
