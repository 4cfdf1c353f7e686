/// Root-run backend: cgroup v2 limits, fresh namespaces, unprivileged credentials
use crate::config::presets::RuntimeEnvelope;
use crate::config::types::{EvalError, Result};
use crate::kernel::cgroup::{self as kcgroup, RunCgroup};
use crate::kernel::namespace::NamespaceSet;
use crate::kernel::rlimit::{self, RlimitPlan};
use crate::kernel::{capabilities, signal};
use crate::sandbox::backends::host_command;
use crate::sandbox::boundary::{
    probe_interpreter, BoundaryRequest, IsolationBackend, IsolationBoundary, LaunchSpec,
};
use nix::unistd::{setgroups, setresgid, setresuid, Gid, Uid};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

pub struct CgroupBackend {
    root: PathBuf,
    uid: u32,
    gid: u32,
}

impl CgroupBackend {
    pub fn new(root: PathBuf, uid: u32, gid: u32) -> Self {
        Self { root, uid, gid }
    }
}

impl IsolationBackend for CgroupBackend {
    fn name(&self) -> &'static str {
        "cgroup"
    }

    fn probe(&self, runtime: &RuntimeEnvelope) -> Result<()> {
        if !nix::unistd::geteuid().is_root() {
            return Err(EvalError::SandboxConstruction(
                "cgroup backend requires root".to_string(),
            ));
        }
        kcgroup::probe_v2(&self.root)?;
        probe_interpreter(runtime)
    }

    fn build(&self, request: &BoundaryRequest<'_>) -> Result<Box<dyn IsolationBoundary>> {
        let cgroup = RunCgroup::create(&self.root, request.run_id, request.policy)?;
        log::info!(
            "cgroup boundary {} ready (memory={}B pids={} cpu={})",
            cgroup.path().display(),
            request.policy.memory_limit_bytes,
            request.policy.max_processes,
            request.policy.cpu_share
        );

        Ok(Box::new(CgroupBoundary {
            cgroup,
            namespaces: NamespaceSet::privileged(request.policy.network_enabled),
            rlimits: RlimitPlan::file_only(request.policy),
            nice: request.policy.nice,
            uid: self.uid,
            gid: self.gid,
            torn_down: false,
        }))
    }
}

struct CgroupBoundary {
    cgroup: RunCgroup,
    namespaces: NamespaceSet,
    rlimits: RlimitPlan,
    nice: i32,
    uid: u32,
    gid: u32,
    torn_down: bool,
}

impl IsolationBoundary for CgroupBoundary {
    fn command(&self, launch: &LaunchSpec<'_>) -> Result<Command> {
        let mut cmd = host_command(launch);

        let procs_fd = self.cgroup.procs_fd();
        let namespaces = self.namespaces;
        let rlimits = self.rlimits;
        let nice = self.nice;
        let uid = Uid::from_raw(self.uid);
        let gid = Gid::from_raw(self.gid);

        // SAFETY: every step is a raw syscall on copied values; nothing allocates.
        // Order matters: join the cgroup and drop the bounding set while still root,
        // switch credentials, then set flags that a credential change would clear.
        unsafe {
            cmd.pre_exec(move || {
                signal::new_session()?;
                kcgroup::join_from_child(procs_fd)?;
                namespaces.apply()?;
                rlimits.apply()?;
                rlimit::apply_nice(nice)?;
                capabilities::drop_bounding_set()?;
                capabilities::clear_ambient()?;
                setgroups(&[]).map_err(io::Error::from)?;
                setresgid(gid, gid, gid).map_err(io::Error::from)?;
                setresuid(uid, uid, uid).map_err(io::Error::from)?;
                capabilities::set_no_new_privs()?;
                capabilities::set_parent_death_signal()?;
                Ok(())
            });
        }

        Ok(cmd)
    }

    fn kill_tree(&self, pid: u32) {
        signal::kill_process_group(pid);
        self.cgroup.kill_all();
    }

    fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        self.cgroup.destroy()
    }
}
