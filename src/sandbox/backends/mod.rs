//! Isolation backends
//!
//! - [`cgroup`]: root + cgroup v2, unshared namespaces, unprivileged uid
//! - [`rootless`]: unprivileged user namespace + rlimits
//! - [`container`]: docker CLI with the same limits expressed as run flags

pub mod cgroup;
pub mod container;
pub mod rootless;

pub use cgroup::CgroupBackend;
pub use container::ContainerBackend;
pub use rootless::RootlessBackend;

use crate::sandbox::boundary::LaunchSpec;
use std::process::{Command, Stdio};

/// Host-side launch: cleared environment, staged root as cwd, stdin closed
pub(crate) fn host_command(launch: &LaunchSpec<'_>) -> Command {
    let mut cmd = Command::new(launch.program);
    cmd.args(launch.args)
        .current_dir(launch.workdir)
        .env_clear()
        .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null());
    cmd
}
