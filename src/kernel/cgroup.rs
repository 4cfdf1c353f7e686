/// Cgroup v2 run groups
///
/// One directory per run under a configured parent. The child joins by writing
/// to a `cgroup.procs` descriptor opened by the parent before fork, so nothing
/// between fork and exec has to resolve paths or allocate.
use crate::config::types::{EvalError, Result};
use crate::sandbox::policy::SandboxPolicy;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

const REMOVE_ATTEMPTS: u32 = 20;
const REMOVE_BACKOFF: Duration = Duration::from_millis(25);

/// Whether `root` sits on a cgroup v2 hierarchy with the controllers we need
pub fn probe_v2(root: &Path) -> Result<()> {
    let mount_root = Path::new("/sys/fs/cgroup");
    if !mount_root.join("cgroup.controllers").exists() {
        return Err(EvalError::SandboxConstruction(
            "cgroup v2 unified hierarchy not mounted at /sys/fs/cgroup".to_string(),
        ));
    }

    fs::create_dir_all(root).map_err(|e| {
        EvalError::SandboxConstruction(format!("cannot create cgroup parent {}: {}", root.display(), e))
    })?;

    let controllers = fs::read_to_string(root.join("cgroup.controllers")).map_err(|e| {
        EvalError::SandboxConstruction(format!("{} is not a cgroup v2 directory: {}", root.display(), e))
    })?;

    for needed in ["memory", "pids", "cpu"] {
        if !controllers.split_whitespace().any(|c| c == needed) {
            return Err(EvalError::SandboxConstruction(format!(
                "cgroup controller '{}' not delegated to {}",
                needed,
                root.display()
            )));
        }
    }

    enable_subtree_controllers(root)?;
    Ok(())
}

/// Make memory/pids/cpu available to the run groups below `root`
fn enable_subtree_controllers(root: &Path) -> Result<()> {
    let control = root.join("cgroup.subtree_control");
    let current = fs::read_to_string(&control).unwrap_or_default();
    for controller in ["memory", "pids", "cpu"] {
        if current.split_whitespace().any(|c| c == controller) {
            continue;
        }
        fs::write(&control, format!("+{}", controller)).map_err(|e| {
            EvalError::SandboxConstruction(format!(
                "failed to enable {} controller in {}: {}",
                controller,
                control.display(),
                e
            ))
        })?;
    }
    Ok(())
}

/// A cgroup created for exactly one run
#[derive(Debug)]
pub struct RunCgroup {
    path: PathBuf,
    procs: File,
}

impl RunCgroup {
    /// Create the group and write every limit before any process joins
    pub fn create(root: &Path, run_id: &str, policy: &SandboxPolicy) -> Result<Self> {
        let path = root.join(format!("run-{}", run_id));
        fs::create_dir(&path).map_err(|e| {
            EvalError::SandboxConstruction(format!("failed to create cgroup {}: {}", path.display(), e))
        })?;

        let limits = [
            ("memory.max", policy.memory_limit_bytes.to_string()),
            ("memory.swap.max", "0".to_string()),
            ("pids.max", policy.max_processes.to_string()),
            ("cpu.max", {
                let (quota, period) = policy.cpu_max();
                format!("{} {}", quota, period)
            }),
        ];

        for (file, value) in &limits {
            if let Err(e) = fs::write(path.join(file), value) {
                // memory.swap.max is absent when swap accounting is off
                if *file == "memory.swap.max" && e.kind() == io::ErrorKind::NotFound {
                    log::debug!("memory.swap.max not available, swap accounting disabled");
                    continue;
                }
                let _ = fs::remove_dir(&path);
                return Err(EvalError::SandboxConstruction(format!(
                    "failed to set {}={} on {}: {}",
                    file,
                    value,
                    path.display(),
                    e
                )));
            }
        }

        if path.join("memory.oom.group").exists() {
            if let Err(e) = fs::write(path.join("memory.oom.group"), "1") {
                log::warn!("Failed to set memory.oom.group: {}", e);
            }
        }

        let procs = OpenOptions::new()
            .write(true)
            .open(path.join("cgroup.procs"))
            .map_err(|e| {
                let _ = fs::remove_dir(&path);
                EvalError::SandboxConstruction(format!("failed to open cgroup.procs: {}", e))
            })?;

        log::debug!("Created run cgroup {}", path.display());
        Ok(Self { path, procs })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Descriptor the child writes "0" to in order to join
    pub fn procs_fd(&self) -> RawFd {
        self.procs.as_raw_fd()
    }

    /// Kill every member. Falls back to nothing on kernels without `cgroup.kill`.
    pub fn kill_all(&self) {
        let kill = self.path.join("cgroup.kill");
        if kill.exists() {
            if let Err(e) = fs::write(&kill, "1") {
                log::warn!("Failed to write {}: {}", kill.display(), e);
            }
        }
    }

    /// Kill members and remove the directory, retrying while the kernel reaps them.
    pub fn destroy(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        self.kill_all();

        let mut last_error = None;
        for _ in 0..REMOVE_ATTEMPTS {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    last_error = Some(e);
                    std::thread::sleep(REMOVE_BACKOFF);
                }
            }
        }

        Err(EvalError::SandboxConstruction(format!(
            "failed to remove cgroup {}: {}",
            self.path.display(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

/// Join the cgroup from the child. Async-signal-safe.
pub fn join_from_child(procs_fd: RawFd) -> io::Result<()> {
    let pid = b"0";
    // SAFETY: writing two bytes from a static buffer to a descriptor the parent keeps open.
    let rc = unsafe { libc::write(procs_fd, pid.as_ptr() as *const libc::c_void, pid.len()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_rejects_plain_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Either the host has no v2 mount or the tempdir is no cgroup: both must fail
        assert!(probe_v2(dir.path()).is_err());
    }

    #[test]
    fn test_join_from_child_reports_bad_descriptor() {
        assert!(join_from_child(-1).is_err());
    }
}
