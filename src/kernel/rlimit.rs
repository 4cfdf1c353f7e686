//! Resource limits applied in the child before exec.
use crate::sandbox::policy::SandboxPolicy;
use std::io;

#[cfg(target_env = "gnu")]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(target_env = "gnu"))]
type Resource = libc::c_int;

/// Set soft and hard limit to the same value.
pub fn apply_rlimit(resource: Resource, value: u64) -> io::Result<()> {
    apply_rlimit_pair(resource, value, value)
}

pub fn apply_rlimit_pair(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };

    // SAFETY: setrlimit reads a fully initialised struct.
    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Which policy-derived rlimits a backend wants applied
#[derive(Debug, Clone, Copy)]
pub struct RlimitPlan {
    pub address_space: Option<u64>,
    pub processes: Option<u64>,
    pub cpu_seconds: Option<u64>,
    pub open_files: u64,
    pub file_size: u64,
}

impl RlimitPlan {
    /// Full plan for backends with no kernel accounting of their own
    pub fn full(policy: &SandboxPolicy) -> Self {
        Self {
            address_space: Some(policy.memory_limit_bytes),
            processes: Some(policy.max_processes as u64),
            cpu_seconds: Some(policy.cpu_backstop_secs()),
            open_files: policy.max_open_files,
            file_size: policy.max_file_size_bytes,
        }
    }

    /// Plan for backends where the cgroup already caps memory, pids and cpu
    pub fn file_only(policy: &SandboxPolicy) -> Self {
        Self {
            address_space: None,
            processes: None,
            cpu_seconds: None,
            open_files: policy.max_open_files,
            file_size: policy.max_file_size_bytes,
        }
    }

    /// Apply in the child. Async-signal-safe.
    pub fn apply(&self) -> io::Result<()> {
        if let Some(bytes) = self.address_space {
            apply_rlimit(libc::RLIMIT_AS, bytes)?;
        }
        if let Some(count) = self.processes {
            apply_rlimit(libc::RLIMIT_NPROC, count)?;
        }
        if let Some(secs) = self.cpu_seconds {
            // SIGXCPU at the soft limit, SIGKILL a second later
            apply_rlimit_pair(libc::RLIMIT_CPU, secs, secs + 1)?;
        }
        apply_rlimit(libc::RLIMIT_NOFILE, self.open_files)?;
        apply_rlimit(libc::RLIMIT_FSIZE, self.file_size)?;
        apply_rlimit(libc::RLIMIT_CORE, 0)?;
        Ok(())
    }
}

/// Lower scheduling priority by `increment`. Best effort: the kernel may clamp.
pub fn apply_nice(increment: i32) -> io::Result<()> {
    if increment == 0 {
        return Ok(());
    }
    // nice(2) can legitimately return -1, so errno is cleared first.
    // SAFETY: errno location is thread-local; nice takes an int.
    unsafe {
        *libc::__errno_location() = 0;
        let rc = libc::nice(increment);
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error().unwrap_or(0) != 0 {
                return Err(err);
            }
        }
    }
    Ok(())
}
