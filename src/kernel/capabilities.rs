//! Capability and privilege minimisation for the sandboxed child.
//!
//! These run between fork and exec, so they only make raw syscalls and
//! report through `io::Result`: no allocation, no logging, no locks.
use std::io;

/// Highest capability number the drop loop walks.
/// Unknown numbers are rejected by the kernel and ignored here.
pub const MAX_CAP: libc::c_ulong = 63;

/// Clear every capability from the bounding set so no later exec can regain it.
pub fn drop_bounding_set() -> io::Result<()> {
    for cap in 0..=MAX_CAP {
        // SAFETY: PR_CAPBSET_DROP with any number is safe; EINVAL for unknown caps.
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINVAL) => continue,
                _ => return Err(err),
            }
        }
    }
    Ok(())
}

/// Clear the ambient set. Kernels without ambient support return EINVAL, which is fine.
pub fn clear_ambient() -> io::Result<()> {
    // SAFETY: plain prctl with integer arguments.
    let rc = unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL,
            0,
            0,
            0,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINVAL) {
            return Err(err);
        }
    }
    Ok(())
}

/// Prevent privilege escalation via execve (setuid bits, file capabilities).
/// Idempotent and irreversible once set.
pub fn set_no_new_privs() -> io::Result<()> {
    // SAFETY: prctl(PR_SET_NO_NEW_PRIVS, 1) is safe and idempotent.
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Kill this process when the supervising parent dies.
pub fn set_parent_death_signal() -> io::Result<()> {
    // SAFETY: plain prctl with integer arguments.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Whether the calling process already has `no_new_privs` set.
pub fn no_new_privs_set() -> bool {
    // SAFETY: read-only prctl.
    unsafe { libc::prctl(libc::PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) == 1 }
}
