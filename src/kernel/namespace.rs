/// Namespace isolation for the sandboxed child
/// Unsharing happens in the child between fork and exec, so the parent is never moved.
use nix::sched::{unshare, CloneFlags};
use std::io;

/// Namespaces a backend asks the child to leave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceSet {
    pub user: bool,
    pub network: bool,
    pub ipc: bool,
    pub mount: bool,
}

impl NamespaceSet {
    /// Root-run sandbox: no user namespace, kernel credentials change instead
    pub fn privileged(network_enabled: bool) -> Self {
        Self {
            user: false,
            network: !network_enabled,
            ipc: true,
            mount: true,
        }
    }

    /// Unprivileged sandbox: the user namespace grants the rights for the rest
    pub fn rootless(network_enabled: bool) -> Self {
        Self {
            user: true,
            network: !network_enabled,
            ipc: true,
            mount: false,
        }
    }

    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        flags
    }

    /// Unshare every requested namespace in one call so the user namespace,
    /// when present, is created first and authorises the others.
    pub fn apply(&self) -> io::Result<()> {
        let flags = self.clone_flags();
        if flags.is_empty() {
            return Ok(());
        }
        unshare(flags).map_err(io::Error::from)?;
        if self.mount {
            make_mounts_private()?;
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.user {
            names.push("user");
        }
        if self.network {
            names.push("net");
        }
        if self.ipc {
            names.push("ipc");
        }
        if self.mount {
            names.push("mnt");
        }
        names
    }
}

/// mount(NULL, "/", NULL, MS_REC | MS_PRIVATE, NULL) so nothing done inside
/// the new mount namespace propagates back to the host.
fn make_mounts_private() -> io::Result<()> {
    let root = b"/\0";
    // SAFETY: static NUL-terminated path, null source/fstype/data.
    let rc = unsafe {
        libc::mount(
            std::ptr::null(),
            root.as_ptr() as *const libc::c_char,
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Check if namespace isolation is visible on this system at all
pub fn namespaces_supported() -> bool {
    std::fs::read_dir("/proc/self/ns").is_ok()
}

/// Host-level knobs that disable unprivileged user namespaces.
/// Returns a reason when one of them is off.
pub fn unprivileged_userns_blocker() -> Option<String> {
    if let Ok(value) = std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone") {
        if value.trim() == "0" {
            return Some("kernel.unprivileged_userns_clone = 0".to_string());
        }
    }
    if let Ok(value) = std::fs::read_to_string("/proc/sys/user/max_user_namespaces") {
        if value.trim() == "0" {
            return Some("user.max_user_namespaces = 0".to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_namespace_follows_policy() {
        assert!(NamespaceSet::privileged(false).network);
        assert!(!NamespaceSet::privileged(true).network);
        assert!(NamespaceSet::rootless(false).user);
    }

    #[test]
    fn test_clone_flags_match_names() {
        let set = NamespaceSet::rootless(false);
        let flags = set.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNS));
        assert_eq!(set.names(), vec!["user", "net", "ipc"]);
    }

    #[test]
    fn test_empty_set_is_noop() {
        let set = NamespaceSet {
            user: false,
            network: false,
            ipc: false,
            mount: false,
        };
        assert!(set.apply().is_ok());
    }
}
