/// Container backend driven through the docker CLI
///
/// The staged root is bind-mounted read-only at `/sandbox`; the only writable
/// path is a private tmpfs at `/tmp`, which also serves as `HOME` and `TMPDIR`.
use crate::config::presets::RuntimeEnvelope;
use crate::config::types::{EvalError, Result};
use crate::kernel::signal;
use crate::sandbox::boundary::{BoundaryRequest, IsolationBackend, IsolationBoundary, LaunchSpec};
use crate::sandbox::policy::SandboxPolicy;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

const DOCKER: &str = "docker";
const MOUNT_POINT: &str = "/sandbox";
const SCRATCH: &str = "/tmp";

pub struct ContainerBackend {
    image: String,
    uid: u32,
    gid: u32,
    daemon_probe: OnceLock<std::result::Result<(), String>>,
}

impl ContainerBackend {
    pub fn new(image: String, uid: u32, gid: u32) -> Self {
        Self {
            image,
            uid,
            gid,
            daemon_probe: OnceLock::new(),
        }
    }

    fn probe_daemon(image: &str) -> std::result::Result<(), String> {
        let version = Command::new(DOCKER)
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| format!("docker CLI not available: {}", e))?;
        if !version.status.success() {
            return Err(format!(
                "docker daemon unreachable: {}",
                String::from_utf8_lossy(&version.stderr).trim()
            ));
        }

        let inspect = Command::new(DOCKER)
            .args(["image", "inspect", "--format", "{{.Id}}", image])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| format!("docker image inspect failed: {}", e))?;
        if !inspect.status.success() {
            return Err(format!("image {} not present locally", image));
        }

        log::info!(
            "docker daemon {} available with image {}",
            String::from_utf8_lossy(&version.stdout).trim(),
            image
        );
        Ok(())
    }
}

impl IsolationBackend for ContainerBackend {
    fn name(&self) -> &'static str {
        "container"
    }

    fn probe(&self, _runtime: &RuntimeEnvelope) -> Result<()> {
        self.daemon_probe
            .get_or_init(|| Self::probe_daemon(&self.image))
            .clone()
            .map_err(EvalError::SandboxConstruction)
    }

    fn build(&self, request: &BoundaryRequest<'_>) -> Result<Box<dyn IsolationBoundary>> {
        let root = request.root.canonicalize().map_err(|e| {
            EvalError::SandboxConstruction(format!(
                "cannot resolve staged root {}: {}",
                request.root.display(),
                e
            ))
        })?;

        Ok(Box::new(ContainerBoundary {
            name: format!("evalbox-{}", request.run_id),
            image: self.image.clone(),
            policy: request.policy.clone(),
            root,
            uid: self.uid,
            gid: self.gid,
            torn_down: false,
        }))
    }
}

struct ContainerBoundary {
    name: String,
    image: String,
    policy: SandboxPolicy,
    root: PathBuf,
    uid: u32,
    gid: u32,
    torn_down: bool,
}

impl ContainerBoundary {
    fn run_args(&self, launch: &LaunchSpec<'_>) -> Vec<String> {
        let policy = &self.policy;
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            self.name.clone(),
        ];

        if !policy.network_enabled {
            args.push("--network".to_string());
            args.push("none".to_string());
        }

        args.extend([
            "--memory".into(),
            format!("{}b", policy.memory_limit_bytes),
            "--memory-swap".into(),
            format!("{}b", policy.memory_limit_bytes),
            "--pids-limit".into(),
            policy.max_processes.to_string(),
            "--cpus".into(),
            policy.docker_cpus(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--read-only".into(),
            "--tmpfs".into(),
            format!("{}:rw,nosuid,nodev,size=64m,mode=1777", SCRATCH),
            "--ulimit".into(),
            format!("nofile={}:{}", policy.max_open_files, policy.max_open_files),
            "--ulimit".into(),
            format!(
                "fsize={}:{}",
                policy.max_file_size_bytes, policy.max_file_size_bytes
            ),
            "--user".into(),
            format!("{}:{}", self.uid, self.gid),
            "--volume".into(),
            format!("{}:{}:ro", self.root.display(), MOUNT_POINT),
            "--workdir".into(),
            MOUNT_POINT.into(),
        ]);

        for (key, value) in launch.env {
            let value = match key.as_str() {
                "HOME" | "TMPDIR" => SCRATCH,
                _ => value.as_str(),
            };
            args.extend(["--env".into(), format!("{}={}", key, value)]);
        }

        args.push(self.image.clone());

        // Host interpreter paths do not carry over; resolve by name inside the image
        let program = Path::new(launch.program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| launch.program.to_string());
        args.push(program);
        args.extend(launch.args.iter().cloned());
        args
    }

    fn docker_quiet(&self, args: &[&str]) -> std::io::Result<std::process::Output> {
        Command::new(DOCKER)
            .args(args)
            .stdin(Stdio::null())
            .output()
    }
}

impl IsolationBoundary for ContainerBoundary {
    fn command(&self, launch: &LaunchSpec<'_>) -> Result<Command> {
        let mut cmd = Command::new(DOCKER);
        cmd.args(self.run_args(launch))
            .current_dir(launch.workdir)
            .stdin(Stdio::null());

        // SAFETY: setsid is async-signal-safe.
        unsafe {
            cmd.pre_exec(signal::new_session);
        }

        if self.policy.nice != 0 {
            log::debug!("nice hint {} not applied by the container backend", self.policy.nice);
        }
        Ok(cmd)
    }

    fn kill_tree(&self, pid: u32) {
        match self.docker_quiet(&["kill", &self.name]) {
            Ok(output) if output.status.success() => {
                log::info!("Killed container {}", self.name)
            }
            Ok(_) => log::debug!("Container {} already stopped", self.name),
            Err(e) => log::warn!("docker kill {} failed: {}", self.name, e),
        }
        signal::kill_process_group(pid);
    }

    fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        let output = self
            .docker_quiet(&["rm", "--force", &self.name])
            .map_err(|e| EvalError::SandboxConstruction(format!("docker rm failed: {}", e)))?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            return Ok(());
        }
        Err(EvalError::SandboxConstruction(format!(
            "failed to remove container {}: {}",
            self.name,
            stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_carry_every_limit() {
        let boundary = ContainerBoundary {
            name: "evalbox-test".to_string(),
            image: "python:3.11-slim".to_string(),
            policy: SandboxPolicy::default(),
            root: PathBuf::from("/var/tmp/run"),
            uid: 65534,
            gid: 65534,
            torn_down: false,
        };
        let argv = vec!["-u".to_string(), "submission.py".to_string(), "Pong".to_string()];
        let env = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("HOME".to_string(), "/var/tmp/run/scratch".to_string()),
        ];
        let launch = LaunchSpec {
            program: "/usr/bin/python3",
            args: &argv,
            workdir: Path::new("/var/tmp/run"),
            env: &env,
        };

        let args = boundary.run_args(&launch);
        let joined = args.join(" ");
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--memory 536870912b"));
        assert!(joined.contains("--pids-limit 50"));
        assert!(joined.contains("--cpus 0.50"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--security-opt no-new-privileges"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("/var/tmp/run:/sandbox:ro"));
        assert!(joined.contains("--env HOME=/tmp"));
        assert!(joined.ends_with("python:3.11-slim python3 -u submission.py Pong"));
    }

    #[test]
    fn test_network_flag_omitted_when_enabled() {
        let mut policy = SandboxPolicy::default();
        policy.network_enabled = true;
        let boundary = ContainerBoundary {
            name: "evalbox-net".to_string(),
            image: "img".to_string(),
            policy,
            root: PathBuf::from("/r"),
            uid: 1000,
            gid: 1000,
            torn_down: false,
        };
        let launch = LaunchSpec {
            program: "python3",
            args: &[],
            workdir: Path::new("/r"),
            env: &[],
        };
        assert!(!boundary.run_args(&launch).iter().any(|a| a == "--network"));
    }
}
