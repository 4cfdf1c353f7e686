/// Configuration loading from a JSON file
///
/// Every section defaults, so an empty object is a complete configuration.
use crate::config::presets::{RuntimeEnvelope, RuntimePresets};
use crate::config::types::{EvalError, Result};
use crate::exec::output::OutputLimits;
use crate::sandbox::boundary::BackendKind;
use crate::sandbox::policy::SandboxPolicy;
use crate::verdict::extractor::ExtractorLimits;
use crate::worker::pool::PoolConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming a config file when `--config` is absent
pub const CONFIG_ENV_VAR: &str = "EVALBOX_CONFIG";

/// Full evalbox configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalboxConfig {
    pub sandbox: SandboxSection,
    pub runtime: RuntimeSection,
    pub output: OutputLimits,
    pub extractor: ExtractorLimits,
    pub worker: PoolConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub backend: BackendKind,
    pub policy: SandboxPolicy,
    /// Image used by the container backend
    pub container_image: String,
    /// Parent cgroup the cgroup backend creates run groups under
    pub cgroup_root: PathBuf,
    /// Unprivileged identity the payload runs as (cgroup and container backends)
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            policy: SandboxPolicy::default(),
            container_image: "python:3.11-slim".to_string(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/evalbox"),
            sandbox_uid: 65534,
            sandbox_gid: 65534,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Runtime envelope id
    pub preset: String,
    /// Overrides the preset interpreter path
    pub interpreter: Option<String>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            preset: "python3-v1".to_string(),
            interpreter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding jobs, results and the durable leaderboard
    pub database_path: PathBuf,
    /// Root of the content-addressed object store
    pub object_root: PathBuf,
    /// Parent of the per-run staging roots
    pub workspace_root: PathBuf,
    /// Serve leaderboard reads from the in-memory ranking cache
    pub cache_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("/var/lib/evalbox/evalbox.db"),
            object_root: PathBuf::from("/var/lib/evalbox/objects"),
            workspace_root: std::env::temp_dir().join("evalbox"),
            cache_enabled: true,
        }
    }
}

impl EvalboxConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EvalError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| EvalError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    /// Explicit path first, then `EVALBOX_CONFIG`, then built-in defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            log::info!("Loading config from {}", path.display());
            return Self::load_from_file(path);
        }

        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) if !path.is_empty() => {
                log::info!("Loading config from ${} ({:?})", CONFIG_ENV_VAR, path);
                Self::load_from_file(PathBuf::from(path))
            }
            _ => {
                log::debug!("No config file given, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Resolve the configured runtime preset, applying the interpreter override
    pub fn runtime_envelope(&self) -> Result<RuntimeEnvelope> {
        let presets = RuntimePresets::new();
        let mut envelope = presets.get(&self.runtime.preset).cloned().ok_or_else(|| {
            EvalError::Config(format!(
                "Unknown runtime preset '{}' (available: {})",
                self.runtime.preset,
                presets.list_ids().join(", ")
            ))
        })?;

        if let Some(interpreter) = &self.runtime.interpreter {
            envelope.interpreter = interpreter.clone();
        }

        Ok(envelope)
    }
}
