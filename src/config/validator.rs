// Config validation
// Runs once at startup; errors are fatal, warnings are logged and the run proceeds.

use crate::config::loader::EvalboxConfig;
use crate::config::types::{EvalError, Result};
use crate::sandbox::boundary::BackendKind;

/// Validation report with detailed errors
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate config at startup.
/// Returns the report when only warnings were found.
pub fn validate_config(config: &EvalboxConfig) -> Result<ValidationReport> {
    let mut report = ValidationReport::new();

    validate_policy(config, &mut report);
    validate_output(config, &mut report);
    validate_worker(config, &mut report);
    validate_storage(config, &mut report);
    validate_runtime(config, &mut report);

    for warning in &report.warnings {
        log::warn!("config: {}", warning);
    }

    if !report.is_valid() {
        return Err(EvalError::Config(format!(
            "Config validation failed:\n{}",
            report.errors.join("\n")
        )));
    }

    Ok(report)
}

fn validate_policy(config: &EvalboxConfig, report: &mut ValidationReport) {
    let policy = &config.sandbox.policy;

    if policy.wall_timeout_ms == 0 {
        report.add_error("sandbox.policy.wall_timeout_ms cannot be zero".to_string());
    }

    if policy.memory_limit_bytes == 0 {
        report.add_error("sandbox.policy.memory_limit_bytes cannot be zero".to_string());
    } else if policy.memory_limit_bytes < 32 * 1024 * 1024 {
        report.add_warning(format!(
            "sandbox.policy.memory_limit_bytes {} is very low (< 32MB), interpreters may not start",
            policy.memory_limit_bytes
        ));
    }

    if !policy.cpu_share.is_finite() || policy.cpu_share <= 0.0 {
        report.add_error(format!(
            "sandbox.policy.cpu_share must be a positive number, got {}",
            policy.cpu_share
        ));
    } else if policy.cpu_share > 64.0 {
        report.add_warning(format!(
            "sandbox.policy.cpu_share {} exceeds any realistic host",
            policy.cpu_share
        ));
    }

    if policy.max_processes == 0 {
        report.add_error("sandbox.policy.max_processes cannot be zero".to_string());
    }

    if policy.max_open_files < 16 {
        report.add_error(format!(
            "sandbox.policy.max_open_files {} is too low for an interpreter",
            policy.max_open_files
        ));
    }

    if !(-20..=19).contains(&policy.nice) {
        report.add_error(format!(
            "sandbox.policy.nice {} outside -20..=19",
            policy.nice
        ));
    } else if policy.nice < 0 {
        report.add_warning("sandbox.policy.nice below zero needs CAP_SYS_NICE".to_string());
    }

    if policy.network_enabled {
        report.add_warning(
            "sandbox.policy.network_enabled is on: submissions can reach the network".to_string(),
        );
    }

    if config.sandbox.backend == BackendKind::Container && config.sandbox.container_image.is_empty()
    {
        report.add_error("sandbox.container_image must be set for the container backend".to_string());
    }

    if !config.sandbox.cgroup_root.is_absolute() {
        report.add_error(format!(
            "sandbox.cgroup_root must be absolute path: {:?}",
            config.sandbox.cgroup_root
        ));
    }

    if config.sandbox.sandbox_uid == 0 || config.sandbox.sandbox_gid == 0 {
        report.add_error("sandbox.sandbox_uid/gid must not be root".to_string());
    }
}

fn validate_output(config: &EvalboxConfig, report: &mut ValidationReport) {
    if config.output.max_stdout_bytes == 0 || config.output.max_stderr_bytes == 0 {
        report.add_error("output byte ceilings cannot be zero".to_string());
    }

    if config.extractor.max_line_bytes > config.output.max_stdout_bytes {
        report.add_warning(format!(
            "extractor.max_line_bytes ({}) exceeds output.max_stdout_bytes ({})",
            config.extractor.max_line_bytes, config.output.max_stdout_bytes
        ));
    }

    if config.extractor.tail_lines == 0 {
        report.add_warning("extractor.tail_lines is zero: failures carry no diagnostics".to_string());
    }
}

fn validate_worker(config: &EvalboxConfig, report: &mut ValidationReport) {
    if config.worker.slots == 0 {
        report.add_error("worker.slots cannot be zero".to_string());
    }

    if config.worker.max_deliveries == 0 {
        report.add_error("worker.max_deliveries cannot be zero".to_string());
    }

    if config.worker.queue_capacity == 0 {
        report.add_error("worker.queue_capacity cannot be zero".to_string());
    }
}

fn validate_storage(config: &EvalboxConfig, report: &mut ValidationReport) {
    let storage = &config.storage;

    for (name, path) in [
        ("storage.object_root", &storage.object_root),
        ("storage.workspace_root", &storage.workspace_root),
    ] {
        if !path.is_absolute() {
            report.add_error(format!("{} must be absolute path: {:?}", name, path));
        }
    }

    if let Some(parent) = storage.database_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            report.add_warning(format!(
                "storage.database_path parent does not exist yet: {:?}",
                parent
            ));
        }
    }

    if !storage.cache_enabled {
        report.add_warning("leaderboard cache disabled: every query hits the database".to_string());
    }
}

fn validate_runtime(config: &EvalboxConfig, report: &mut ValidationReport) {
    match config.runtime_envelope() {
        Ok(envelope) => {
            if !std::path::Path::new(&envelope.interpreter).is_absolute() {
                report.add_error(format!(
                    "runtime interpreter must be absolute path: {}",
                    envelope.interpreter
                ));
            }
        }
        Err(e) => report.add_error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let report = validate_config(&EvalboxConfig::default()).expect("default config valid");
        assert!(report.is_valid());
    }

    #[test]
    fn test_zero_limits_are_errors() {
        let mut config = EvalboxConfig::default();
        config.sandbox.policy.wall_timeout_ms = 0;
        config.sandbox.policy.max_processes = 0;
        config.worker.slots = 0;

        let err = validate_config(&config).expect_err("must reject");
        let message = err.to_string();
        assert!(message.contains("wall_timeout_ms"));
        assert!(message.contains("max_processes"));
        assert!(message.contains("worker.slots"));
    }

    #[test]
    fn test_network_enabled_is_only_a_warning() {
        let mut config = EvalboxConfig::default();
        config.sandbox.policy.network_enabled = true;

        let report = validate_config(&config).expect("still valid");
        assert!(report.warnings.iter().any(|w| w.contains("network")));
    }

    #[test]
    fn test_root_sandbox_identity_rejected() {
        let mut config = EvalboxConfig::default();
        config.sandbox.sandbox_uid = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_nan_cpu_share_rejected() {
        let mut config = EvalboxConfig::default();
        config.sandbox.policy.cpu_share = f64::NAN;
        assert!(validate_config(&config).is_err());
    }
}
